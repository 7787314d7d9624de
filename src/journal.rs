use chrono::{DateTime, Local};
use log::info;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{io::Write, path::PathBuf};

use crate::error::ScanError;
use crate::stability::StabilitySummary;

/// One equilibration attempt as written to the journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquilibrationRecord {
    pub timestamp: DateTime<Local>,
    pub device: String,
    pub setpoint: f64,
    pub attempt: u32,
    #[serde(flatten)]
    pub summary: StabilitySummary,
}

/// Buffered JSON-lines writer
///
/// Entries are appended to the file once `buffer_size` of them have
/// accumulated, and on drop. A failing flush keeps the buffer and is only
/// reported as an error after `max_flush_failures` failures in a row, so a
/// briefly unavailable disk never stops a running scan.
#[derive(Debug)]
pub struct Journal<T>
where
    T: Serialize + DeserializeOwned,
{
    buffer: Vec<T>,
    buffer_size: usize,
    file_path: PathBuf,
    flush_failures: usize,
    max_flush_failures: usize,
}

impl<T> Journal<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new<P: Into<PathBuf>>(file_path: P, buffer_size: usize) -> Self {
        let mut path = file_path.into();
        if path.extension() != Some(std::ffi::OsStr::new("jsonl")) {
            path.set_extension("jsonl");
        }

        Self {
            buffer: Vec::with_capacity(buffer_size.max(1)),
            buffer_size: buffer_size.max(1),
            file_path: path,
            flush_failures: 0,
            max_flush_failures: 10,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.file_path
    }

    pub fn add(&mut self, entry: T) -> Result<(), ScanError> {
        self.buffer.push(entry);
        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), ScanError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        match self.append_buffer() {
            Ok(()) => {
                self.flush_failures = 0;
                self.buffer.clear();
                info!("Journal flushed to {:?}", self.file_path);
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                log::error!(
                    "Journal flush failure {}/{}: {}",
                    self.flush_failures,
                    self.max_flush_failures,
                    e
                );
                if self.flush_failures >= self.max_flush_failures {
                    return Err(ScanError::Io {
                        source: std::io::Error::other(e.to_string()),
                        context: format!(
                            "{} consecutive journal flush failures for {:?}",
                            self.flush_failures, self.file_path
                        ),
                    });
                }
                Ok(())
            }
        }
    }

    fn append_buffer(&self) -> Result<(), ScanError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .map_err(|source| ScanError::Io {
                source,
                context: format!("Could not open journal {:?}", self.file_path),
            })?;

        let mut writer = std::io::BufWriter::new(file);
        for entry in &self.buffer {
            writeln!(writer, "{}", serde_json::to_string(entry)?)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read every entry back from the journal file
    pub fn read_all(&self) -> Result<Vec<T>, ScanError> {
        let content = std::fs::read_to_string(&self.file_path).map_err(|source| ScanError::Io {
            source,
            context: format!("Could not read journal {:?}", self.file_path),
        })?;

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(ScanError::from))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl<T> Drop for Journal<T>
where
    T: Serialize + DeserializeOwned,
{
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Journal of equilibration attempts
pub type EquilibrationJournal = Journal<EquilibrationRecord>;

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(chamber_avg: f64, in_tolerance: bool) -> StabilitySummary {
        StabilitySummary {
            user_avg: chamber_avg + 0.1,
            user_stdev: 0.01,
            chamber_avg,
            chamber_stdev: 0.02,
            impedance_stdev: 0.5,
            samples: 10,
            in_tolerance,
            reused: false,
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{name}-{}", std::process::id()))
    }

    #[test]
    fn test_extension_is_forced_to_jsonl() {
        let journal: EquilibrationJournal = Journal::new("/tmp/equilibration.log", 4);
        assert_eq!(journal.path().extension().unwrap(), "jsonl");
    }

    #[test]
    fn test_entries_flush_when_buffer_fills() {
        let path = temp_path("journal-buffer");
        let mut journal = EquilibrationJournal::new(&path, 2);
        let _ = std::fs::remove_file(journal.path());

        for (attempt, ok) in [(1, false), (2, true)] {
            journal
                .add(EquilibrationRecord {
                    timestamp: Local::now(),
                    device: "Simulated Environmental Chamber".to_string(),
                    setpoint: 40.0,
                    attempt,
                    summary: summary(40.2, ok),
                })
                .unwrap();
        }
        assert!(journal.is_empty());

        let entries = journal.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].attempt, 1);
        assert!(!entries[0].summary.in_tolerance);
        assert!(entries[1].summary.in_tolerance);

        let _ = std::fs::remove_file(journal.path());
    }

    #[test]
    fn test_drop_flushes_remaining_entries() {
        let path = temp_path("journal-drop");
        let file = {
            let mut journal = EquilibrationJournal::new(&path, 16);
            let _ = std::fs::remove_file(journal.path());
            journal
                .add(EquilibrationRecord {
                    timestamp: Local::now(),
                    device: "Simulated Hotplate".to_string(),
                    setpoint: 60.0,
                    attempt: 1,
                    summary: summary(60.0, true),
                })
                .unwrap();
            assert_eq!(journal.len(), 1);
            journal.path().to_path_buf()
        };

        let content = std::fs::read_to_string(&file).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("\"setpoint\":60.0"));

        let _ = std::fs::remove_file(file);
    }
}
