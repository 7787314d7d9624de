use parking_lot::Mutex;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::ScanError;
use crate::header::Header;
use crate::sweep::ResultTable;

/// Marker written after every result table
pub const END_DATA_MARKER: &str = "*************End Data*************";

/// Header and results of one completed (or partially swept) step
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub step_index: usize,
    pub step_id: String,
    pub header: Header,
    pub table: ResultTable,
}

/// Persistence collaborator, called once per run with every recorded step in order
pub trait ResultSink: Send {
    fn persist(&mut self, records: &[StepRecord]) -> Result<(), ScanError>;
}

/// Writes one tab-separated file per run
#[derive(Debug, Clone)]
pub struct TsvFileWriter {
    path: PathBuf,
}

impl TsvFileWriter {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Write each step as its header, an `idx`-indexed table and the end-of-data marker
    pub fn write_to<W: Write>(writer: &mut W, records: &[StepRecord]) -> Result<(), ScanError> {
        for record in records {
            writer.write_all(record.header.render().as_bytes())?;

            {
                let mut table = csv::WriterBuilder::new()
                    .delimiter(b'\t')
                    .from_writer(&mut *writer);

                let mut columns = vec!["idx".to_string()];
                columns.extend(record.table.columns.iter().cloned());
                table.write_record(&columns)?;

                for (idx, row) in record.table.rows.iter().enumerate() {
                    let mut fields = vec![idx.to_string()];
                    fields.extend(row.values.iter().map(|v| v.to_string()));
                    table.write_record(&fields)?;
                }
                table.flush()?;
            }

            write!(writer, "\n{END_DATA_MARKER}\n\n")?;
        }
        Ok(())
    }
}

impl ResultSink for TsvFileWriter {
    fn persist(&mut self, records: &[StepRecord]) -> Result<(), ScanError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| ScanError::Io {
                    source,
                    context: format!("Could not create output directory {parent:?}"),
                })?;
            }
        }

        let file = std::fs::File::create(&self.path).map_err(|source| ScanError::Io {
            source,
            context: format!("Could not create output file {:?}", self.path),
        })?;
        let mut writer = std::io::BufWriter::new(file);
        Self::write_to(&mut writer, records)?;
        writer.flush().map_err(|source| ScanError::Io {
            source,
            context: format!("Could not write output file {:?}", self.path),
        })?;

        log::info!("Saved {} step(s) to {:?}", records.len(), self.path);
        Ok(())
    }
}

/// Keeps persisted records in memory; clones share the same storage
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<StepRecord>>>,
    calls: Arc<Mutex<usize>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<StepRecord> {
        self.records.lock().clone()
    }

    /// Number of times `persist` was called
    pub fn persist_calls(&self) -> usize {
        *self.calls.lock()
    }
}

impl ResultSink for MemorySink {
    fn persist(&mut self, records: &[StepRecord]) -> Result<(), ScanError> {
        *self.calls.lock() += 1;
        self.records.lock().extend_from_slice(records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{ImpedanceRange, MeasurementFunction, SignalType};
    use crate::step::Step;
    use crate::sweep::ResultRow;
    use chrono::Local;

    fn record(step_index: usize) -> StepRecord {
        let header = Header {
            function: MeasurementFunction::CpD,
            timestamp: Local::now(),
            step_id: format!("M{}", step_index + 1),
            step: Step::default(),
            range: ImpedanceRange::Auto,
            points: 2,
            averaging: 1,
            step_delay_seconds: 0.0,
            oscillator_type: SignalType::Voltage,
            bias_type: SignalType::Voltage,
            settle_ms: 50,
            notes: String::new(),
            thermal: None,
            partial: false,
        };
        let mut table = ResultTable::new(MeasurementFunction::CpD.result_columns());
        table.rows.push(ResultRow {
            values: vec![20.0, 1e-9, 0.002, 0.0],
        });
        table.rows.push(ResultRow {
            values: vec![1000.0, 9.5e-10, 0.003, 0.0],
        });
        StepRecord {
            step_index,
            step_id: header.step_id.clone(),
            header,
            table,
        }
    }

    #[test]
    fn test_tsv_layout() {
        let mut buffer = Vec::new();
        TsvFileWriter::write_to(&mut buffer, &[record(0)]).unwrap();
        let text = String::from_utf8(buffer).unwrap();

        let table_start = text.find("idx\t").unwrap();
        let table = &text[table_start..];
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(
            lines[0],
            "idx\tFrequency [Hz]\tCapacitance (Parallel) [F]\tLoss Tangent\tData Status"
        );
        assert_eq!(lines[1], "0\t20\t0.000000001\t0.002\t0");
        assert_eq!(lines[2], "1\t1000\t0.00000000095\t0.003\t0");
        assert_eq!(lines[3], "");
        assert_eq!(lines[4], END_DATA_MARKER);
        assert!(text.starts_with("**********************************\n"));
        assert!(text.ends_with(&format!("{END_DATA_MARKER}\n\n")));
    }

    #[test]
    fn test_steps_are_written_in_order() {
        let mut buffer = Vec::new();
        TsvFileWriter::write_to(&mut buffer, &[record(0), record(1)]).unwrap();
        let text = String::from_utf8(buffer).unwrap();

        let first = text.find("Measurement Number:\tM1").unwrap();
        let second = text.find("Measurement Number:\tM2").unwrap();
        assert!(first < second);
        assert_eq!(text.matches(END_DATA_MARKER).count(), 2);
    }

    #[test]
    fn test_file_writer_creates_file() {
        let path = std::env::temp_dir()
            .join(format!("impedance-scan-{}", std::process::id()))
            .join("run.tsv");
        let mut writer = TsvFileWriter::new(&path);
        writer.persist(&[record(0)]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(END_DATA_MARKER));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_memory_sink_shares_storage() {
        let sink = MemorySink::new();
        let mut handle = sink.clone();
        handle.persist(&[record(0), record(1)]).unwrap();

        assert_eq!(sink.persist_calls(), 1);
        assert_eq!(sink.records().len(), 2);
    }
}
