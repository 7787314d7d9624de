use log::debug;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::error::ScanError;
use crate::events::{EventSink, ScanEvent};
use crate::instrument::{ImpedanceMeter, MeasurementFunction};
use crate::utils::Pacing;

/// One measured frequency point, values in [`ResultTable::columns`] order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub values: Vec<f64>,
}

impl ResultRow {
    /// Frequency reported by the instrument
    pub fn frequency(&self) -> f64 {
        self.values.first().copied().unwrap_or(f64::NAN)
    }

    pub fn primary(&self) -> f64 {
        self.values.get(1).copied().unwrap_or(f64::NAN)
    }

    pub fn secondary(&self) -> f64 {
        self.values.get(2).copied().unwrap_or(f64::NAN)
    }
}

/// Rows of one step, in sweep order
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<ResultRow>,
}

impl ResultTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn frequencies(&self) -> Vec<f64> {
        self.rows.iter().map(ResultRow::frequency).collect()
    }

    /// Values of one column by position
    pub fn column(&self, index: usize) -> Vec<f64> {
        self.rows
            .iter()
            .map(|row| row.values.get(index).copied().unwrap_or(f64::NAN))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepOutcome {
    pub table: ResultTable,
    /// The sweep stopped early on a cancellation request
    pub cancelled: bool,
}

/// Runs the frequency sweep of a single step
pub struct SweepExecutor<'a> {
    function: MeasurementFunction,
    step_delay: Duration,
    pacing: Pacing,
    events: &'a EventSink,
    token: &'a CancellationToken,
}

impl<'a> SweepExecutor<'a> {
    pub fn new(
        function: MeasurementFunction,
        step_delay: Duration,
        pacing: Pacing,
        events: &'a EventSink,
        token: &'a CancellationToken,
    ) -> Self {
        Self {
            function,
            step_delay,
            pacing,
            events,
            token,
        }
    }

    /// Measure every frequency in order
    ///
    /// Cancellation is checked after each point; the rows measured so far are
    /// returned with `cancelled` set. A stop seen after the last point leaves
    /// the sweep complete. Instrument errors are returned as-is.
    pub fn execute(
        &self,
        step_index: usize,
        frequencies: &[f64],
        meter: &mut dyn ImpedanceMeter,
    ) -> Result<SweepOutcome, ScanError> {
        let mut table = ResultTable::new(self.function.result_columns());
        let prepend_frequency = !self.function.reports_frequency();

        for (point_index, &hz) in frequencies.iter().enumerate() {
            meter.set_frequency(hz)?;
            std::thread::sleep(self.pacing.settle + self.step_delay);
            meter.trigger()?;

            let mut values = meter.read()?;
            if prepend_frequency {
                values.insert(0, meter.read_signal_frequency()?);
            }
            let row = ResultRow { values };
            debug!(
                "Point {}/{}: {:.2} Hz -> {:?}",
                point_index + 1,
                frequencies.len(),
                row.frequency(),
                row.values.get(1..).unwrap_or_default()
            );

            self.events.emit(ScanEvent::PointMeasured {
                step_index,
                point_index,
                frequency: row.frequency(),
                primary: row.primary(),
                secondary: row.secondary(),
            });
            table.rows.push(row);

            let remaining = point_index + 1 < frequencies.len();
            if remaining && self.token.is_cancelled() {
                return Ok(SweepOutcome {
                    table,
                    cancelled: true,
                });
            }
        }

        Ok(SweepOutcome {
            table,
            cancelled: false,
        })
    }
}
