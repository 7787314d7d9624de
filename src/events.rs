use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

/// How a scan run ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunOutcome {
    Completed,
    /// Stopped on request
    Cancelled,
    /// Ended by an unrecoverable collaborator error
    Failed(String),
}

/// Observable progress of a scan, consumed by UI / logging front-ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScanEvent {
    /// Human-readable status line
    Status(String),
    /// One frequency point of a step has been measured (both zero-based)
    PointMeasured {
        step_index: usize,
        point_index: usize,
        frequency: f64,
        primary: f64,
        secondary: f64,
    },
    /// Live readouts should pause (`false`) or resume (`true`)
    LiveUpdates(bool),
    /// A step's header and table have been recorded
    StepRecorded { step_index: usize, step_id: String },
    Finished(RunOutcome),
}

/// Sending half of the scan event stream
///
/// Events are dropped silently when no receiver is attached or the receiver
/// is full or gone; the scan never waits on its observers.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<Sender<ScanEvent>>,
}

impl EventSink {
    pub fn new(sender: Sender<ScanEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// Sink that only logs
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: ScanEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.try_send(event);
        }
    }

    /// Log `message` and forward it as a [`ScanEvent::Status`]
    pub fn status(&self, message: impl Into<String>) {
        let message = message.into();
        log::info!("{message}");
        self.emit(ScanEvent::Status(message));
    }
}
