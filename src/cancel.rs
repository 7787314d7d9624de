use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crate::error::ScanError;

/// Longest uninterrupted sleep between two flag checks
const CANCEL_CHECK_SLICE: Duration = Duration::from_millis(100);

/// Cooperative stop flag shared between the owning context and the scan worker
///
/// Cloning hands out another handle to the same flag. Setting it is the only
/// cross-thread mutation a running scan accepts.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing shutdown flag, e.g. one set from a Ctrl+C handler
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(ScanError::Cancelled)` once a stop has been requested
    pub fn check(&self) -> Result<(), ScanError> {
        if self.is_cancelled() {
            Err(ScanError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early and returning `Cancelled` if a stop arrives
    pub fn sleep(&self, duration: Duration) -> Result<(), ScanError> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(CANCEL_CHECK_SLICE));
        }
    }
}
