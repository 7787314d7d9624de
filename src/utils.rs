use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::error::ScanError;

/// Bounded retry settings used at the instrument-wrapper boundary
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Pause before each retry
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Wall-clock pacing of every wait a scan performs
///
/// Dwell and countdown loops count logical ticks, so shortening `tick` speeds a
/// run up without changing how many samples are taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pacing {
    /// One logical second of dwell / countdown
    pub tick: Duration,
    /// Fixed settle time before each sweep point
    pub settle: Duration,
    /// Interval between temperature polls while ramping
    pub ramp_poll: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            settle: Duration::from_millis(50),
            ramp_poll: Duration::from_secs(1),
        }
    }
}

impl Pacing {
    /// No waiting at all, for simulated instruments
    pub fn instant() -> Self {
        Self {
            tick: Duration::ZERO,
            settle: Duration::ZERO,
            ramp_poll: Duration::ZERO,
        }
    }
}

/// Run `operation`, retrying failures up to `policy.max_retries` times
///
/// `recover` runs between attempts (e.g. clearing an instrument status register).
/// Once retries are exhausted the last error is returned as
/// [`ScanError::Communication`] tagged with `context`.
///
/// # Example
/// ```
/// use impedance_scan::utils::{retry_with_backoff, RetryPolicy};
/// use std::time::Duration;
///
/// let mut attempts = 0;
/// let value = retry_with_backoff(
///     "read",
///     RetryPolicy { max_retries: 3, backoff: Duration::ZERO },
///     || {
///         attempts += 1;
///         if attempts < 3 { Err("timeout".to_string()) } else { Ok(42) }
///     },
///     || {},
/// )
/// .unwrap();
/// assert_eq!(value, 42);
/// ```
pub fn retry_with_backoff<T, E, F, R>(
    context: &str,
    policy: RetryPolicy,
    mut operation: F,
    mut recover: R,
) -> Result<T, ScanError>
where
    F: FnMut() -> Result<T, E>,
    R: FnMut(),
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries => {
                attempt += 1;
                log::warn!(
                    "{context} failed ({e}), retry {attempt}/{}",
                    policy.max_retries
                );
                std::thread::sleep(policy.backoff);
                recover();
            }
            Err(e) => {
                log::error!("{context} failed after {attempt} retries: {e}");
                return Err(ScanError::communication(context, e.to_string()));
            }
        }
    }
}

/// Poll `condition` every `interval` until it reports `true`
///
/// There is no timeout: the loop ends only when the condition is met, the
/// condition fails, or `token` is cancelled (checked after every wake-up).
pub fn poll_until_cancelled<F>(
    mut condition: F,
    interval: Duration,
    token: &CancellationToken,
) -> Result<(), ScanError>
where
    F: FnMut() -> Result<bool, ScanError>,
{
    loop {
        token.check()?;
        if condition()? {
            return Ok(());
        }
        token.sleep(interval)?;
    }
}
