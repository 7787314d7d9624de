use crate::error::ScanError;
use chrono::{DateTime, Local};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Value substituted for any statistic that cannot be computed.
///
/// Large enough that any realistic tolerance comparison fails, so an
/// undersampled dwell always leads to another equilibration attempt.
pub const STATISTICS_UNAVAILABLE: f64 = 9999.0;

/// Stability criterion applied to every dwell window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityConfig {
    /// Length of the dwell window in seconds
    pub dwell_seconds: f64,
    /// Seconds between samples inside the dwell window
    pub sample_interval_seconds: f64,
    /// Allowed |chamber average - setpoint| in °C
    pub temp_tolerance: f64,
    /// Allowed chamber probe standard deviation in °C
    pub temp_stdev_tolerance: f64,
    /// Allowed impedance-magnitude standard deviation in Ohm
    #[serde(default)]
    pub impedance_stdev_tolerance: Option<f64>,
    #[serde(default)]
    pub enforce_impedance_stability: bool,
    /// Re-run the dwell even when the setpoint did not change between steps
    #[serde(default)]
    pub always_recheck_stability: bool,
    /// Optional ceiling on equilibration attempts per setpoint (None = retry forever)
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            dwell_seconds: 600.0,
            sample_interval_seconds: 5.0,
            temp_tolerance: 0.5,
            temp_stdev_tolerance: 0.5,
            impedance_stdev_tolerance: None,
            enforce_impedance_stability: false,
            always_recheck_stability: false,
            max_attempts: None,
        }
    }
}

impl StabilityConfig {
    pub fn validate(&self) -> Result<(), ScanError> {
        if !(self.dwell_seconds > 0.0) {
            return Err(ScanError::InvalidArgument(format!(
                "dwell_seconds must be positive, got {}",
                self.dwell_seconds
            )));
        }
        if !(self.sample_interval_seconds > 0.0) {
            return Err(ScanError::InvalidArgument(format!(
                "sample_interval_seconds must be positive, got {}",
                self.sample_interval_seconds
            )));
        }
        if self.temp_tolerance < 0.0 || self.temp_stdev_tolerance < 0.0 {
            return Err(ScanError::InvalidArgument(
                "temperature tolerances must not be negative".to_string(),
            ));
        }
        if self.enforce_impedance_stability && self.impedance_stdev_tolerance.is_none() {
            return Err(ScanError::InvalidArgument(
                "enforce_impedance_stability requires impedance_stdev_tolerance".to_string(),
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(ScanError::InvalidArgument(
                "max_attempts must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    fn impedance_check(&self) -> Option<f64> {
        if self.enforce_impedance_stability {
            self.impedance_stdev_tolerance
        } else {
            None
        }
    }
}

/// One reading taken inside a dwell window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EquilibrationSample {
    pub timestamp: DateTime<Local>,
    pub user_probe_temp: f64,
    pub chamber_probe_temp: f64,
    pub impedance_magnitude: f64,
}

/// Aggregate statistics of one dwell window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StabilitySummary {
    pub user_avg: f64,
    pub user_stdev: f64,
    pub chamber_avg: f64,
    pub chamber_stdev: f64,
    pub impedance_stdev: f64,
    pub samples: usize,
    pub in_tolerance: bool,
    /// Carried over from the previous step instead of being measured again
    #[serde(default)]
    pub reused: bool,
}

impl StabilitySummary {
    /// Copy of this summary flagged as carried over
    pub fn as_reused(&self) -> Self {
        Self {
            reused: true,
            ..*self
        }
    }
}

/// Arithmetic mean, `None` for an empty series
pub fn mean(values: &[f64]) -> Option<f64> {
    Array1::from(values.to_vec()).mean()
}

/// Sample standard deviation (N-1 denominator)
pub fn sample_stdev(values: &[f64]) -> Result<f64, ScanError> {
    if values.len() < 2 {
        return Err(ScanError::StatisticsUnavailable {
            samples: values.len(),
        });
    }
    Ok(Array1::from(values.to_vec()).std(1.0))
}

fn stdev_or_sentinel(values: &[f64]) -> f64 {
    match sample_stdev(values) {
        Ok(stdev) => stdev,
        Err(e) => {
            log::debug!("{e}; substituting sentinel");
            STATISTICS_UNAVAILABLE
        }
    }
}

/// Reduce a dwell window to a [`StabilitySummary`] and judge it against `config`
///
/// In tolerance iff the chamber average is within `temp_tolerance` of the
/// setpoint (inclusive), the chamber stdev is within `temp_stdev_tolerance`,
/// and, when enforced, the impedance stdev is within its tolerance.
/// Fewer than two samples is never in tolerance.
pub fn summarize(
    samples: &[EquilibrationSample],
    setpoint: f64,
    config: &StabilityConfig,
) -> StabilitySummary {
    let user: Vec<f64> = samples.iter().map(|s| s.user_probe_temp).collect();
    let chamber: Vec<f64> = samples.iter().map(|s| s.chamber_probe_temp).collect();
    let impedance: Vec<f64> = samples.iter().map(|s| s.impedance_magnitude).collect();

    let user_avg = mean(&user).unwrap_or(STATISTICS_UNAVAILABLE);
    let chamber_avg = mean(&chamber).unwrap_or(STATISTICS_UNAVAILABLE);
    let user_stdev = stdev_or_sentinel(&user);
    let chamber_stdev = stdev_or_sentinel(&chamber);
    let impedance_stdev = stdev_or_sentinel(&impedance);

    let enough_samples = samples.len() >= 2;
    let temp_ok = (chamber_avg - setpoint).abs() <= config.temp_tolerance;
    let stdev_ok = chamber_stdev <= config.temp_stdev_tolerance;
    let impedance_ok = config
        .impedance_check()
        .map_or(true, |tol| impedance_stdev <= tol);

    StabilitySummary {
        user_avg,
        user_stdev,
        chamber_avg,
        chamber_stdev,
        impedance_stdev,
        samples: samples.len(),
        in_tolerance: enough_samples && temp_ok && stdev_ok && impedance_ok,
        reused: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(chamber: &[f64]) -> Vec<EquilibrationSample> {
        chamber
            .iter()
            .map(|&t| EquilibrationSample {
                timestamp: Local::now(),
                user_probe_temp: t + 0.1,
                chamber_probe_temp: t,
                impedance_magnitude: 1000.0,
            })
            .collect()
    }

    fn config(temp_tolerance: f64) -> StabilityConfig {
        StabilityConfig {
            temp_tolerance,
            temp_stdev_tolerance: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn test_mean_and_sample_stdev() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(mean(&values), Some(5.0));
        // N-1 denominator: sqrt(32 / 7)
        let stdev = sample_stdev(&values).unwrap();
        assert!((stdev - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_stdev_needs_two_samples() {
        assert!(matches!(
            sample_stdev(&[1.0]),
            Err(ScanError::StatisticsUnavailable { samples: 1 })
        ));
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn test_tolerance_boundary_is_inclusive() {
        // Constant readings: stdev 0, average exactly setpoint + tolerance
        let at_boundary = summarize(&samples(&[25.5, 25.5, 25.5]), 25.0, &config(0.5));
        assert!(at_boundary.in_tolerance);

        let below_boundary = summarize(&samples(&[24.5, 24.5]), 25.0, &config(0.5));
        assert!(below_boundary.in_tolerance);

        let beyond = summarize(&samples(&[25.5001, 25.5001]), 25.0, &config(0.5));
        assert!(!beyond.in_tolerance);
    }

    #[test]
    fn test_noisy_chamber_fails_stdev_check() {
        let summary = summarize(&samples(&[24.0, 26.0, 24.0, 26.0]), 25.0, &config(1.0));
        assert!((summary.chamber_avg - 25.0).abs() < 1e-12);
        assert!(summary.chamber_stdev > 0.5);
        assert!(!summary.in_tolerance);
    }

    #[test]
    fn test_single_sample_uses_sentinel_and_fails_closed() {
        let summary = summarize(&samples(&[25.0]), 25.0, &config(0.5));
        assert_eq!(summary.chamber_stdev, STATISTICS_UNAVAILABLE);
        assert_eq!(summary.samples, 1);
        assert!(!summary.in_tolerance);

        let empty = summarize(&[], 25.0, &config(0.5));
        assert_eq!(empty.chamber_avg, STATISTICS_UNAVAILABLE);
        assert!(!empty.in_tolerance);
    }

    #[test]
    fn test_impedance_check_only_when_enforced() {
        let mut window = samples(&[25.0, 25.0, 25.0]);
        window[1].impedance_magnitude = 5000.0;

        let relaxed = StabilityConfig {
            impedance_stdev_tolerance: Some(10.0),
            ..config(0.5)
        };
        assert!(summarize(&window, 25.0, &relaxed).in_tolerance);

        let enforced = StabilityConfig {
            enforce_impedance_stability: true,
            ..relaxed
        };
        assert!(!summarize(&window, 25.0, &enforced).in_tolerance);
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        assert!(StabilityConfig::default().validate().is_ok());
        let bad = StabilityConfig {
            dwell_seconds: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let missing_tol = StabilityConfig {
            enforce_impedance_stability: true,
            ..Default::default()
        };
        assert!(missing_tol.validate().is_err());
    }
}
