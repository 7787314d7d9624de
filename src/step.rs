use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// One row of the measurement matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub start_freq: f64,
    pub stop_freq: f64,
    pub oscillator_level: f64,
    pub bias_level: f64,
    #[serde(default)]
    pub equilibration_delay_seconds: f64,
    #[serde(default)]
    pub temperature_setpoint: Option<f64>,
}

impl Default for Step {
    fn default() -> Self {
        Self {
            start_freq: 20.0,
            stop_freq: 1_000_000.0,
            oscillator_level: 0.05,
            bias_level: 0.0,
            equilibration_delay_seconds: 0.0,
            temperature_setpoint: None,
        }
    }
}

impl Step {
    pub fn validate(&self) -> Result<(), ScanError> {
        if !(self.start_freq > 0.0) || !(self.stop_freq > 0.0) {
            return Err(ScanError::InvalidArgument(format!(
                "frequency bounds must be positive (got {} to {})",
                self.start_freq, self.stop_freq
            )));
        }
        if !(self.equilibration_delay_seconds >= 0.0) {
            return Err(ScanError::InvalidArgument(format!(
                "equilibration delay must not be negative, got {}",
                self.equilibration_delay_seconds
            )));
        }
        Ok(())
    }
}

/// Ordered list of steps; order is execution order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepMatrix {
    steps: Vec<Step>,
}

impl StepMatrix {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Check every step and the sweep length before a run starts
    pub fn validate(&self, points_per_sweep: usize) -> Result<(), ScanError> {
        if self.steps.is_empty() {
            return Err(ScanError::InvalidArgument(
                "step matrix is empty".to_string(),
            ));
        }
        if points_per_sweep < 2 {
            return Err(ScanError::InvalidArgument(format!(
                "points per sweep must be at least 2, got {points_per_sweep}"
            )));
        }
        for (index, step) in self.steps.iter().enumerate() {
            step.validate().map_err(|e| {
                ScanError::InvalidArgument(format!("{}: {e}", step_id(index)))
            })?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Step> {
        self.steps.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }
}

impl From<Vec<Step>> for StepMatrix {
    fn from(steps: Vec<Step>) -> Self {
        Self::new(steps)
    }
}

/// Identifier of the step at `index`: `M1`, `M2`, ...
pub fn step_id(index: usize) -> String {
    format!("M{}", index + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_ids_are_one_based() {
        assert_eq!(step_id(0), "M1");
        assert_eq!(step_id(11), "M12");
    }

    #[test]
    fn test_validate_reports_offending_step() {
        let matrix = StepMatrix::new(vec![
            Step::default(),
            Step {
                start_freq: 0.0,
                ..Default::default()
            },
        ]);

        match matrix.validate(50) {
            Err(ScanError::InvalidArgument(msg)) => assert!(msg.starts_with("M2")),
            other => panic!("expected InvalidArgument, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_point_count_and_emptiness() {
        let matrix = StepMatrix::from(vec![Step::default()]);
        assert!(matrix.validate(50).is_ok());
        assert!(matrix.validate(1).is_err());
        assert!(StepMatrix::default().validate(50).is_err());
    }

    #[test]
    fn test_steps_deserialize_with_defaults() {
        let matrix: StepMatrix = serde_json::from_str(
            r#"[{"start_freq": 100.0, "stop_freq": 1e5, "oscillator_level": 0.1,
                 "bias_level": 0.5, "temperature_setpoint": 40.0}]"#,
        )
        .unwrap();

        let step = matrix.get(0).unwrap();
        assert_eq!(step.equilibration_delay_seconds, 0.0);
        assert_eq!(step.temperature_setpoint, Some(40.0));
    }
}
