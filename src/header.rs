use chrono::{DateTime, Local};
use std::fmt;

use crate::instrument::{ImpedanceRange, MeasurementFunction, SignalType};
use crate::stability::StabilitySummary;
use crate::step::Step;

const RULE: &str = "**********************************";

/// Thermal part of a step header
#[derive(Debug, Clone, PartialEq)]
pub struct ThermalBlock {
    pub device: String,
    pub ramp: String,
    pub dwell_seconds: f64,
    pub sample_interval_seconds: f64,
    pub summary: StabilitySummary,
}

/// Free-text block written above each step's result table
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub function: MeasurementFunction,
    pub timestamp: DateTime<Local>,
    pub step_id: String,
    pub step: Step,
    pub range: ImpedanceRange,
    pub points: usize,
    pub averaging: u32,
    pub step_delay_seconds: f64,
    pub oscillator_type: SignalType,
    pub bias_type: SignalType,
    pub settle_ms: u128,
    pub notes: String,
    pub thermal: Option<ThermalBlock>,
    /// The sweep was cancelled before its last point
    pub partial: bool,
}

impl Header {
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{RULE}")?;
        writeln!(f, "Measurement Type:\t{}", self.function)?;
        writeln!(f, "Measurement Date:\t{}", self.timestamp.format("%Y-%m-%d"))?;
        writeln!(f, "Measurement Time:\t{}", self.timestamp.format("%H:%M:%S"))?;
        writeln!(f, "******Measurement Parameters******")?;
        writeln!(f, "Measurement Number:\t{}", self.step_id)?;
        writeln!(f, "Start Frequency [Hz]:\t{}", self.step.start_freq)?;
        writeln!(f, "Stop Frequency [Hz]:\t{}", self.step.stop_freq)?;
        writeln!(f, "Impedance Range:\t{}", self.range)?;
        writeln!(f, "Number of Points:\t{}", self.points)?;
        writeln!(f, "Data Averaging Per Point:\t{}", self.averaging)?;
        writeln!(f, "Per Step Delay:\t{}", self.step_delay_seconds)?;
        writeln!(
            f,
            "Oscillator [{}]:\t{}",
            self.oscillator_type.unit(),
            self.step.oscillator_level
        )?;
        writeln!(f, "DC Bias [{}]:\t{}", self.bias_type.unit(), self.step.bias_level)?;
        writeln!(f, "Pre Measurement Delay (ms):\t{}", self.settle_ms)?;
        if self.partial {
            writeln!(f, "Sweep Status:\tIncomplete (cancelled)")?;
        }

        if let Some(thermal) = &self.thermal {
            let s = &thermal.summary;
            writeln!(f, "*************Thermal*************")?;
            writeln!(f, "Temp Control Device:\t{}", thermal.device)?;
            if let Some(setpoint) = self.step.temperature_setpoint {
                writeln!(f, "Setpoint [°C]:\t{setpoint}")?;
            }
            writeln!(f, "Ramp Rate:\t{}", thermal.ramp)?;
            writeln!(f, "Dwell Before Measurement:\t{}", thermal.dwell_seconds)?;
            writeln!(
                f,
                "Stabilization Measurement Interval:\t{}",
                thermal.sample_interval_seconds
            )?;
            writeln!(f, "User Probe Average T [°C]:\t{}", s.user_avg)?;
            writeln!(f, "User Probe Std. Deviation [°C]:\t{}", s.user_stdev)?;
            writeln!(f, "Chamber Probe Average T [°C]:\t{}", s.chamber_avg)?;
            writeln!(f, "Chamber Probe Std. Deviation [°C]:\t{}", s.chamber_stdev)?;
            writeln!(
                f,
                "Impedance Value Standard Deviation [Ohm]:\t{}",
                s.impedance_stdev
            )?;
            if s.reused {
                writeln!(f, "Stability Statistics:\tReused from previous step")?;
            }
        }

        writeln!(f, "***********Sample Notes***********")?;
        writeln!(f, "Notes:\t{}", self.notes)?;
        write!(f, "************End Header************\n\n")
    }
}
