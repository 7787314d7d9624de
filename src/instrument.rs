//! Capability interfaces for the instruments a scan drives
//!
//! The scan core only ever talks to instruments through these traits. The
//! wire-level command protocol of a real analyzer or thermal controller lives
//! in implementations outside this crate; [`crate::sim`] provides simulated ones.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ScanError;

/// Column name used for the frequency of each result row
pub const FREQUENCY_COLUMN: &str = "Frequency [Hz]";

/// Impedance measurement function (parameter pair) of the analyzer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeasurementFunction {
    #[serde(rename = "Cp-D")]
    CpD,
    #[serde(rename = "Cp-Q")]
    CpQ,
    #[serde(rename = "Cp-G")]
    CpG,
    #[serde(rename = "Cp-Rp")]
    CpRp,
    #[serde(rename = "Cs-D")]
    CsD,
    #[serde(rename = "Cs-Q")]
    CsQ,
    #[serde(rename = "Cs-Rs")]
    CsRs,
    #[serde(rename = "Lp-D")]
    LpD,
    #[serde(rename = "Lp-Q")]
    LpQ,
    #[serde(rename = "Lp-G")]
    LpG,
    #[serde(rename = "Lp-Rp")]
    LpRp,
    #[serde(rename = "Lp-Rdc")]
    LpRdc,
    #[serde(rename = "Ls-D")]
    LsD,
    #[serde(rename = "Ls-Q")]
    LsQ,
    #[serde(rename = "Ls-Rs")]
    LsRs,
    #[serde(rename = "Ls-Rdc")]
    LsRdc,
    #[serde(rename = "R-X")]
    RX,
    #[serde(rename = "Z-Thd")]
    ZThd,
    #[serde(rename = "Z-Thr")]
    ZThr,
    #[serde(rename = "G-B")]
    GB,
    #[serde(rename = "Y-Thd")]
    YThd,
    #[serde(rename = "Y-Thr")]
    YThr,
    #[serde(rename = "Vdc-Idc")]
    VdcIdc,
}

impl MeasurementFunction {
    /// Human-readable name, e.g. `Cp-D`
    pub fn label(&self) -> &'static str {
        match self {
            Self::CpD => "Cp-D",
            Self::CpQ => "Cp-Q",
            Self::CpG => "Cp-G",
            Self::CpRp => "Cp-Rp",
            Self::CsD => "Cs-D",
            Self::CsQ => "Cs-Q",
            Self::CsRs => "Cs-Rs",
            Self::LpD => "Lp-D",
            Self::LpQ => "Lp-Q",
            Self::LpG => "Lp-G",
            Self::LpRp => "Lp-Rp",
            Self::LpRdc => "Lp-Rdc",
            Self::LsD => "Ls-D",
            Self::LsQ => "Ls-Q",
            Self::LsRs => "Ls-Rs",
            Self::LsRdc => "Ls-Rdc",
            Self::RX => "R-X",
            Self::ZThd => "Z-Thd",
            Self::ZThr => "Z-Thr",
            Self::GB => "G-B",
            Self::YThd => "Y-Thd",
            Self::YThr => "Y-Thr",
            Self::VdcIdc => "Vdc-Idc",
        }
    }

    /// Names of the values returned by one read, in instrument order
    pub fn parameters(&self) -> [&'static str; 3] {
        const STATUS: &str = "Data Status";
        let (primary, secondary) = match self {
            Self::CpD => ("Capacitance (Parallel) [F]", "Loss Tangent"),
            Self::CpQ => ("Capacitance (Parallel) [F]", "Quality Factor"),
            Self::CpG => ("Capacitance (Parallel) [F]", "Eq. Parallel Conductance [S]"),
            Self::CpRp => ("Capacitance (Parallel) [F]", "Eq. Parallel Resistance [Ohm]"),
            Self::CsD => ("Capacitance (Series) [F]", "Loss Tangent"),
            Self::CsQ => ("Capacitance (Series) [F]", "Quality Factor"),
            Self::CsRs => ("Capacitance (Series) [F]", "Eq. Series Resistance [Ohm]"),
            Self::LpD => ("Inductance (Parallel) [H]", "Loss Tangent"),
            Self::LpQ => ("Inductance (Parallel) [H]", "Quality Factor"),
            Self::LpG => ("Inductance (Parallel) [H]", "Eq. Parallel Conductance [S]"),
            Self::LpRp => ("Inductance (Parallel) [H]", "Eq. Parallel Resistance [Ohm]"),
            Self::LpRdc => ("Inductance (Parallel) [H]", "Direct Current Resistance [Ohm]"),
            Self::LsD => ("Inductance (Series) [H]", "Loss Tangent"),
            Self::LsQ => ("Inductance (Series) [H]", "Quality Factor"),
            Self::LsRs => ("Inductance (Series) [H]", "Eq. Series Resistance [Ohm]"),
            Self::LsRdc => ("Inductance (Series) [H]", "Direct Current Resistance [Ohm]"),
            Self::RX => ("Resistance [Ohm]", "Reactance [Ohm]"),
            Self::ZThd => ("Impedance [Ohm]", "Theta [deg]"),
            Self::ZThr => ("Impedance [Ohm]", "Theta [rad]"),
            Self::GB => ("Eq. Parallel Conductance [S]", "Susceptance [S]"),
            Self::YThd => ("Admittance [S]", "Theta [deg]"),
            Self::YThr => ("Admittance [S]", "Theta [rad]"),
            Self::VdcIdc => ("Direct Current Voltage [V]", "Direct Current [A]"),
        };
        [primary, secondary, STATUS]
    }

    /// Result table columns: the parameters, with frequency prepended when missing
    pub fn result_columns(&self) -> Vec<String> {
        let params = self.parameters();
        let mut columns: Vec<String> = params.iter().map(|p| p.to_string()).collect();
        if params[0] != FREQUENCY_COLUMN {
            columns.insert(0, FREQUENCY_COLUMN.to_string());
        }
        columns
    }

    /// Whether a raw read already starts with the frequency
    pub fn reports_frequency(&self) -> bool {
        self.parameters()[0] == FREQUENCY_COLUMN
    }
}

impl fmt::Display for MeasurementFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Oscillator / DC bias source type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    #[default]
    Voltage,
    Current,
}

impl SignalType {
    pub fn unit(&self) -> &'static str {
        match self {
            SignalType::Voltage => "V",
            SignalType::Current => "A",
        }
    }
}

/// Integration time per measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasureTime {
    Short,
    Medium,
    #[default]
    Long,
}

impl MeasureTime {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            MeasureTime::Short => "SHOR",
            MeasureTime::Medium => "MED",
            MeasureTime::Long => "LONG",
        }
    }
}

/// Measurement aperture: integration time plus on-instrument averaging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aperture {
    pub time: MeasureTime,
    pub averaging: u32,
}

impl Default for Aperture {
    fn default() -> Self {
        Self {
            time: MeasureTime::Long,
            averaging: 1,
        }
    }
}

/// Impedance range setting, auto-ranging or a fixed range in Ohm
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpedanceRange {
    #[default]
    Auto,
    Fixed(f64),
}

impl ImpedanceRange {
    /// Fixed ranges the analyzer accepts, in Ohm
    pub const VALID_FIXED: [f64; 10] = [1e-1, 1e0, 1e1, 1e2, 3e2, 1e3, 3e3, 1e4, 3e4, 1e5];

    pub fn is_valid(&self) -> bool {
        match self {
            ImpedanceRange::Auto => true,
            ImpedanceRange::Fixed(ohm) => Self::VALID_FIXED.contains(ohm),
        }
    }
}

impl fmt::Display for ImpedanceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImpedanceRange::Auto => f.write_str("Auto"),
            ImpedanceRange::Fixed(ohm) => write!(f, "{ohm:E}"),
        }
    }
}

/// Impedance / LCR analyzer capability
///
/// Implementations own their retry policy: a returned error means the
/// instrument could not be recovered and the run must end.
pub trait ImpedanceMeter: Send {
    fn set_function(&mut self, function: MeasurementFunction) -> Result<(), ScanError>;
    fn set_impedance_range(&mut self, range: ImpedanceRange) -> Result<(), ScanError>;
    fn set_aperture(&mut self, aperture: Aperture) -> Result<(), ScanError>;
    fn set_frequency(&mut self, hz: f64) -> Result<(), ScanError>;
    fn set_oscillator(&mut self, kind: SignalType, level: f64) -> Result<(), ScanError>;
    fn set_bias(&mut self, kind: SignalType, level: f64) -> Result<(), ScanError>;
    fn trigger(&mut self) -> Result<(), ScanError>;
    /// Values of the last triggered measurement, in [`MeasurementFunction::parameters`] order
    fn read(&mut self) -> Result<Vec<f64>, ScanError>;
    /// |Z| in Ohm of the last triggered measurement, whatever function is configured
    ///
    /// An analyzer that cannot report it alongside the configured parameters
    /// switches to `Z-Thd` for the fetch and restores the function afterwards.
    fn read_impedance_magnitude(&mut self) -> Result<f64, ScanError>;
    /// Frequency the instrument is actually using, after its own rounding
    fn read_signal_frequency(&mut self) -> Result<f64, ScanError>;
}

/// How a thermal device tells us it has reached its setpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RampReporting {
    /// Poll the device temperature until it crosses into the tolerance band
    PolledReading,
    /// The device reports ramp completion itself
    SelfReported,
}

/// Thermal device capability (environmental chamber, hotplate, ...)
pub trait TemperatureController: Send {
    /// Name written into step headers
    fn name(&self) -> &str;
    fn ramp_reporting(&self) -> RampReporting;
    fn set_setpoint(&mut self, celsius: f64) -> Result<(), ScanError>;
    /// Control-loop probe temperature
    fn get_device_temperature(&mut self) -> Result<f64, ScanError>;
    /// Secondary (user) probe temperature
    fn get_reference_temperature(&mut self) -> Result<f64, ScanError>;
    /// Only consulted for [`RampReporting::SelfReported`] devices
    fn ramp_complete(&mut self) -> Result<bool, ScanError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_columns_prepend_frequency() {
        let columns = MeasurementFunction::CpD.result_columns();
        assert_eq!(
            columns,
            vec![
                FREQUENCY_COLUMN,
                "Capacitance (Parallel) [F]",
                "Loss Tangent",
                "Data Status"
            ]
        );
        assert!(!MeasurementFunction::CpD.reports_frequency());
    }

    #[test]
    fn test_labels_match_config_names() {
        for function in [
            MeasurementFunction::CpD,
            MeasurementFunction::LpRdc,
            MeasurementFunction::ZThd,
            MeasurementFunction::VdcIdc,
        ] {
            let name = serde_json::to_string(&function).unwrap();
            assert_eq!(name, format!("\"{}\"", function.label()));
        }
    }

    #[test]
    fn test_impedance_range_validity() {
        assert!(ImpedanceRange::Auto.is_valid());
        assert!(ImpedanceRange::Fixed(300.0).is_valid());
        assert!(!ImpedanceRange::Fixed(500.0).is_valid());
    }
}
