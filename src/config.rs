use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::controller::ScanSettings;
use crate::error::ScanError;
use crate::instrument::{Aperture, ImpedanceRange, MeasureTime, MeasurementFunction, SignalType};
use crate::stability::StabilityConfig;
use crate::step::{Step, StepMatrix};
use crate::utils::Pacing;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct AppConfig {
    pub instrument: InstrumentConfig,
    pub stability: StabilityConfig,
    pub thermal: ThermalConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct InstrumentConfig {
    pub function: MeasurementFunction,
    pub range: ImpedanceRange,
    pub measure_time: MeasureTime,
    pub averaging: u32,
    pub signal_type: SignalType,
    pub bias_type: SignalType,
    pub points_per_sweep: usize,
    pub step_delay_seconds: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThermalDevice {
    #[default]
    None,
    Chamber,
    Hotplate,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ThermalConfig {
    pub device: ThermalDevice,
    pub ramp_rate: String,
    /// Starting temperature of a simulated device
    pub initial_temperature: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct OutputConfig {
    pub path: String,
    pub notes: String,
    /// Equilibration journal; no journal when unset
    #[serde(default)]
    pub journal: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            function: MeasurementFunction::CpD,
            range: ImpedanceRange::Auto,
            measure_time: MeasureTime::Long,
            averaging: 1,
            signal_type: SignalType::Voltage,
            bias_type: SignalType::Voltage,
            points_per_sweep: 50,
            step_delay_seconds: 0.0,
        }
    }
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            device: ThermalDevice::None,
            ramp_rate: "Device default".to_string(),
            initial_temperature: 22.0,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: "./data/scan.tsv".to_string(),
            notes: String::new(),
            journal: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.instrument.points_per_sweep < 2 {
            return Err(ScanError::InvalidArgument(format!(
                "instrument.points_per_sweep must be at least 2, got {}",
                self.instrument.points_per_sweep
            )));
        }
        if !self.instrument.range.is_valid() {
            return Err(ScanError::InvalidArgument(format!(
                "instrument.range {} is not one of {:?}",
                self.instrument.range,
                ImpedanceRange::VALID_FIXED
            )));
        }
        self.settings().validate()
    }

    /// Run-wide settings at real-time pacing
    pub fn settings(&self) -> ScanSettings {
        ScanSettings {
            function: self.instrument.function,
            range: self.instrument.range,
            aperture: Aperture {
                time: self.instrument.measure_time,
                averaging: self.instrument.averaging,
            },
            oscillator_type: self.instrument.signal_type,
            bias_type: self.instrument.bias_type,
            points_per_sweep: self.instrument.points_per_sweep,
            step_delay_seconds: self.instrument.step_delay_seconds,
            notes: self.output.notes.clone(),
            ramp_label: self.thermal.ramp_rate.clone(),
            stability: self.stability.clone(),
            pacing: Pacing::default(),
        }
    }

    pub fn step_matrix(&self) -> StepMatrix {
        StepMatrix::new(self.steps.clone())
    }

    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(&self.output.path)
    }
}

/// Load configuration: defaults, then a TOML file, then `IMPEDANCE_SCAN__*` variables
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        let possible_paths = ["impedance-scan.toml", "config/impedance-scan.toml"];
        for path in &possible_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("IMPEDANCE_SCAN")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize::<AppConfig>()
}

/// Like [`load_config`], falling back to defaults when no config file exists
///
/// An explicitly given path that fails to load is an error rather than a
/// silent fallback.
pub fn load_config_or_default(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            Ok(config)
        }
        Err(e) if config_path.is_some() => Err(e),
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            Ok(AppConfig::default())
        }
    }
}
