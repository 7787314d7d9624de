pub mod cancel;
pub mod config;
pub mod controller;
pub mod equilibration;
pub mod error;
pub mod events;
pub mod frequency;
pub mod header;
pub mod instrument;
pub mod journal;
pub mod output;
pub mod plotting;
pub mod sim;
pub mod stability;
pub mod step;
pub mod sweep;
pub mod utils;

pub use cancel::CancellationToken;
pub use config::{load_config, load_config_or_default, AppConfig};
pub use controller::{Instruments, ScanController, ScanPhase, ScanReport, ScanRun, ScanSettings};
pub use equilibration::{Equilibrated, EquilibrationProtocol, EquilibrationState};
pub use error::ScanError;
pub use events::{EventSink, RunOutcome, ScanEvent};
pub use frequency::generate_log_steps;
pub use header::{Header, ThermalBlock};
pub use instrument::{
    Aperture, ImpedanceMeter, ImpedanceRange, MeasureTime, MeasurementFunction, RampReporting,
    SignalType, TemperatureController,
};
pub use journal::{EquilibrationJournal, EquilibrationRecord, Journal};
pub use output::{MemorySink, ResultSink, StepRecord, TsvFileWriter};
pub use plotting::{format_si, plot_sweep};
pub use sim::{SimulatedChamber, SimulatedImpedanceMeter};
pub use stability::{summarize, EquilibrationSample, StabilityConfig, StabilitySummary};
pub use step::{Step, StepMatrix};
pub use sweep::{ResultRow, ResultTable, SweepExecutor};
pub use utils::{Pacing, RetryPolicy};
