//! Scan orchestration
//!
//! [`ScanController`] walks a [`StepMatrix`] strictly in order. For every step
//! it returns the analyzer to safe defaults, equilibrates the temperature when
//! a thermal device is attached, counts down the step's delay, sweeps, and
//! records the step's header and table. All records are handed to the
//! [`ResultSink`] once, when the run ends for whatever reason.
//!
//! [`ScanRun`] moves a controller, and with it every instrument, onto a
//! worker thread and hands it back on [`ScanRun::join`].

use chrono::Local;
use log::{debug, error, info, warn};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::equilibration::EquilibrationProtocol;
use crate::error::ScanError;
use crate::events::{EventSink, RunOutcome, ScanEvent};
use crate::frequency::generate_log_steps;
use crate::header::{Header, ThermalBlock};
use crate::instrument::{
    Aperture, ImpedanceMeter, ImpedanceRange, MeasurementFunction, SignalType,
    TemperatureController,
};
use crate::journal::EquilibrationJournal;
use crate::output::{ResultSink, StepRecord};
use crate::stability::{StabilityConfig, StabilitySummary};
use crate::step::{step_id, Step, StepMatrix};
use crate::sweep::SweepExecutor;
use crate::utils::Pacing;

/// Bias applied between steps
pub const DEFAULT_BIAS: f64 = 0.0;
/// Oscillator level applied between steps, in volts
pub const DEFAULT_OSCILLATOR: f64 = 0.05;
/// Frequency applied between steps
pub const DEFAULT_FREQUENCY: f64 = 1000.0;

/// Run-wide measurement settings
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSettings {
    pub function: MeasurementFunction,
    pub range: ImpedanceRange,
    pub aperture: Aperture,
    pub oscillator_type: SignalType,
    pub bias_type: SignalType,
    pub points_per_sweep: usize,
    /// Extra settle time before every sweep point
    pub step_delay_seconds: f64,
    pub notes: String,
    /// Ramp rate as written into thermal headers
    pub ramp_label: String,
    pub stability: StabilityConfig,
    pub pacing: Pacing,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            function: MeasurementFunction::CpD,
            range: ImpedanceRange::Auto,
            aperture: Aperture::default(),
            oscillator_type: SignalType::Voltage,
            bias_type: SignalType::Voltage,
            points_per_sweep: 50,
            step_delay_seconds: 0.0,
            notes: String::new(),
            ramp_label: "Device default".to_string(),
            stability: StabilityConfig::default(),
            pacing: Pacing::default(),
        }
    }
}

impl ScanSettings {
    pub fn validate(&self) -> Result<(), ScanError> {
        if !self.range.is_valid() {
            return Err(ScanError::InvalidArgument(format!(
                "unsupported impedance range {}",
                self.range
            )));
        }
        if !(self.step_delay_seconds >= 0.0) {
            return Err(ScanError::InvalidArgument(format!(
                "step delay must not be negative, got {}",
                self.step_delay_seconds
            )));
        }
        if self.aperture.averaging == 0 {
            return Err(ScanError::InvalidArgument(
                "data averaging must be at least 1".to_string(),
            ));
        }
        self.stability.validate()
    }

    fn step_delay(&self) -> Duration {
        Duration::from_secs_f64(self.step_delay_seconds)
    }
}

/// Instruments exclusively owned by whoever runs the scan
pub struct Instruments {
    pub meter: Box<dyn ImpedanceMeter>,
    pub thermal: Option<Box<dyn TemperatureController>>,
}

impl Instruments {
    pub fn new(meter: impl ImpedanceMeter + 'static) -> Self {
        Self {
            meter: Box::new(meter),
            thermal: None,
        }
    }

    pub fn with_thermal(mut self, thermal: impl TemperatureController + 'static) -> Self {
        self.thermal = Some(Box::new(thermal));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Idle,
    Configuring,
    Defaulting,
    Equilibrating,
    DelayingForEquilibration,
    Sweeping,
    Recording,
    Finalizing,
    Completed,
    Cancelled,
    Failed,
}

/// What a finished run produced
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub outcome: RunOutcome,
    /// Records handed to the sink, in step order
    pub records: Vec<StepRecord>,
    /// Dwell windows sampled across the whole run
    pub dwell_passes: u32,
}

pub struct ScanController {
    settings: ScanSettings,
    instruments: Instruments,
    sink: Box<dyn ResultSink>,
    events: EventSink,
    token: CancellationToken,
    journal: Option<EquilibrationJournal>,
    phase: ScanPhase,
}

impl ScanController {
    pub fn new(
        settings: ScanSettings,
        instruments: Instruments,
        sink: impl ResultSink + 'static,
    ) -> Self {
        Self {
            settings,
            instruments,
            sink: Box::new(sink),
            events: EventSink::detached(),
            token: CancellationToken::new(),
            journal: None,
            phase: ScanPhase::Idle,
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_journal(mut self, journal: EquilibrationJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Handle for stopping a run from another thread
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn phase(&self) -> ScanPhase {
        self.phase
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Give the instruments back once no run is using them
    pub fn into_instruments(self) -> Instruments {
        self.instruments
    }

    fn set_phase(&mut self, phase: ScanPhase) {
        debug!("Scan phase: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// Execute every step of `matrix`
    ///
    /// A malformed matrix or settings are refused before any instrument is
    /// touched. Once running, cancellation and instrument failures end the
    /// run early but still persist the steps recorded so far; they are
    /// reported through [`ScanReport::outcome`]. Only a persistence failure
    /// turns into an `Err` after the run has started.
    pub fn run(&mut self, matrix: &StepMatrix) -> Result<ScanReport, ScanError> {
        self.settings.validate()?;
        matrix.validate(self.settings.points_per_sweep)?;

        let mut protocol = EquilibrationProtocol::new(
            self.settings.stability.clone(),
            self.settings.pacing,
            self.events.clone(),
            self.token.clone(),
        );
        if let Some(journal) = self.journal.take() {
            protocol = protocol.with_journal(journal);
        }

        let mut records = Vec::with_capacity(matrix.len());
        let mut dwell_passes = 0;
        let termination = self.execute_steps(matrix, &mut protocol, &mut records, &mut dwell_passes);
        self.journal = protocol.into_journal();

        let mut outcome = match &termination {
            Ok(()) => RunOutcome::Completed,
            Err(e) if e.is_cancellation() => {
                self.events.status("Scan cancelled");
                RunOutcome::Cancelled
            }
            Err(e) => {
                error!("Scan aborted: {e}");
                self.events.status(format!("Scan aborted: {e}"));
                RunOutcome::Failed(e.to_string())
            }
        };

        self.set_phase(ScanPhase::Finalizing);
        self.events
            .status(format!("Saving {} recorded step(s)", records.len()));
        let persisted = self.sink.persist(&records);
        if let Err(e) = &persisted {
            error!("Could not persist scan results: {e}");
            outcome = RunOutcome::Failed(e.to_string());
        }

        self.set_phase(match outcome {
            RunOutcome::Completed => ScanPhase::Completed,
            RunOutcome::Cancelled => ScanPhase::Cancelled,
            RunOutcome::Failed(_) => ScanPhase::Failed,
        });
        info!("Scan finished: {outcome:?}");
        self.events.emit(ScanEvent::Finished(outcome.clone()));

        persisted?;
        Ok(ScanReport {
            outcome,
            records,
            dwell_passes,
        })
    }

    fn execute_steps(
        &mut self,
        matrix: &StepMatrix,
        protocol: &mut EquilibrationProtocol,
        records: &mut Vec<StepRecord>,
        dwell_passes: &mut u32,
    ) -> Result<(), ScanError> {
        let first = matrix
            .get(0)
            .ok_or_else(|| ScanError::InvalidArgument("step matrix is empty".to_string()))?;
        self.configure(first)?;

        for (index, step) in matrix.iter().enumerate() {
            self.token.check()?;
            let id = step_id(index);
            self.events.status(format!(
                "Starting {id} ({} of {}): {} Hz to {} Hz",
                index + 1,
                matrix.len(),
                step.start_freq,
                step.stop_freq
            ));

            self.set_phase(ScanPhase::Defaulting);
            self.return_to_defaults()?;

            let thermal = match step.temperature_setpoint {
                Some(setpoint) => self.equilibrate(setpoint, protocol, dwell_passes)?,
                None => None,
            };

            self.set_phase(ScanPhase::DelayingForEquilibration);
            self.countdown(step.equilibration_delay_seconds)?;

            let record = self.measure_step(index, step, thermal)?;
            let cancelled = record.header.partial;
            self.events.emit(ScanEvent::StepRecorded {
                step_index: index,
                step_id: id,
            });
            records.push(record);

            if cancelled {
                return Err(ScanError::Cancelled);
            }
        }
        Ok(())
    }

    /// Push the run-wide instrument configuration once, before the first step
    fn configure(&mut self, first: &Step) -> Result<(), ScanError> {
        self.set_phase(ScanPhase::Configuring);
        self.events.status(format!(
            "Configuring analyzer: {}, range {}, {} aperture x{}",
            self.settings.function,
            self.settings.range,
            self.settings.aperture.time.mnemonic(),
            self.settings.aperture.averaging
        ));

        let meter = self.instruments.meter.as_mut();
        meter.set_function(self.settings.function)?;
        meter.set_impedance_range(self.settings.range)?;
        meter.set_aperture(self.settings.aperture)?;
        meter.set_oscillator(self.settings.oscillator_type, first.oscillator_level)?;
        meter.set_bias(self.settings.bias_type, first.bias_level)?;
        Ok(())
    }

    fn return_to_defaults(&mut self) -> Result<(), ScanError> {
        let meter = self.instruments.meter.as_mut();
        meter.set_bias(SignalType::Voltage, DEFAULT_BIAS)?;
        meter.set_oscillator(SignalType::Voltage, DEFAULT_OSCILLATOR)?;
        meter.set_frequency(DEFAULT_FREQUENCY)?;
        Ok(())
    }

    fn equilibrate(
        &mut self,
        setpoint: f64,
        protocol: &mut EquilibrationProtocol,
        dwell_passes: &mut u32,
    ) -> Result<Option<ThermalBlock>, ScanError> {
        let Some(thermal) = self.instruments.thermal.as_deref_mut() else {
            warn!("Step requests {setpoint} °C but no thermal device is attached, skipping equilibration");
            return Ok(None);
        };

        self.phase = ScanPhase::Equilibrating;
        debug!("Scan phase: Equilibrating");
        let meter = self.instruments.meter.as_mut();
        let result = protocol.equilibrate(setpoint, thermal, meter)?;
        *dwell_passes += result.attempts;
        let device = thermal.name().to_string();

        // Leave the sample at safe levels again after the dwell measurements
        let meter = self.instruments.meter.as_mut();
        meter.set_bias(SignalType::Voltage, DEFAULT_BIAS)?;
        meter.set_oscillator(SignalType::Voltage, DEFAULT_OSCILLATOR)?;

        Ok(Some(self.thermal_block(device, result.summary)))
    }

    fn thermal_block(&self, device: String, summary: StabilitySummary) -> ThermalBlock {
        ThermalBlock {
            device,
            ramp: self.settings.ramp_label.clone(),
            dwell_seconds: self.settings.stability.dwell_seconds,
            sample_interval_seconds: self.settings.stability.sample_interval_seconds,
            summary,
        }
    }

    /// One status per logical second, cancellable between ticks
    fn countdown(&mut self, seconds: f64) -> Result<(), ScanError> {
        let ticks = seconds.ceil() as u64;
        for remaining in (1..=ticks).rev() {
            self.events
                .status(format!("Measurement starts in {remaining} s"));
            self.token.sleep(self.settings.pacing.tick)?;
        }
        Ok(())
    }

    fn measure_step(
        &mut self,
        index: usize,
        step: &Step,
        thermal: Option<ThermalBlock>,
    ) -> Result<StepRecord, ScanError> {
        self.set_phase(ScanPhase::Sweeping);
        let frequencies =
            generate_log_steps(step.start_freq, step.stop_freq, self.settings.points_per_sweep)?;

        let meter = self.instruments.meter.as_mut();
        meter.set_oscillator(self.settings.oscillator_type, step.oscillator_level)?;
        meter.set_bias(self.settings.bias_type, step.bias_level)?;

        let sweep = SweepExecutor::new(
            self.settings.function,
            self.settings.step_delay(),
            self.settings.pacing,
            &self.events,
            &self.token,
        );
        let outcome = sweep.execute(index, &frequencies, meter)?;

        self.set_phase(ScanPhase::Recording);
        let id = step_id(index);
        if outcome.cancelled {
            self.events.status(format!(
                "{id} stopped after {} of {} points",
                outcome.table.len(),
                frequencies.len()
            ));
        }

        let header = Header {
            function: self.settings.function,
            timestamp: Local::now(),
            step_id: id.clone(),
            step: step.clone(),
            range: self.settings.range,
            points: self.settings.points_per_sweep,
            averaging: self.settings.aperture.averaging,
            step_delay_seconds: self.settings.step_delay_seconds,
            oscillator_type: self.settings.oscillator_type,
            bias_type: self.settings.bias_type,
            settle_ms: self.settings.pacing.settle.as_millis(),
            notes: self.settings.notes.clone(),
            thermal,
            partial: outcome.cancelled,
        };

        Ok(StepRecord {
            step_index: index,
            step_id: id,
            header,
            table: outcome.table,
        })
    }
}

/// A scan running on its own worker thread
///
/// The controller, and therefore every instrument, belongs to the worker until
/// [`ScanRun::join`] hands it back.
pub struct ScanRun {
    token: CancellationToken,
    handle: JoinHandle<(ScanController, Result<ScanReport, ScanError>)>,
}

impl ScanRun {
    pub fn start(mut controller: ScanController, matrix: StepMatrix) -> Self {
        let token = controller.token();
        let handle = std::thread::spawn(move || {
            let report = controller.run(&matrix);
            (controller, report)
        });
        Self { token, handle }
    }

    pub fn request_stop(&self) {
        info!("Stop requested");
        self.token.request_stop();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the worker and take the controller back
    pub fn join(self) -> Result<(ScanController, Result<ScanReport, ScanError>), ScanError> {
        self.handle.join().map_err(|_| ScanError::WorkerPanicked)
    }
}
