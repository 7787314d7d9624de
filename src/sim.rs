//! Simulated instruments
//!
//! Stand-ins for a real analyzer and thermal device, used for dry runs of a
//! scan configuration and by the unit tests. Both keep a shared, lockable
//! record of what they were asked to do so the record can still be inspected
//! after the instrument itself has been moved onto a scan worker.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::ScanError;
use crate::instrument::{
    Aperture, ImpedanceMeter, ImpedanceRange, MeasurementFunction, RampReporting, SignalType,
    TemperatureController,
};
use crate::utils::{retry_with_backoff, RetryPolicy};

/// Commands received by a [`SimulatedImpedanceMeter`]
#[derive(Debug, Clone, PartialEq)]
pub enum MeterCommand {
    SetFunction(MeasurementFunction),
    SetRange(ImpedanceRange),
    SetAperture(Aperture),
    SetFrequency(f64),
    SetOscillator(SignalType, f64),
    SetBias(SignalType, f64),
    Trigger,
    Read,
    ReadImpedance,
    ReadFrequency,
    ClearStatus,
}

/// Shared command history of a simulated meter
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    commands: Arc<Mutex<Vec<MeterCommand>>>,
}

impl CommandLog {
    fn push(&self, command: MeterCommand) {
        self.commands.lock().push(command);
    }

    pub fn snapshot(&self) -> Vec<MeterCommand> {
        self.commands.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&MeterCommand) -> bool) -> usize {
        self.commands.lock().iter().filter(|c| predicate(c)).count()
    }

    /// Frequencies commanded so far, in order
    pub fn frequencies(&self) -> Vec<f64> {
        self.commands
            .lock()
            .iter()
            .filter_map(|c| match c {
                MeterCommand::SetFrequency(hz) => Some(*hz),
                _ => None,
            })
            .collect()
    }
}

type ReadHook = Box<dyn FnMut(usize) + Send>;

/// Simulated LCR meter measuring a lossy capacitor
///
/// Frequencies are rounded to whole hertz the way a real instrument quantises
/// them, so the reported frequency can differ from the requested one.
pub struct SimulatedImpedanceMeter {
    log: CommandLog,
    function: MeasurementFunction,
    frequency: f64,
    capacitance: f64,
    drift: f64,
    triggered: bool,
    reads: usize,
    pending_failures: u32,
    fail_after: Option<usize>,
    retry: RetryPolicy,
    read_hook: Option<ReadHook>,
}

impl Default for SimulatedImpedanceMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedImpedanceMeter {
    pub fn new() -> Self {
        Self {
            log: CommandLog::default(),
            function: MeasurementFunction::CpD,
            frequency: 1000.0,
            capacitance: 1e-9,
            drift: 0.0,
            triggered: false,
            reads: 0,
            pending_failures: 0,
            fail_after: None,
            retry: RetryPolicy::default(),
            read_hook: None,
        }
    }

    pub fn command_log(&self) -> CommandLog {
        self.log.clone()
    }

    /// The next `count` fetches fail transiently before succeeding
    pub fn with_transient_read_failures(mut self, count: u32) -> Self {
        self.pending_failures = count;
        self
    }

    /// Every fetch fails, exhausting the retry policy
    pub fn with_fatal_read_failure(self) -> Self {
        self.failing_after_reads(0)
    }

    /// Fetches succeed `reads` times, then fail for good
    pub fn failing_after_reads(mut self, reads: usize) -> Self {
        self.fail_after = Some(reads);
        self
    }

    /// Sample capacitance grows by this fraction after every fetch
    pub fn with_capacitance_drift(mut self, fraction: f64) -> Self {
        self.drift = fraction;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Call `hook` with the running read count after every successful read
    pub fn on_read(mut self, hook: impl FnMut(usize) + Send + 'static) -> Self {
        self.read_hook = Some(Box::new(hook));
        self
    }

    fn quantised_frequency(&self) -> f64 {
        self.frequency.round()
    }

    /// Capacitance, loss tangent and reactance at the current frequency
    fn sample_model(&self) -> (f64, f64, f64) {
        let f = self.quantised_frequency().max(1.0);
        // Mild dielectric dispersion: capacitance falls and loss rises with frequency
        let capacitance = self.capacitance * (1.0 - 0.02 * f.log10());
        let loss = 0.001 * (1.0 + 0.1 * f.log10());
        let reactance = 1.0 / (2.0 * std::f64::consts::PI * f * capacitance);
        (capacitance, loss, reactance)
    }

    fn measurement(&self) -> Vec<f64> {
        let (capacitance, loss, reactance) = self.sample_model();
        let (primary, secondary) = match self.function {
            MeasurementFunction::ZThd => (self.impedance_magnitude(), -89.9),
            MeasurementFunction::ZThr => (self.impedance_magnitude(), -1.569),
            MeasurementFunction::RX => (reactance * loss, -reactance),
            MeasurementFunction::CpRp | MeasurementFunction::CsRs => {
                (capacitance, reactance / loss)
            }
            _ => (capacitance, loss),
        };
        vec![primary, secondary, 0.0]
    }

    fn impedance_magnitude(&self) -> f64 {
        let (_, loss, reactance) = self.sample_model();
        reactance.hypot(reactance * loss)
    }

    fn fetch(&mut self) -> Result<(), String> {
        if self.fail_after.is_some_and(|limit| self.reads >= limit) {
            return Err("VI_ERROR_TMO: fetch timed out".to_string());
        }
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err("VI_ERROR_TMO: fetch timed out".to_string());
        }
        if !self.triggered {
            return Err("fetch without trigger".to_string());
        }
        Ok(())
    }

    /// One fetch through the retry policy, counted for the read hook
    fn fetch_with_retry(&mut self) -> Result<(), ScanError> {
        let retry = self.retry;
        let log = self.log.clone();
        // Recovery between attempts clears the status register, as the real wrapper does
        retry_with_backoff(
            "fetch measurement",
            retry,
            || self.fetch(),
            || log.push(MeterCommand::ClearStatus),
        )?;

        self.capacitance *= 1.0 + self.drift;
        self.reads += 1;
        let reads = self.reads;
        if let Some(hook) = self.read_hook.as_mut() {
            hook(reads);
        }
        Ok(())
    }
}

impl ImpedanceMeter for SimulatedImpedanceMeter {
    fn set_function(&mut self, function: MeasurementFunction) -> Result<(), ScanError> {
        self.log.push(MeterCommand::SetFunction(function));
        self.function = function;
        Ok(())
    }

    fn set_impedance_range(&mut self, range: ImpedanceRange) -> Result<(), ScanError> {
        if !range.is_valid() {
            return Err(ScanError::InvalidArgument(format!(
                "unsupported impedance range {range}"
            )));
        }
        self.log.push(MeterCommand::SetRange(range));
        Ok(())
    }

    fn set_aperture(&mut self, aperture: Aperture) -> Result<(), ScanError> {
        self.log.push(MeterCommand::SetAperture(aperture));
        Ok(())
    }

    fn set_frequency(&mut self, hz: f64) -> Result<(), ScanError> {
        self.log.push(MeterCommand::SetFrequency(hz));
        self.frequency = hz;
        self.triggered = false;
        Ok(())
    }

    fn set_oscillator(&mut self, kind: SignalType, level: f64) -> Result<(), ScanError> {
        self.log.push(MeterCommand::SetOscillator(kind, level));
        Ok(())
    }

    fn set_bias(&mut self, kind: SignalType, level: f64) -> Result<(), ScanError> {
        self.log.push(MeterCommand::SetBias(kind, level));
        Ok(())
    }

    fn trigger(&mut self) -> Result<(), ScanError> {
        self.log.push(MeterCommand::Trigger);
        self.triggered = true;
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<f64>, ScanError> {
        self.log.push(MeterCommand::Read);
        let values = self.measurement();
        self.fetch_with_retry()?;
        Ok(values)
    }

    fn read_impedance_magnitude(&mut self) -> Result<f64, ScanError> {
        self.log.push(MeterCommand::ReadImpedance);
        let magnitude = self.impedance_magnitude();
        self.fetch_with_retry()?;
        Ok(magnitude)
    }

    fn read_signal_frequency(&mut self) -> Result<f64, ScanError> {
        self.log.push(MeterCommand::ReadFrequency);
        Ok(self.quantised_frequency())
    }
}

/// Shared view of a simulated thermal device
#[derive(Debug, Default)]
pub struct ChamberState {
    pub temperature: f64,
    pub setpoint: Option<f64>,
    pub setpoint_commands: Vec<f64>,
    pub device_reads: usize,
    pub reference_reads: usize,
}

type ReadingHook = Box<dyn FnMut(usize) + Send>;

/// Simulated environmental chamber or hotplate
///
/// Each temperature read moves the device `ramp_per_read` °C toward its
/// setpoint. Readings carry a deterministic alternating noise whose amplitude
/// is taken from a schedule, one entry per setpoint command, so tests can make
/// an early equilibration attempt fail and a later one pass.
pub struct SimulatedChamber {
    name: String,
    reporting: RampReporting,
    state: Arc<Mutex<ChamberState>>,
    ramp_per_read: f64,
    reference_offset: f64,
    noise_schedule: Vec<f64>,
    noise: f64,
    reading_hook: Option<ReadingHook>,
}

impl SimulatedChamber {
    /// Chamber that reports a continuous temperature reading
    pub fn chamber(initial_temp: f64) -> Self {
        Self::with_reporting("Simulated Environmental Chamber", RampReporting::PolledReading, initial_temp)
    }

    /// Hotplate-style device that reports ramp completion itself
    pub fn hotplate(initial_temp: f64) -> Self {
        Self::with_reporting("Simulated Hotplate", RampReporting::SelfReported, initial_temp)
    }

    fn with_reporting(name: &str, reporting: RampReporting, initial_temp: f64) -> Self {
        Self {
            name: name.to_string(),
            reporting,
            state: Arc::new(Mutex::new(ChamberState {
                temperature: initial_temp,
                ..Default::default()
            })),
            ramp_per_read: 5.0,
            reference_offset: 0.1,
            noise_schedule: Vec::new(),
            noise: 0.0,
            reading_hook: None,
        }
    }

    pub fn state(&self) -> Arc<Mutex<ChamberState>> {
        self.state.clone()
    }

    pub fn with_ramp_per_read(mut self, celsius: f64) -> Self {
        self.ramp_per_read = celsius;
        self
    }

    /// Noise amplitude for successive setpoint commands; the last entry sticks
    pub fn with_noise_schedule(mut self, amplitudes: Vec<f64>) -> Self {
        self.noise_schedule = amplitudes;
        self
    }

    /// Call `hook` with the running device-read count after every device read
    pub fn on_reading(mut self, hook: impl FnMut(usize) + Send + 'static) -> Self {
        self.reading_hook = Some(Box::new(hook));
        self
    }

    fn noisy(&self, value: f64, reads: usize) -> f64 {
        if reads % 2 == 0 {
            value + self.noise
        } else {
            value - self.noise
        }
    }
}

impl TemperatureController for SimulatedChamber {
    fn name(&self) -> &str {
        &self.name
    }

    fn ramp_reporting(&self) -> RampReporting {
        self.reporting
    }

    fn set_setpoint(&mut self, celsius: f64) -> Result<(), ScanError> {
        let attempt = self.state.lock().setpoint_commands.len();
        self.noise = self
            .noise_schedule
            .get(attempt)
            .or(self.noise_schedule.last())
            .copied()
            .unwrap_or(0.0);

        let mut state = self.state.lock();
        state.setpoint = Some(celsius);
        state.setpoint_commands.push(celsius);
        Ok(())
    }

    fn get_device_temperature(&mut self) -> Result<f64, ScanError> {
        let (value, reads) = {
            let mut state = self.state.lock();
            if let Some(target) = state.setpoint {
                state.temperature = step_toward(state.temperature, target, self.ramp_per_read);
            }
            state.device_reads += 1;
            (state.temperature, state.device_reads)
        };

        if let Some(hook) = self.reading_hook.as_mut() {
            hook(reads);
        }
        Ok(self.noisy(value, reads))
    }

    fn get_reference_temperature(&mut self) -> Result<f64, ScanError> {
        let mut state = self.state.lock();
        state.reference_reads += 1;
        Ok(state.temperature + self.reference_offset)
    }

    fn ramp_complete(&mut self) -> Result<bool, ScanError> {
        let mut state = self.state.lock();
        match state.setpoint {
            Some(target) => {
                state.temperature = step_toward(state.temperature, target, self.ramp_per_read);
                Ok(state.temperature == target)
            }
            None => Ok(true),
        }
    }
}

fn step_toward(current: f64, target: f64, max_step: f64) -> f64 {
    let delta = target - current;
    if delta.abs() <= max_step {
        target
    } else {
        current + max_step.copysign(delta)
    }
}
