//! Temperature equilibration
//!
//! Brings the sample to a setpoint and holds it there until a dwell window of
//! readings satisfies the [`StabilityConfig`]. A failed window restarts the
//! whole protocol for the same setpoint; the only ways out are a stable window,
//! a cancellation, an unrecovered instrument error or, when configured, the
//! attempt ceiling.

use chrono::Local;
use log::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::error::ScanError;
use crate::events::{EventSink, ScanEvent};
use crate::instrument::{ImpedanceMeter, RampReporting, TemperatureController};
use crate::journal::{EquilibrationJournal, EquilibrationRecord};
use crate::stability::{summarize, EquilibrationSample, StabilityConfig, StabilitySummary};
use crate::utils::{poll_until_cancelled, Pacing};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EquilibrationState {
    Idle,
    SettingSetpoint,
    WaitingForRampCompletion,
    DwellSampling,
    Evaluating,
    Satisfied,
    Retrying,
}

/// Result of one call to [`EquilibrationProtocol::equilibrate`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Equilibrated {
    pub summary: StabilitySummary,
    /// Dwell windows sampled for this setpoint (0 when statistics were reused)
    pub attempts: u32,
}

pub struct EquilibrationProtocol {
    config: StabilityConfig,
    pacing: Pacing,
    events: EventSink,
    token: CancellationToken,
    journal: Option<EquilibrationJournal>,
    state: EquilibrationState,
    last: Option<(f64, StabilitySummary)>,
    live_paused: bool,
}

impl EquilibrationProtocol {
    pub fn new(
        config: StabilityConfig,
        pacing: Pacing,
        events: EventSink,
        token: CancellationToken,
    ) -> Self {
        Self {
            config,
            pacing,
            events,
            token,
            journal: None,
            state: EquilibrationState::Idle,
            last: None,
            live_paused: false,
        }
    }

    pub fn with_journal(mut self, journal: EquilibrationJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn state(&self) -> EquilibrationState {
        self.state
    }

    /// Flush and hand back the journal, if any
    pub fn into_journal(mut self) -> Option<EquilibrationJournal> {
        if let Some(journal) = self.journal.as_mut() {
            if let Err(e) = journal.flush() {
                warn!("Could not flush equilibration journal: {e}");
            }
        }
        self.journal.take()
    }

    fn transition(&mut self, to: EquilibrationState) {
        debug!("Equilibration: {:?} -> {:?}", self.state, to);
        self.state = to;
    }

    /// Bring the sample to `setpoint` and return the statistics of the stable window
    ///
    /// When the previous call used the same setpoint and re-checking is not
    /// forced, its summary is returned again flagged as reused and nothing is
    /// sent to the instruments.
    pub fn equilibrate(
        &mut self,
        setpoint: f64,
        thermal: &mut dyn TemperatureController,
        meter: &mut dyn ImpedanceMeter,
    ) -> Result<Equilibrated, ScanError> {
        if let Some((previous, summary)) = self.last {
            if previous == setpoint && !self.config.always_recheck_stability {
                self.events.status(format!(
                    "Setpoint unchanged at {setpoint} °C, reusing previous stability statistics"
                ));
                self.transition(EquilibrationState::Satisfied);
                return Ok(Equilibrated {
                    summary: summary.as_reused(),
                    attempts: 0,
                });
            }
        }

        let result = self.run_attempts(setpoint, thermal, meter);
        if result.is_err() {
            self.transition(EquilibrationState::Idle);
            self.last = None;
            self.set_live_updates(true);
        }
        result
    }

    fn set_live_updates(&mut self, enabled: bool) {
        if self.live_paused == enabled {
            self.live_paused = !enabled;
            self.events.emit(ScanEvent::LiveUpdates(enabled));
        }
    }

    fn run_attempts(
        &mut self,
        setpoint: f64,
        thermal: &mut dyn TemperatureController,
        meter: &mut dyn ImpedanceMeter,
    ) -> Result<Equilibrated, ScanError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;

            self.transition(EquilibrationState::SettingSetpoint);
            self.events
                .status(format!("Setting {} to {setpoint} °C", thermal.name()));
            thermal.set_setpoint(setpoint)?;

            self.transition(EquilibrationState::WaitingForRampCompletion);
            self.wait_for_ramp(setpoint, thermal)?;

            self.transition(EquilibrationState::DwellSampling);
            self.set_live_updates(false);
            self.events.status(format!(
                "Dwelling at {setpoint} °C for {} s (attempt {attempt})",
                self.config.dwell_seconds
            ));
            let samples = self.dwell(thermal, meter)?;

            self.transition(EquilibrationState::Evaluating);
            let summary = summarize(&samples, setpoint, &self.config);
            self.record(thermal.name(), setpoint, attempt, &summary)?;

            if summary.in_tolerance {
                self.transition(EquilibrationState::Satisfied);
                self.events.status(format!(
                    "Stable at {setpoint} °C: chamber {:.3} ± {:.3} °C, user probe {:.3} ± {:.3} °C",
                    summary.chamber_avg, summary.chamber_stdev, summary.user_avg, summary.user_stdev
                ));
                self.set_live_updates(true);
                self.last = Some((setpoint, summary));
                return Ok(Equilibrated {
                    summary,
                    attempts: attempt,
                });
            }

            self.transition(EquilibrationState::Retrying);
            warn!(
                "Not stable at {setpoint} °C after attempt {attempt}: chamber {:.3} ± {:.3} °C",
                summary.chamber_avg, summary.chamber_stdev
            );
            self.events.status(format!(
                "Temperature not stable at {setpoint} °C, restarting equilibration"
            ));

            if let Some(max) = self.config.max_attempts {
                if attempt >= max {
                    return Err(ScanError::EquilibrationExhausted {
                        setpoint,
                        attempts: attempt,
                    });
                }
            }
        }
    }

    fn wait_for_ramp(
        &mut self,
        setpoint: f64,
        thermal: &mut dyn TemperatureController,
    ) -> Result<(), ScanError> {
        match thermal.ramp_reporting() {
            RampReporting::SelfReported => {
                self.events.status(format!(
                    "Waiting for {} to report ramp complete",
                    thermal.name()
                ));
                poll_until_cancelled(|| thermal.ramp_complete(), self.pacing.ramp_poll, &self.token)
            }
            RampReporting::PolledReading => {
                let tolerance = self.config.temp_tolerance;
                let start = thermal.get_device_temperature()?;
                let rising = setpoint >= start;
                self.events.status(format!(
                    "Waiting for {} to {} from {start:.2} to {setpoint} °C",
                    thermal.name(),
                    if rising { "heat" } else { "cool" }
                ));

                let mut reading = start;
                poll_until_cancelled(
                    || {
                        let reached = if rising {
                            reading >= setpoint - tolerance
                        } else {
                            reading <= setpoint + tolerance
                        };
                        if !reached {
                            reading = thermal.get_device_temperature()?;
                            debug!("Ramping: {reading:.2} °C");
                        }
                        Ok(reached)
                    },
                    self.pacing.ramp_poll,
                    &self.token,
                )
            }
        }
    }

    /// Sample every `sample_interval_seconds` logical ticks for `dwell_seconds` ticks
    fn dwell(
        &mut self,
        thermal: &mut dyn TemperatureController,
        meter: &mut dyn ImpedanceMeter,
    ) -> Result<Vec<EquilibrationSample>, ScanError> {
        let ticks = self.config.dwell_seconds.ceil() as u64;
        let every = (self.config.sample_interval_seconds.round() as u64).max(1);
        let mut samples = Vec::with_capacity(ticks.div_ceil(every) as usize);

        for tick in 0..ticks {
            if tick % every == 0 {
                let sample = take_sample(thermal, meter)?;
                debug!(
                    "Dwell sample {}: chamber {:.3} °C, user {:.3} °C, |Z| {:.4e}",
                    samples.len() + 1,
                    sample.chamber_probe_temp,
                    sample.user_probe_temp,
                    sample.impedance_magnitude
                );
                samples.push(sample);
            }
            self.token.sleep(self.pacing.tick)?;
        }

        info!("Dwell finished with {} samples", samples.len());
        Ok(samples)
    }

    fn record(
        &mut self,
        device: &str,
        setpoint: f64,
        attempt: u32,
        summary: &StabilitySummary,
    ) -> Result<(), ScanError> {
        match self.journal.as_mut() {
            Some(journal) => journal.add(EquilibrationRecord {
                timestamp: Local::now(),
                device: device.to_string(),
                setpoint,
                attempt,
                summary: *summary,
            }),
            None => Ok(()),
        }
    }
}

fn take_sample(
    thermal: &mut dyn TemperatureController,
    meter: &mut dyn ImpedanceMeter,
) -> Result<EquilibrationSample, ScanError> {
    let user_probe_temp = thermal.get_reference_temperature()?;
    let chamber_probe_temp = thermal.get_device_temperature()?;
    meter.trigger()?;
    let impedance_magnitude = meter.read_impedance_magnitude()?;

    Ok(EquilibrationSample {
        timestamp: Local::now(),
        user_probe_temp,
        chamber_probe_temp,
        impedance_magnitude,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::MeasurementFunction;
    use crate::sim::{SimulatedChamber, SimulatedImpedanceMeter};
    use crossbeam_channel::unbounded;

    fn config() -> StabilityConfig {
        StabilityConfig {
            dwell_seconds: 10.0,
            sample_interval_seconds: 2.0,
            temp_tolerance: 0.5,
            temp_stdev_tolerance: 0.5,
            ..Default::default()
        }
    }

    fn protocol(config: StabilityConfig) -> (EquilibrationProtocol, crossbeam_channel::Receiver<ScanEvent>) {
        let (tx, rx) = unbounded();
        let protocol = EquilibrationProtocol::new(
            config,
            Pacing::instant(),
            EventSink::new(tx),
            CancellationToken::new(),
        );
        (protocol, rx)
    }

    #[test]
    fn test_quiet_chamber_is_stable_on_first_attempt() {
        let (mut protocol, rx) = protocol(config());
        let mut chamber = SimulatedChamber::chamber(20.0);
        let mut meter = SimulatedImpedanceMeter::new();

        let result = protocol.equilibrate(25.0, &mut chamber, &mut meter).unwrap();

        assert_eq!(result.attempts, 1);
        assert_eq!(result.summary.samples, 5);
        assert!(result.summary.in_tolerance);
        assert!(!result.summary.reused);
        assert!((result.summary.user_avg - 25.1).abs() < 1e-9);
        assert_eq!(protocol.state(), EquilibrationState::Satisfied);

        let events: Vec<ScanEvent> = rx.try_iter().collect();
        let pause = events.iter().position(|e| *e == ScanEvent::LiveUpdates(false));
        let resume = events.iter().position(|e| *e == ScanEvent::LiveUpdates(true));
        assert!(pause.unwrap() < resume.unwrap());
    }

    #[test]
    fn test_sample_count_follows_interval_rounding() {
        let (mut protocol, _rx) = protocol(StabilityConfig {
            dwell_seconds: 9.5,
            sample_interval_seconds: 0.2,
            ..config()
        });
        let mut chamber = SimulatedChamber::chamber(25.0);
        let mut meter = SimulatedImpedanceMeter::new();

        let result = protocol.equilibrate(25.0, &mut chamber, &mut meter).unwrap();
        // Sub-second intervals sample once per tick: ceil(9.5) samples
        assert_eq!(result.summary.samples, 10);
    }

    #[test]
    fn test_noisy_window_is_retried_for_same_setpoint() {
        let (mut protocol, _rx) = protocol(config());
        let mut chamber = SimulatedChamber::chamber(20.0).with_noise_schedule(vec![2.0, 0.0]);
        let state = chamber.state();
        let mut meter = SimulatedImpedanceMeter::new();

        let result = protocol.equilibrate(25.0, &mut chamber, &mut meter).unwrap();

        assert_eq!(result.attempts, 2);
        assert!(result.summary.in_tolerance);
        assert_eq!(state.lock().setpoint_commands, vec![25.0, 25.0]);
    }

    #[test]
    fn test_same_setpoint_reuses_statistics() {
        let (mut protocol, _rx) = protocol(config());
        let mut chamber = SimulatedChamber::chamber(20.0);
        let state = chamber.state();
        let mut meter = SimulatedImpedanceMeter::new();

        let first = protocol.equilibrate(25.0, &mut chamber, &mut meter).unwrap();
        let reads = state.lock().device_reads;
        let second = protocol.equilibrate(25.0, &mut chamber, &mut meter).unwrap();

        assert_eq!(second.attempts, 0);
        assert!(second.summary.reused);
        assert_eq!(second.summary.chamber_avg, first.summary.chamber_avg);
        assert_eq!(state.lock().device_reads, reads);
        assert_eq!(state.lock().setpoint_commands.len(), 1);
    }

    #[test]
    fn test_forced_recheck_samples_again() {
        let (mut protocol, _rx) = protocol(StabilityConfig {
            always_recheck_stability: true,
            ..config()
        });
        let mut chamber = SimulatedChamber::chamber(20.0);
        let state = chamber.state();
        let mut meter = SimulatedImpedanceMeter::new();

        protocol.equilibrate(25.0, &mut chamber, &mut meter).unwrap();
        let second = protocol.equilibrate(25.0, &mut chamber, &mut meter).unwrap();

        assert_eq!(second.attempts, 1);
        assert!(!second.summary.reused);
        assert_eq!(state.lock().setpoint_commands.len(), 2);
    }

    #[test]
    fn test_cooling_ramp_waits_for_falling_approach() {
        let (mut protocol, _rx) = protocol(config());
        let mut chamber = SimulatedChamber::chamber(60.0).with_ramp_per_read(5.0);
        let state = chamber.state();
        let mut meter = SimulatedImpedanceMeter::new();

        let result = protocol.equilibrate(40.0, &mut chamber, &mut meter).unwrap();

        assert!(result.summary.in_tolerance);
        // 55, 50, 45, 40 while ramping, then 5 dwell samples
        assert_eq!(state.lock().device_reads, 4 + 5);
    }

    #[test]
    fn test_hotplate_polls_ramp_completion() {
        let (mut protocol, _rx) = protocol(config());
        let mut hotplate = SimulatedChamber::hotplate(20.0).with_ramp_per_read(10.0);
        let state = hotplate.state();
        let mut meter = SimulatedImpedanceMeter::new();

        let result = protocol.equilibrate(45.0, &mut hotplate, &mut meter).unwrap();

        assert!(result.summary.in_tolerance);
        // No device readings while waiting, only the dwell samples
        assert_eq!(state.lock().device_reads, 5);
    }

    #[test]
    fn test_cancellation_mid_dwell_aborts_without_summary() {
        let (tx, rx) = unbounded();
        let token = CancellationToken::new();
        let stopper = token.clone();
        let mut protocol =
            EquilibrationProtocol::new(config(), Pacing::instant(), EventSink::new(tx), token);
        let mut chamber = SimulatedChamber::chamber(25.0).on_reading(move |reads| {
            if reads == 3 {
                stopper.request_stop();
            }
        });
        let mut meter = SimulatedImpedanceMeter::new();
        let log = meter.command_log();

        let result = protocol.equilibrate(25.0, &mut chamber, &mut meter);

        assert!(matches!(result, Err(ScanError::Cancelled)));
        assert_eq!(protocol.state(), EquilibrationState::Idle);
        // First reading is the ramp check, the stop lands during the second dwell sample
        assert_eq!(log.count(|c| *c == crate::sim::MeterCommand::Trigger), 2);

        let live: Vec<bool> = rx
            .try_iter()
            .filter_map(|e| match e {
                ScanEvent::LiveUpdates(enabled) => Some(enabled),
                _ => None,
            })
            .collect();
        assert_eq!(live, vec![false, true]);
    }

    #[test]
    fn test_instrument_failure_mid_dwell_resumes_live_updates() {
        let (mut protocol, rx) = protocol(config());
        let mut chamber = SimulatedChamber::chamber(25.0);
        let mut meter = SimulatedImpedanceMeter::new()
            .failing_after_reads(2)
            .with_retry_policy(crate::utils::RetryPolicy {
                max_retries: 0,
                backoff: std::time::Duration::ZERO,
            });

        let result = protocol.equilibrate(25.0, &mut chamber, &mut meter);

        assert!(matches!(result, Err(ScanError::Communication { .. })));
        let last_live = rx.try_iter().filter_map(|e| match e {
            ScanEvent::LiveUpdates(enabled) => Some(enabled),
            _ => None,
        });
        assert_eq!(last_live.last(), Some(true));
    }

    #[test]
    fn test_dwell_samples_impedance_magnitude_in_ohm() {
        let (mut protocol, _rx) = protocol(config());
        let mut chamber = SimulatedChamber::chamber(25.0);
        let mut meter = SimulatedImpedanceMeter::new();
        meter.set_function(MeasurementFunction::CpD).unwrap();
        meter.set_frequency(1000.0).unwrap();

        let result = protocol.equilibrate(25.0, &mut chamber, &mut meter).unwrap();

        // Capacitance sits near 1e-9 F; the dwell must see |Z| of roughly 1.6e5 Ohm
        assert!(result.summary.impedance_stdev < 1e-6);
        let sample = take_sample(&mut chamber, &mut meter).unwrap();
        assert!(sample.impedance_magnitude > 1e5);
    }

    #[test]
    fn test_drifting_impedance_fails_enforced_stability() {
        let stability = StabilityConfig {
            impedance_stdev_tolerance: Some(1000.0),
            enforce_impedance_stability: true,
            max_attempts: Some(1),
            ..config()
        };
        let mut chamber = SimulatedChamber::chamber(25.0);
        let mut meter = SimulatedImpedanceMeter::new().with_capacitance_drift(0.05);
        meter.set_function(MeasurementFunction::CpD).unwrap();
        meter.set_frequency(1000.0).unwrap();
        let (mut protocol, _rx) = protocol(stability.clone());

        let result = protocol.equilibrate(25.0, &mut chamber, &mut meter);
        assert!(matches!(
            result,
            Err(ScanError::EquilibrationExhausted { attempts: 1, .. })
        ));

        // The same temperatures with a steady sample pass
        let mut chamber = SimulatedChamber::chamber(25.0);
        let mut meter = SimulatedImpedanceMeter::new();
        meter.set_function(MeasurementFunction::CpD).unwrap();
        let (mut protocol, _rx) = self::protocol(stability);
        let result = protocol.equilibrate(25.0, &mut chamber, &mut meter).unwrap();
        assert!(result.summary.in_tolerance);
        assert!(result.summary.impedance_stdev <= 1000.0);
    }

    #[test]
    fn test_attempt_ceiling_is_opt_in() {
        let (mut protocol, _rx) = protocol(StabilityConfig {
            max_attempts: Some(2),
            ..config()
        });
        let mut chamber = SimulatedChamber::chamber(25.0).with_noise_schedule(vec![3.0]);
        let mut meter = SimulatedImpedanceMeter::new();

        match protocol.equilibrate(25.0, &mut chamber, &mut meter) {
            Err(ScanError::EquilibrationExhausted { setpoint, attempts }) => {
                assert_eq!(setpoint, 25.0);
                assert_eq!(attempts, 2);
            }
            other => panic!("expected EquilibrationExhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_attempts_are_journaled() {
        let path = std::env::temp_dir().join(format!("equilibration-{}", std::process::id()));
        let journal = EquilibrationJournal::new(&path, 1);
        let _ = std::fs::remove_file(journal.path());

        let (protocol, _rx) = protocol(config());
        let mut protocol = protocol.with_journal(journal);
        let mut chamber = SimulatedChamber::chamber(20.0).with_noise_schedule(vec![2.0, 0.0]);
        let mut meter = SimulatedImpedanceMeter::new();
        protocol.equilibrate(25.0, &mut chamber, &mut meter).unwrap();

        let journal = protocol.into_journal().unwrap();
        let records = journal.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert!(!records[0].summary.in_tolerance);
        assert!(records[1].summary.in_tolerance);
        assert_eq!(records[1].attempt, 2);

        let _ = std::fs::remove_file(journal.path());
    }
}
