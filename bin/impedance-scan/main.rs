use clap::Parser;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use env_logger::Env;
use log::{error, info, warn, LevelFilter};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use impedance_scan::config::{load_config_or_default, AppConfig, ThermalDevice};
use impedance_scan::plotting::{column_unit, format_si, plot_sweep};
use impedance_scan::{
    CancellationToken, EquilibrationJournal, Instruments, MeasurementFunction, Pacing,
    RunOutcome, ScanController, ScanEvent, ScanReport, ScanRun, SimulatedChamber,
    SimulatedImpedanceMeter, TsvFileWriter,
};

/// Impedance Scan
#[derive(Parser, Debug)]
#[command(name = "impedance-scan")]
#[command(about = "Frequency / temperature impedance scans", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Plot every recorded sweep in the terminal when the run ends
    #[arg(short, long)]
    plot: bool,

    /// Skip all waiting (dry run against the simulated instruments)
    #[arg(long)]
    fast: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config_or_default(args.config.as_deref())?;

    let log_level = args.log_level.clone().unwrap_or(config.logging.level.clone());
    initialize_logging(&log_level);
    log_startup_info(&config, args.config.as_deref());
    config.validate()?;

    let token = CancellationToken::from_flag(setup_shutdown_handler()?);
    let (event_tx, event_rx) = unbounded();

    let mut settings = config.settings();
    if args.fast {
        settings.pacing = Pacing::instant();
    }
    let function = settings.function;

    let mut controller = ScanController::new(
        settings,
        setup_instruments(&config),
        TsvFileWriter::new(config.output_path()),
    )
    .with_events(impedance_scan::EventSink::new(event_tx))
    .with_token(token.clone());
    if let Some(journal) = &config.output.journal {
        controller = controller.with_journal(EquilibrationJournal::new(journal, 1));
    }

    info!("Starting scan of {} step(s)...", config.steps.len());
    let run = ScanRun::start(controller, config.step_matrix());
    render_events(&event_rx, function, &run);

    let (controller, report) = run.join()?;
    // Instruments are back with the main thread; dropping them closes the session
    drop(controller.into_instruments());

    let report = report?;
    report_outcome(&report, &config);
    if args.plot {
        plot_records(&report);
    }

    match report.outcome {
        RunOutcome::Failed(message) => Err(message.into()),
        _ => Ok(()),
    }
}

/// Simulated analyzer plus the configured thermal device
fn setup_instruments(config: &AppConfig) -> Instruments {
    let instruments = Instruments::new(SimulatedImpedanceMeter::new());
    let initial = config.thermal.initial_temperature;
    match config.thermal.device {
        ThermalDevice::None => instruments,
        ThermalDevice::Chamber => instruments.with_thermal(SimulatedChamber::chamber(initial)),
        ThermalDevice::Hotplate => instruments.with_thermal(SimulatedChamber::hotplate(initial)),
    }
}

/// Print events from the scan worker until it finishes
fn render_events(events: &Receiver<ScanEvent>, function: MeasurementFunction, run: &ScanRun) {
    let [primary_name, secondary_name, _] = function.parameters();
    loop {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(ScanEvent::Status(message)) => println!("{message}"),
            Ok(ScanEvent::PointMeasured {
                step_index,
                point_index,
                frequency,
                primary,
                secondary,
            }) => println!(
                "[M{}] #{:<3} {:>12}  {}: {}  {}: {}",
                step_index + 1,
                point_index + 1,
                format_si(frequency, "Hz", 4),
                primary_name,
                format_si(primary, column_unit(primary_name), 4),
                secondary_name,
                format_si(secondary, column_unit(secondary_name), 4),
            ),
            Ok(ScanEvent::LiveUpdates(enabled)) => {
                info!("Live readout {}", if enabled { "resumed" } else { "paused" })
            }
            Ok(ScanEvent::StepRecorded { step_id, .. }) => println!("{step_id} recorded"),
            Ok(ScanEvent::Finished(_)) => break,
            Err(RecvTimeoutError::Timeout) => {
                if run.is_finished() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn report_outcome(report: &ScanReport, config: &AppConfig) {
    match &report.outcome {
        RunOutcome::Completed => info!("✓ Scan completed"),
        RunOutcome::Cancelled => info!("✓ Scan stopped by user"),
        RunOutcome::Failed(message) => error!("✗ Scan failed: {message}"),
    }
    info!(
        "{} of {} step(s) recorded, {} dwell window(s) sampled",
        report.records.len(),
        config.steps.len(),
        report.dwell_passes
    );
    if !report.records.is_empty() {
        info!("Results: {}", config.output_path().display());
    }
}

fn plot_records(report: &ScanReport) {
    for record in &report.records {
        if let Err(e) = plot_sweep(&record.table, 1, Some(&record.step_id), None, None) {
            warn!("Could not plot {}: {e}", record.step_id);
        }
    }
}

fn log_startup_info(config: &AppConfig, config_path: Option<&Path>) {
    info!("=== Impedance Scan ===");
    match config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults / auto-detected"),
    }
    info!(
        "Function: {} | Range: {} | {} points per sweep",
        config.instrument.function, config.instrument.range, config.instrument.points_per_sweep
    );
    info!("Thermal device: {:?}", config.thermal.device);
    match config.stability.max_attempts {
        Some(max) => info!("Equilibration attempts: at most {max}"),
        None => info!("Equilibration attempts: unlimited"),
    }
}

/// Setup Ctrl+C handler for graceful shutdown
fn setup_shutdown_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping scan...");
        shutdown_flag_clone.store(true, Ordering::SeqCst);
    })?;

    Ok(shutdown_flag)
}

fn initialize_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}
