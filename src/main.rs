//! acmecap - multi-probe power capture for the BayLibre ACME cape
//!
//! Captures voltage and current on every probe of an ACME cape for a
//! fixed duration, then reports min/max/average voltage, current and
//! power per power rail.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Invalid arguments or configuration
//!   2 - ACME cape not reachable
//!   3 - Cape initialization (discovery, device access) failed
//!   4 - A probe is missing in the requested slots
//!   5 - Capture configuration or capture failed

mod analysis;
mod cape;
mod capture;
mod cli;
mod config;
mod device;
mod error;
mod models;
mod probe;
mod report;
mod steps;

use anyhow::{Context, Result};
use cape::{Cape, SlotInfoSource, XmlRpcDiscovery};
use capture::CaptureSession;
use cli::Args;
use config::{Config, CONFIG_FILE_NAME};
use device::{DeviceContext, SimulatedCape};
use error::CaptureError;
use models::{Report, ReportMetadata};
use std::io::Write;
use steps::{
    StepFailure, Steps, EXIT_CAPTURE_FAILED, EXIT_INIT_FAILED, EXIT_INVALID_ARGS,
    EXIT_MISSING_PROBE, EXIT_UNREACHABLE,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(EXIT_INVALID_ARGS);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    init_logging(&args);

    eprintln!("acmecap (version {})\n", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    let mut steps = Steps::stderr();
    match run_capture(args, &mut steps).await {
        Ok(report) => {
            let failed = report.failed_slots();
            if !failed.is_empty() {
                warn!("Capture errors on slot(s) {:?}", failed);
            }
            Ok(())
        }
        Err(e) => match e.downcast::<StepFailure>() {
            Ok(failure) => {
                error!("{} failed", failure.step);
                std::process::exit(failure.code);
            }
            Err(e) => {
                error!("Capture failed: {:#}", e);
                eprintln!("\n❌ Error: {:#}", e);
                std::process::exit(EXIT_CAPTURE_FAILED);
            }
        },
    }
}

/// Handle --init-config: generate a default .acmecap.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(CONFIG_FILE_NAME);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            CONFIG_FILE_NAME
        );
        std::process::exit(EXIT_INVALID_ARGS);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", CONFIG_FILE_NAME))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE_NAME);
    println!("   Edit it to set the cape address, capture duration, channels and more.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
///
/// Logs go to stderr so the report on stdout can be piped.
fn init_logging(args: &Args) {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Run the complete capture workflow.
async fn run_capture<W: Write>(args: Args, steps: &mut Steps<W>) -> Result<Report> {
    // Step 1: Configuration
    let mut config = load_config(&args).map_err(|e| {
        eprintln!("Error: {:#}", e);
        steps.failed(EXIT_INVALID_ARGS, "Load configuration")
    })?;
    config.merge_with_args(&args);
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return Err(steps.failed(EXIT_INVALID_ARGS, "Check user arguments"));
    }
    steps.ok("Check user arguments");

    let count = config.rail_count();
    let slot_count = config.cape.slot_count;

    // Step 2: Reachability and discovery
    let (mut cape, host) = if args.simulate {
        let sim = SimulatedCape::populated(slot_count, count, config.simulation.clone());
        if !sim.is_reachable() {
            return Err(steps.failed(EXIT_UNREACHABLE, "Ping ACME"));
        }
        steps.ok("Ping ACME (simulated)");

        let context = Box::new(sim.clone());
        let cape = init_cape(&sim, context, slot_count, steps).await?;
        (cape, "simulated".to_string())
    } else {
        let host = config.cape.host.clone();
        if !cape::is_reachable(&host).await {
            eprintln!("Error: {}", CaptureError::Unreachable(host.clone()));
            return Err(steps.failed(EXIT_UNREACHABLE, format!("Ping ACME ({})", host)));
        }
        steps.ok(&format!("Ping ACME ({})", host));

        let discovery = XmlRpcDiscovery::new(
            &host,
            config.cape.discovery_port,
            &config.cape.discovery_path,
            config.request_timeout(),
        )
        .map_err(|e| {
            eprintln!("Error: {}", e);
            steps.failed(EXIT_INIT_FAILED, "Init ACME cape instance")
        })?;
        info!("Slot discovery service: {}", discovery.endpoint());

        let context = open_device_context(&discovery, &host, slot_count, steps).await?;
        let cape = init_cape(&discovery, context, slot_count, steps).await?;
        (cape, host)
    };

    // Step 3: Check all probes are attached
    let mut missing = false;
    for slot in 1..=count {
        match cape.probe(slot) {
            Ok(probe) => steps.ok(&format!(
                "Detect probe in slot {} ({}, shunt {} uOhm{})",
                slot,
                probe.kind(),
                probe.shunt_uohm(),
                if probe.has_power_switch() { ", power switch" } else { "" }
            )),
            Err(_) => {
                steps.line(&format!("❌ Detect probe in slot {}", slot));
                missing = true;
            }
        }
    }
    if missing {
        return Err(StepFailure::new(EXIT_MISSING_PROBE, "Detect probes").into());
    }

    // Step 4: Capture
    let session = CaptureSession::from_cape(
        &mut cape,
        count,
        config.capture.channels.clone(),
        config.duration(),
    )
    .map_err(|e| {
        eprintln!("Error: {}", e);
        steps.failed(EXIT_CAPTURE_FAILED, "Create capture session")
    })?
    .with_oversampling_ratio(config.capture.oversampling_ratio)
    .with_progress(config.report.show_progress);

    steps.line(&format!(
        "\n⏳ Capturing {} power rail(s) for {}s...",
        session.len(),
        config.capture.duration_seconds
    ));
    let outcome = session.run().await.map_err(|e| {
        eprintln!("Error: {}", e);
        match e {
            CaptureError::ConfigurationFailed { slot, .. } => steps.failed(
                EXIT_CAPTURE_FAILED,
                format!("Configure capture for probe in slot #{}", slot),
            ),
            _ => steps.failed(EXIT_CAPTURE_FAILED, "Capture"),
        }
    })?;
    steps.ok("Capture");

    // Step 5: Process samples
    let metadata = ReportMetadata {
        host,
        capture_date: outcome.started_at,
        duration_seconds: config.duration().as_secs_f64(),
        elapsed_seconds: outcome.elapsed.as_secs_f64(),
    };
    let report = analysis::aggregate(
        &outcome.results,
        &config.capture.names,
        &config.report.power_unit,
        metadata,
    );
    steps.ok("Process samples");

    let output = report::render(&report, config.report.format)?;
    println!("{}", output);

    Ok(report)
}

/// Discover the cape's probes and bind them to devices.
async fn init_cape<S: SlotInfoSource, W: Write>(
    source: &S,
    context: Box<dyn DeviceContext>,
    slot_count: usize,
    steps: &mut Steps<W>,
) -> Result<Cape> {
    match Cape::discover(source, context, slot_count).await {
        Ok(cape) => {
            debug!("Populated slots: {:?}", cape.populated_slots());
            steps.ok("Init ACME cape instance");
            Ok(cape)
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            Err(steps.failed(EXIT_INIT_FAILED, "Init ACME cape instance"))
        }
    }
}

/// Open the network IIO context of the cape.
#[cfg(feature = "iio")]
async fn open_device_context<W: Write>(
    _discovery: &XmlRpcDiscovery,
    host: &str,
    _slot_count: usize,
    steps: &mut Steps<W>,
) -> Result<Box<dyn DeviceContext>> {
    match device::IioContext::connect(host) {
        Ok(context) => {
            steps.ok("Init ACME IIO context");
            Ok(Box::new(context))
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            Err(steps.failed(EXIT_INIT_FAILED, "Init ACME IIO context"))
        }
    }
}

/// Without a device backend, list the probes reported by the discovery
/// service and stop.
#[cfg(not(feature = "iio"))]
async fn open_device_context<W: Write>(
    discovery: &XmlRpcDiscovery,
    host: &str,
    slot_count: usize,
    steps: &mut Steps<W>,
) -> Result<Box<dyn DeviceContext>> {
    let slots = cape::survey(discovery, slot_count).await.map_err(|e| {
        eprintln!("Error: {}", e);
        steps.failed(EXIT_INIT_FAILED, "Init ACME cape instance")
    })?;

    for (i, descriptor) in slots.iter().enumerate() {
        if let Some(d) = descriptor {
            steps.line(&format!(
                "   Slot {}: {} probe, shunt {} uOhm{}",
                i + 1,
                d.kind,
                d.shunt_uohm,
                if d.power_switch { ", power switch" } else { "" }
            ));
        }
    }

    let e = CaptureError::BackendUnavailable(format!(
        "{}: built without the `iio` feature; rebuild with `--features iio` or use --simulate",
        host
    ));
    eprintln!("Error: {}", e);
    Err(steps.failed(EXIT_INIT_FAILED, "Init ACME IIO context"))
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", CONFIG_FILE_NAME);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {:#}", e);
            Ok(Config::default())
        }
    }
}
