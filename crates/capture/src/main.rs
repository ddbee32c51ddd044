//! qt-pull
//!
//! Enables the hidden screen-capture configuration of an attached iOS device
//! and streams its raw bulk data to a file or a push socket.

use anyhow::{Context, Result, anyhow};
use capture::config::CaptureConfig;
use capture::listing::{ListingFormat, write_listing};
use capture::orchestrator::{RetryPolicy, StartError, StartOutcome, start_with_retry};
use capture::pipeline::CapturePipeline;
use capture::sink::{Backend, SinkWorker};
use capture::usb::{ActivationController, ActivationState, DeviceCatalog, Markers};
use clap::{ArgGroup, CommandFactory, Parser};
use common::{LogContext, LogFormat, ShutdownCoordinator, ShutdownReason};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "qt-pull")]
#[command(
    author,
    version,
    about = "Pull the raw screen-capture stream from an iOS device over USB"
)]
#[command(group(ArgGroup::new("mode").args(["devices", "pull", "enable", "disable"])))]
#[command(long_about = "
Enables the hidden QuickTime screen-capture USB configuration of an attached
iOS device, reads its raw bulk stream, splits it into length-prefixed frames
and forwards every frame to a file or a push socket.

EXAMPLES:
    # List devices
    qt-pull --devices

    # List devices as JSON with decimal vendor/product IDs
    qt-pull --devices --json --decimal

    # Stream the first device to a push socket
    qt-pull --pull --push-spec tcp://127.0.0.1:7878

    # Stream one device to a file
    qt-pull --pull --udid 00008030-001A2C3E0E38802E --file ~/capture.raw

    # Enable / disable the capture configuration
    qt-pull --enable --udid 00008030-001A2C3E0E38802E
    qt-pull --disable

CONFIGURATION:
    qt-pull looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/qt-pull/config.toml
    3. /etc/qt-pull/config.toml
    4. Built-in defaults
")]
struct Args {
    /// List candidate devices
    #[arg(long)]
    devices: bool,

    /// Stream frames from a device to the sink
    #[arg(long)]
    pull: bool,

    /// Enable the capture configuration
    #[arg(long)]
    enable: bool,

    /// Disable the capture configuration
    #[arg(long)]
    disable: bool,

    /// Device UDID (serial number); the first suitable device when omitted
    #[arg(short, long, value_name = "UDID")]
    udid: Option<String>,

    /// Append frames to this file instead of pushing them
    #[arg(long, value_name = "PATH")]
    file: Option<String>,

    /// Push socket to dial, e.g. tcp://127.0.0.1:7878
    #[arg(long, value_name = "SPEC")]
    push_spec: Option<String>,

    /// List devices as JSON
    #[arg(long)]
    json: bool,

    /// Show vendor and product IDs in decimal
    #[arg(long)]
    decimal: bool,

    /// Verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = CaptureConfig::default();
        let path = CaptureConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    if !(args.devices || args.pull || args.enable || args.disable) {
        Args::command().print_help()?;
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        CaptureConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        CaptureConfig::load_or_default()
    };
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    // RUST_LOG wins over all of these inside LogContext
    let log_level = match (&args.log_level, args.verbose) {
        (Some(level), _) => level.clone(),
        (None, true) => "debug".to_string(),
        (None, false) => config.general.log_level.clone(),
    };
    let log = LogContext::new(&log_level, config.general.log_format)
        .context("Failed to setup logging")?;

    log.instrument(run(args, config)).await
}

fn apply_overrides(config: &mut CaptureConfig, args: &Args) {
    if let Some(udid) = &args.udid {
        config.device.udid = Some(udid.clone());
    }
    if let Some(file) = &args.file {
        config.sink.file = Some(file.clone());
    }
    if let Some(spec) = &args.push_spec {
        config.sink.push_spec = spec.clone();
        if args.file.is_none() {
            config.sink.file = None;
        }
    }
    if args.json_logs {
        config.general.log_format = LogFormat::Json;
    }
}

async fn run(args: Args, config: CaptureConfig) -> Result<()> {
    info!("qt-pull v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(config);
    let udid = config.device.udid.clone();

    if args.devices {
        let format = ListingFormat {
            json: args.json,
            decimal: args.decimal,
        };
        return blocking(move || devices_mode(&config, udid.as_deref(), format)).await;
    }
    if args.enable {
        return blocking(move || enable_mode(&config, udid.as_deref())).await;
    }
    if args.disable {
        return blocking(move || disable_mode(&config, udid.as_deref())).await;
    }

    pull_mode(config, udid).await
}

/// Run libusb work off the runtime
async fn blocking<F>(f: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    common::logging::spawn_blocking(f)
        .await
        .context("USB task failed")?
}

fn catalog(config: &CaptureConfig) -> Result<DeviceCatalog> {
    DeviceCatalog::new(Markers::from(&config.activation)).context("Failed to initialize libusb")
}

fn devices_mode(config: &CaptureConfig, udid: Option<&str>, format: ListingFormat) -> Result<()> {
    let catalog = catalog(config)?;
    let devices = catalog
        .list_candidates()
        .context("Failed to enumerate USB devices")?;
    let summaries: Vec<_> = devices.iter().map(|d| catalog.describe(d)).collect();
    drop(devices);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    write_listing(&mut out, &summaries, udid, format).context("Failed to write device list")
}

fn enable_mode(config: &CaptureConfig, udid: Option<&str>) -> Result<()> {
    let catalog = catalog(config)?;
    let device = match udid {
        Some(udid) => catalog.open_by_serial(udid)?,
        None => {
            let device = catalog.open_first(Some(ActivationState::Disabled))?;
            if let Some(serial) = device.as_ref().and_then(|d| d.serial()) {
                info!("Using first disabled device; udid={}", serial);
            }
            device
        }
    };

    let Some(device) = device else {
        info!("Could not find a disabled device to activate");
        return Ok(());
    };
    if catalog.classify(device.descriptors()) == ActivationState::Enabled {
        info!("Device already enabled");
        return Ok(());
    }

    let controller = ActivationController::new(config.activation.clone());
    let device = controller
        .ensure_enabled(&catalog, device)
        .context("Failed to enable device")?;
    info!(
        "Capture configuration enabled on {}",
        device.serial().unwrap_or_default()
    );
    Ok(())
}

fn disable_mode(config: &CaptureConfig, udid: Option<&str>) -> Result<()> {
    let catalog = catalog(config)?;
    let device = match udid {
        Some(udid) => catalog.open_by_serial(udid)?,
        None => {
            let device = catalog.open_first(Some(ActivationState::Enabled))?;
            if let Some(serial) = device.as_ref().and_then(|d| d.serial()) {
                info!("Using first enabled device; udid={}", serial);
            }
            device
        }
    };

    let Some(mut device) = device else {
        info!("Could not find an enabled device to disable");
        return Ok(());
    };
    if catalog.classify(device.descriptors()) == ActivationState::Disabled {
        info!("Device already disabled");
        return Ok(());
    }

    ActivationController::new(config.activation.clone())
        .disable(&mut device)
        .map_err(|e| anyhow!("Failed to disable device: {}", e))?;
    info!("Capture configuration disabled");
    Ok(())
}

async fn pull_mode(config: Arc<CaptureConfig>, udid: Option<String>) -> Result<()> {
    let coordinator = ShutdownCoordinator::new();
    // process: the final wait below, before tearing the sink down
    let process = coordinator.subscribe("process", 1)?;
    // session: the per-attempt stream watcher and the retry delay
    let session = coordinator.subscribe("session", 2)?;
    // sink: the drain watcher and the flush ticker
    let sink_shutdown = coordinator.subscribe("sink", 2)?;

    let backend = Backend::open(&config.sink).await?;
    let worker = SinkWorker::spawn(
        backend,
        config.sink.queue_depth,
        config.sink.flush_interval(),
        sink_shutdown,
    );

    let interrupts = {
        let coordinator = coordinator.clone();
        common::logging::spawn(async move {
            if let Err(e) = coordinator.listen_for_interrupt().await {
                error!("Error waiting for Ctrl+C: {}", e);
                return;
            }
            info!("Shutting down, press Ctrl+C again to force exit");
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Second Ctrl+C, exiting without teardown");
                std::process::exit(130);
            }
        })
    };

    let mut pipeline =
        CapturePipeline::new(config.clone(), udid, worker.handle(), session.clone());
    let outcome =
        start_with_retry(RetryPolicy::from(&config.startup), &session, &mut pipeline).await;

    match &outcome {
        Ok(StartOutcome::Streamed { attempt, summary }) => info!(
            attempt,
            frames = summary.frames,
            bytes = summary.bytes,
            "Streaming finished"
        ),
        Ok(StartOutcome::Interrupted { attempts }) => {
            info!(attempts, "Interrupted before streaming started")
        }
        Err(e) => error!("{}", e),
    }

    // Stop everything still listening, then wait for our own copy
    coordinator.trigger(ShutdownReason::Requested);
    process.recv().await;

    let grace = config.shutdown.teardown_grace();
    match tokio::time::timeout(grace, worker.shutdown()).await {
        Ok(Ok(stats)) => info!(frames = stats.frames, errors = stats.errors, "Sink closed"),
        Ok(Err(e)) => warn!("Sink shutdown failed: {}", e),
        Err(_) => warn!("Sink did not close within {:?}", grace),
    }
    interrupts.abort();

    match outcome {
        Ok(_) => Ok(()),
        Err(e @ StartError::RetriesExhausted { .. }) => {
            Err(anyhow::Error::new(e).context("Could not start streaming"))
        }
        Err(e) => Err(e.into()),
    }
}
