//! Capture-to-NDI bridge service.
//!
//! Opens a hardware capture device and republishes it as an NDI sender,
//! supervised for automatic recovery across unplug, format change and
//! network churn.

mod config;
mod controller;
mod sink;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use bridge_capture::{Backend, BackendKind, CaptureDevice};

use crate::config::BridgeConfig;
use crate::controller::AppController;

/// Bridge a hardware capture device onto the network as an NDI sender.
#[derive(Parser, Debug)]
#[command(name = "ndi-bridge", version, about)]
struct Cli {
    /// Capture device name (positional form).
    device_positional: Option<String>,

    /// NDI sender name (positional form).
    ndi_name_positional: Option<String>,

    /// Capture backend: v4l2 (Linux), mf or dl (Windows).
    #[arg(short = 't', long = "type")]
    backend: Option<String>,

    /// Capture device name, path or serial.
    #[arg(short, long)]
    device: Option<String>,

    /// Name to broadcast for this NDI sender.
    #[arg(short = 'n', long = "ndi-name")]
    ndi_name: Option<String>,

    /// List available capture devices and exit.
    #[arg(short, long)]
    list_devices: bool,

    /// Disable automatic retry on errors.
    #[arg(long)]
    no_retry: bool,

    /// Delay between retries in milliseconds.
    #[arg(long)]
    retry_delay: Option<u64>,

    /// Maximum retry attempts (-1 for infinite).
    #[arg(long)]
    max_retries: Option<i32>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Path to the configuration file.
    #[arg(short, long, default_value = "/etc/ndi-bridge/config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Exit codes are 0/1 only; clap's default of 2 for bad flags is not used.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            // --help / --version.
            print!("{e}");
            return ExitCode::SUCCESS;
        }
    };

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let file_config = BridgeConfig::load(&cli.config)
        .with_context(|| format!("bad config file {}", cli.config.display()))?;

    let backend_kind = match &cli.backend {
        Some(name) => name
            .parse::<BackendKind>()
            .map_err(|e| anyhow::anyhow!(e))?,
        None => BackendKind::default_for_platform(),
    };
    let backend = Backend::new(backend_kind);

    if cli.list_devices {
        let devices = backend.enumerate_devices();
        if devices.is_empty() {
            println!("No capture devices found.");
        } else {
            println!("Available capture devices:");
            for (index, device) in devices.iter().enumerate() {
                println!("  {index}: {} [{}]", device.name, device.id);
            }
        }
        return Ok(());
    }

    let mut controller_config = file_config.controller_config();
    if let Some(device) = cli.device.or(cli.device_positional) {
        controller_config.device = device;
    }
    if let Some(name) = cli.ndi_name.or(cli.ndi_name_positional) {
        controller_config.ndi_name = name;
    }
    if cli.no_retry {
        controller_config.auto_retry = false;
    }
    if let Some(delay) = cli.retry_delay {
        controller_config.retry_delay = std::time::Duration::from_millis(delay);
    }
    if let Some(max) = cli.max_retries {
        controller_config.max_retries = max;
    }

    tracing::info!(
        "bridging '{}' as NDI '{}'",
        if controller_config.device.is_empty() {
            "<first device>"
        } else {
            &controller_config.device
        },
        controller_config.ndi_name,
    );

    let sink_factory = sink::ndi_sink_factory(controller_config.ndi_name.clone());
    let mut controller = AppController::new(controller_config, backend, sink_factory);
    controller
        .start()
        .map_err(|e| anyhow::anyhow!("failed to start supervisor: {e}"))?;

    // Run until a signal arrives or the supervisor gives up on its own
    // (fatal init failure, retries exhausted).
    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(200));
    let stopped_early = loop {
        tokio::select! {
            () = &mut shutdown => break false,
            _ = ticker.tick() => {
                if controller.state() == controller::ControllerState::Stopped {
                    break true;
                }
            }
        }
    };

    tracing::info!("shutting down");
    controller.stop();
    let (captured, sent, dropped) = controller.frame_stats();
    tracing::info!("final stats: captured {captured}, sent {sent}, dropped {dropped}");

    if stopped_early {
        anyhow::bail!("pipeline stopped: initialisation failed or retries exhausted");
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
