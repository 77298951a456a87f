//! Show NDI streams on HDMI outputs.
//!
//! `show` maps one stream to one connector and runs until interrupted;
//! `auto` pairs the first three discovered sources with the first three
//! connected displays. `status` and `stop` work through the per-display
//! status files, so they also reach mappings owned by other processes.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Display NDI streams on local video outputs.
#[derive(Parser, Debug)]
#[command(name = "ndi-display", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List NDI sources on the network.
    List,
    /// List video outputs and their modes.
    Displays,
    /// Show a stream on a display until interrupted.
    Show {
        /// NDI source name, `MACHINE (source)` form.
        stream: String,
        /// Display id from `displays`.
        display: usize,
    },
    /// Stop the mapping on a display.
    Stop {
        /// Display id from `displays`.
        display: usize,
    },
    /// Report active mappings.
    Status,
    /// Map the first three streams to the first three displays.
    Auto,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
        Err(e) => {
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

    match imp::run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use super::Command;
    use anyhow::Context;
    use bridge_display::{read_entries, status_dir, DrmDisplay, StreamManager};
    use bridge_ndi::{NdiFinder, NdiRuntime};

    const DISCOVERY_TIMEOUT_MS: u32 = 5000;

    pub(crate) async fn run(command: Command) -> anyhow::Result<()> {
        match command {
            Command::List => list_sources(),
            Command::Displays => list_displays(),
            Command::Show { stream, display } => show(&stream, display).await,
            Command::Stop { display } => stop(display),
            Command::Status => status(),
            Command::Auto => auto().await,
        }
    }

    fn list_sources() -> anyhow::Result<()> {
        let runtime = NdiRuntime::acquire().context("NDI runtime unavailable")?;
        let finder = NdiFinder::new(runtime)?;
        println!("Searching for NDI sources...");
        let sources = finder.wait_for_sources(DISCOVERY_TIMEOUT_MS);

        if sources.is_empty() {
            println!("No NDI sources found");
            return Ok(());
        }
        println!("\nAvailable NDI sources:");
        for (index, source) in sources.iter().enumerate() {
            if source.ip.is_empty() {
                println!("  {index}: {}", source.name);
            } else {
                println!("  {index}: {} ({})", source.name, source.ip);
            }
        }
        Ok(())
    }

    fn list_displays() -> anyhow::Result<()> {
        let display = DrmDisplay::open_card().context("display system unavailable")?;
        println!("\nAvailable displays:");
        for info in display.displays() {
            if info.connected {
                println!(
                    "  Display {}: {} [{}x{} @ {} Hz]",
                    info.id, info.connector, info.width, info.height, info.refresh
                );
            } else {
                println!("  Display {}: {} [not connected]", info.id, info.connector);
            }
        }
        Ok(())
    }

    async fn show(stream: &str, display: usize) -> anyhow::Result<()> {
        let runtime = NdiRuntime::acquire().context("NDI runtime unavailable")?;
        let manager = StreamManager::new(runtime);
        manager
            .map(stream, display)
            .with_context(|| format!("failed to map '{stream}' to display {display}"))?;

        println!("Streaming '{stream}' on display {display}. Press Ctrl+C to stop.");
        stats_loop(&manager, display).await;

        manager.unmap(display);
        Ok(())
    }

    async fn auto() -> anyhow::Result<()> {
        let runtime = NdiRuntime::acquire().context("NDI runtime unavailable")?;
        let manager = StreamManager::new(runtime);
        let mapped = manager.auto_map()?;
        if mapped == 0 {
            anyhow::bail!("nothing to map");
        }
        println!("{mapped} stream(s) mapped. Press Ctrl+C to stop.");

        let _ = tokio::signal::ctrl_c().await;
        Ok(())
    }

    /// Wait for Ctrl+C, logging receiver stats once a minute.
    async fn stats_loop(manager: &StreamManager, display: usize) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = ticker.tick() => {
                    if let Some(stats) = manager.display_stats(display) {
                        tracing::info!(
                            "display {display}: {} frames at {:.1} fps ({}x{}), {} dropped",
                            stats.frames_received,
                            stats.fps,
                            stats.width,
                            stats.height,
                            stats.frames_dropped,
                        );
                    }
                }
            }
        }
    }

    fn stop(display: usize) -> anyhow::Result<()> {
        let entries = read_entries(&status_dir());
        let Some(entry) = entries.iter().find(|e| e.display_id == display) else {
            println!("Display {display} is not mapped");
            return Ok(());
        };

        // The owning process removes the status file on shutdown.
        // SAFETY: sending a signal, no memory involved.
        let rc = unsafe { libc::kill(entry.pid as i32, libc::SIGTERM) };
        if rc == 0 {
            println!(
                "Stopped '{}' on display {display} (pid {})",
                entry.stream_name, entry.pid
            );
            Ok(())
        } else {
            anyhow::bail!("could not signal pid {}", entry.pid);
        }
    }

    fn status() -> anyhow::Result<()> {
        let entries = read_entries(&status_dir());
        if entries.is_empty() {
            println!("No active stream mappings");
            return Ok(());
        }
        println!("\nActive stream mappings:");
        for entry in entries {
            println!(
                "  Display {} <- {} [{}x{} @ {:.1} fps, {} received, {} dropped]",
                entry.display_id,
                entry.stream_name,
                entry.width,
                entry.height,
                entry.fps,
                entry.frames_received,
                entry.frames_dropped,
            );
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::Command;

    pub(crate) async fn run(_command: Command) -> anyhow::Result<()> {
        anyhow::bail!("ndi-display requires Linux (DRM/KMS and PipeWire)");
    }
}
