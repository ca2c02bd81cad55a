//! Selkie routing host
//!
//! Standalone host binary: accepts worker connections, routes sends, and
//! fans out publishes until an external shutdown signal arrives. Honors
//! SIGINT and SIGTERM by draining in-flight relays before closing, so it
//! behaves correctly under a container orchestrator.

use clap::Parser;
use selkie_cluster::{Host, HostConfig};
use tracing_subscriber::EnvFilter;

/// Selkie host CLI
#[derive(Parser, Debug)]
#[command(name = "selkie-host")]
#[command(about = "Selkie agent messaging routing host")]
#[command(version)]
struct Cli {
    /// Bind address for worker connections
    #[arg(short, long, default_value = "0.0.0.0:7600")]
    bind: String,

    /// Maximum number of connected workers
    #[arg(long, default_value_t = selkie_core::constants::WORKERS_COUNT_MAX)]
    max_workers: usize,

    /// Graceful-shutdown drain timeout in milliseconds
    #[arg(long, default_value_t = selkie_core::constants::DRAIN_TIMEOUT_MS_DEFAULT)]
    drain_timeout_ms: u64,

    /// Enable verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    let config = HostConfig {
        bind_address: cli.bind,
        workers_count_max: cli.max_workers,
        drain_timeout_ms: cli.drain_timeout_ms,
    };

    // Failing to bind is fatal: exit rather than run without a listener.
    let host = Host::bind(config).await?;
    let handle = host.handle();

    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received, draining");
        handle.shutdown();
    });

    host.run().await?;
    Ok(())
}

/// Wait for SIGINT or, on unix, SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
