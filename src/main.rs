//! Portgate - Main entry point
//!
//! Exposes local HTTP ports on an overlay network, restricted to their owner

use anyhow::Result;
use clap::Parser;
use portgate::{Args, Supervisor};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    let config = match args.to_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("Usage: TS_AUTHKEY=<key> portgate --name <name> --ports <ports>");
            std::process::exit(2);
        }
    };

    info!("Starting Portgate v{}", env!("CARGO_PKG_VERSION"));
    info!("Node: {}", config.hostname);
    info!("Ports: {}", config.ports);
    if config.health_enabled() {
        info!(
            "DNS health checks enabled ({:?} interval)",
            config.health.interval
        );
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let supervisor = Supervisor::new(config, Arc::new(args.overlay()));
    supervisor.run(shutdown).await?;

    info!("Portgate stopped");
    Ok(())
}

/// Build the log filter from the level flag; `RUST_LOG` wins when set.
/// `TSPROXY_DEBUG` turns on the overlay provider's own debug logs.
fn init_logging(level: &str) {
    let mut filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()));

    if std::env::var_os("TSPROXY_DEBUG").is_some() {
        if let Ok(directive) = "portgate::overlay=debug".parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
