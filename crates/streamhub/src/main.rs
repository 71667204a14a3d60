//! # streamhub
//!
//! Daemon binary: loads settings, installs logging and metrics, registers
//! the built-in producers and serves until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use streamhub_core::logging::{LogFormat, init_subscriber};
use streamhub_server::{
    ConnectionManager, HubServer, ProducerCatalog, SERVER_STATS_TOPIC, ServerConfig,
    StatsProducer,
};
use streamhub_settings::HubSettings;

/// Topic pub-sub hub over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "streamhub", about = "Topic pub-sub hub over WebSocket")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.streamhub/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter when `RUST_LOG` is unset (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Apply command-line overrides on top of loaded settings.
    fn apply(&self, settings: &mut HubSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}

fn log_format(settings: &HubSettings) -> LogFormat {
    if settings.logging.json {
        LogFormat::Json
    } else {
        LogFormat::Compact
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .config
        .clone()
        .unwrap_or_else(streamhub_settings::settings_path);
    let mut settings = streamhub_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings);

    init_subscriber(&settings.logging.level, log_format(&settings));

    let metrics = match streamhub_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics disabled");
            None
        }
    };

    let config = ServerConfig::from(&settings);
    let manager = Arc::new(ConnectionManager::new(config.max_connections));
    let catalog = ProducerCatalog::new().with(
        SERVER_STATS_TOPIC,
        Arc::new(StatsProducer::new(Arc::clone(&manager))),
    );

    let mut server = HubServer::with_manager(config, catalog, manager);
    if let Some(handle) = metrics {
        server = server.with_metrics(handle);
    }

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        "streamhub listening on ws://{addr}/ws/{{topic}} ({} topics)",
        server.catalog().len()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().graceful_shutdown(vec![handle], None).await;
    tracing::info!("Shutdown complete");
    Ok(())
}
