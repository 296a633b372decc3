//! # bayeux
//!
//! Bayeux server binary: loads settings, installs logging and metrics, then
//! serves the long-polling and WebSocket transports until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bayeux_server::BayeuxServer;
use bayeux_settings::BayeuxSettings;
use bayeux_telemetry::{TelemetryConfig, init_telemetry};
use clap::Parser;
use tokio::net::TcpListener;

/// Bayeux publish/subscribe server.
#[derive(Parser, Debug)]
#[command(name = "bayeux", about = "Bayeux publish/subscribe server")]
struct Cli {
    /// Settings file (defaults to `~/.bayeux/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Log level (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn apply(&self, settings: &mut BayeuxSettings) {
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

fn load(cli: &Cli) -> Result<BayeuxSettings> {
    let mut settings = match &cli.config {
        Some(path) => bayeux_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => bayeux_settings::load_settings().context("Failed to load settings")?,
    };
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    let telemetry = TelemetryConfig::from_level_name(&settings.logging.level, settings.logging.json)
        .context("Invalid log level")?;
    init_telemetry(&telemetry).context("Failed to initialize logging")?;

    let handle =
        bayeux_server::metrics::install_recorder().context("Failed to install metrics recorder")?;

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    let server = BayeuxServer::new(settings).with_metrics(handle);
    let shutdown = Arc::clone(server.shutdown());
    let serving = tokio::spawn(server.serve(listener));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("Shutting down...");
    shutdown.shutdown();

    serving
        .await
        .context("Server task panicked")?
        .context("Server failed")?;
    tracing::info!("Shutdown complete");
    Ok(())
}
