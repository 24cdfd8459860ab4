mod console;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use sluice_proxy::{ProxyConfig, ProxyServer, StoreEvent, StoreEvents, event_channel};
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sluice", about = "Interactive TLS-intercepting HTTP proxy")]
struct Cli {
    /// TOML configuration file, created with defaults when missing.
    #[arg(long, default_value = "sluice.toml")]
    config: PathBuf,
    /// Listen host, overriding the configuration file.
    #[arg(long)]
    listen: Option<String>,
    /// Listen port, overriding the configuration file.
    #[arg(long)]
    port: Option<u16>,
    /// Start with interception enabled.
    #[arg(long)]
    intercept: bool,
    /// Do not read operator commands from stdin.
    #[arg(long)]
    no_console: bool,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ProxyConfig::load_or_create(&cli.config).map_err(|err| err.to_string())?;
    if let Some(host) = cli.listen {
        config.listen.host = host;
    }
    if let Some(port) = cli.port {
        config.listen.port = port;
    }
    if cli.intercept {
        config.intercept.enabled_on_start = true;
    }

    let (notifier, events) = event_channel();
    let proxy =
        ProxyServer::from_config(config, Arc::new(notifier)).map_err(|err| err.to_string())?;
    if let Some(path) = proxy.certificates().ca_certificate_path() {
        tracing::info!(path = %path.display(), "CA certificate");
    }

    tokio::spawn(log_events(events));
    if !cli.no_console {
        tokio::spawn(console::run(proxy.clone()));
    }

    proxy.run().await.map_err(|err| err.to_string())
}

async fn log_events(mut events: StoreEvents) {
    while let Some(event) = events.next().await {
        let (kind, summary) = match &event {
            StoreEvent::Added(summary) => ("captured", summary),
            StoreEvent::Updated(summary) => ("updated", summary),
        };
        tracing::info!(
            seq = summary.seq_number,
            method = %summary.method,
            url = %summary.url,
            status = ?summary.status_code,
            dropped = summary.was_dropped,
            "{kind}"
        );
    }
}
