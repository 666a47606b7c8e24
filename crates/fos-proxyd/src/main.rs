//! fOS Proxy Daemon
//!
//! Main entry point. Initializes the global allocator, sets up logging,
//! wires the lifecycle manager to the in-process network layer and hands
//! control to the console.

mod config;
mod console;

use anyhow::{Context, Result};
use clap::Parser;
use config::DaemonConfig;
use fos_network::{CookieJar, HttpClient, HttpClientConfig, NetworkSettings};
use fos_proxy::{
    Collaborators, ConnectionManager, HttpProbe, IpWhoIs, JsonFileStore, NativeHostConnector,
    SessionPlatform, StatusEvent,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "fos-proxyd", version, about = "Proxy connection lifecycle daemon")]
struct Args {
    /// TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Log filter (e.g. `debug`, `fos_proxy=trace`)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = DaemonConfig::load(args.config.as_deref())?;

    // Initialize logging
    let level = args.log_level.unwrap_or_else(|| config.log_level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("fOS proxy daemon starting...");
    info!("Using mimalloc allocator");

    // Network layer shared by the probe, lookups and usage accounting
    let settings = NetworkSettings::new();
    let cookies = CookieJar::new();
    let client = HttpClient::new(
        HttpClientConfig {
            timeout: config.request_timeout(),
            ..HttpClientConfig::default()
        },
        settings.clone(),
        cookies.clone(),
    );
    let platform = Arc::new(SessionPlatform::new(settings, cookies));

    let store = JsonFileStore::open(&config.store_path)
        .await
        .with_context(|| format!("opening store {}", config.store_path.display()))?;

    let manager = ConnectionManager::start(Collaborators {
        store: Arc::new(store),
        platform: platform.clone(),
        probe: Arc::new(HttpProbe::with_url(client.clone(), platform, config.probe_url.clone())),
        lookup: Arc::new(IpWhoIs::with_url(client.clone(), config.lookup_url.clone())),
        usage: Arc::new(client.clone()),
        helper: Arc::new(NativeHostConnector::new(
            config.helper.program.clone(),
            config.helper.args.clone(),
        )),
    })
    .await?;
    client.set_auth_handler(manager.activator());

    let mut events = manager.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(StatusEvent::StatusUpdate { state }) => info!("State: {}", state),
                Ok(StatusEvent::Toast { message }) => info!("Notice: {}", message),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    console::run(manager.clone()).await?;

    manager.shutdown().await;
    event_log.abort();

    info!("fOS proxy daemon shutting down");
    Ok(())
}
