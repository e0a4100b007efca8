//! Pankha Hub
//!
//! One process for the whole fleet: accepts agent and UI WebSocket sessions,
//! maintains the registry, brokers commands, serves the REST surface, and
//! runs the deployment service.

mod api;
mod commands;
mod delta;
mod deploy;
mod history;
mod license;
mod profiles;
mod registry;
mod retention;
mod state;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use commands::CommandRouter;
use deploy::DeployService;
use license::{CommunityLicense, LicenseOracle};
use profiles::ProfileStore;
use registry::FleetRegistry;
use retention::{MemorySink, RetentionBuffer, FLUSH_INTERVAL, PURGE_INTERVAL};
use state::AppState;

/// Payloads above this are refused with 413.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Agents stuck in `updating` this long are declared errored.
const UPDATE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(name = "pankha-hub")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Pankha fleet hub", long_about = None)]
struct Args {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0:3143")]
    bind: SocketAddr,

    /// Externally reachable HTTP base URL (LAN address agents can pull from)
    #[arg(long, default_value = "http://127.0.0.1:3143")]
    public_url: String,

    /// Public release source for staging agent binaries
    #[arg(
        long,
        default_value = "https://github.com/Anexgohan/pankha/releases/download"
    )]
    release_url: String,

    /// Cache directory for staged binaries
    #[arg(long, default_value = "/var/lib/pankha-hub/binaries")]
    cache_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Pankha Hub v{} starting", env!("CARGO_PKG_VERSION"));

    let ws_url = format!(
        "{}/websocket",
        args.public_url
            .replace("https://", "wss://")
            .replace("http://", "ws://")
    );

    let license: Arc<dyn LicenseOracle> = Arc::new(CommunityLicense);
    let sink = MemorySink::new();
    let state = Arc::new(AppState {
        registry: Arc::new(FleetRegistry::new()),
        commands: CommandRouter::new(),
        profiles: Arc::new(ProfileStore::with_builtins()),
        deploy: Arc::new(DeployService::new(args.cache_dir, args.release_url)),
        retention: RetentionBuffer::new(sink),
        history: Arc::new(history::HistoryStore::new()),
        license,
        http_url: args.public_url.clone(),
        ws_url,
    });

    spawn_background_tasks(state.clone());

    let app = Router::new()
        .route("/websocket", get(ws::agent::agent_ws))
        .route("/ws/ui", get(ws::subscriber::subscriber_ws))
        .merge(api::router())
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http());

    info!("Listening on {}", args.bind);
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
        })
        .await?;

    info!("Hub shutdown complete");
    Ok(())
}

fn spawn_background_tasks(state: Arc<AppState>) {
    // Retention sink flusher
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                timer.tick().await;
                state.retention.flush().await;
            }
        });
    }

    // Retention purge on the license tier's window
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(PURGE_INTERVAL);
            loop {
                timer.tick().await;
                state.retention.purge(state.license.retention_days()).await;
            }
        });
    }

    // Stale self-update sweeper
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                timer.tick().await;
                state.registry.sweep_stale_updates(UPDATE_TIMEOUT).await;
            }
        });
    }
}
