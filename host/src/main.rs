//! ==============================================================================
//! main.rs - telemetry host entry point
//! ==============================================================================
//!
//! purpose:
//!     `serve` runs the readings api plus the synthetic data generator.
//!     `watch` runs the polling data context against a running api and logs
//!     what a dashboard would show.
//!
//! architecture (serve):
//!
//!     ┌─────────────────────────────────────────────────────────────┐
//!     │                    rust host (this file)                     │
//!     │  ┌─────────────┐          ┌─────────────────────────────┐   │
//!     │  │ generator   │          │ web server                  │   │
//!     │  │ (10s cycle) │          │ (port 5000, /api/data)      │   │
//!     │  └──────┬──────┘          └──────────────┬──────────────┘   │
//!     │         └────────────────┬───────────────┘                  │
//!     │                    ┌─────┴─────┐                            │
//!     │                    │  context  │ <- context.rs              │
//!     │                    └─────┬─────┘                            │
//!     │            ┌─────────────┴─────────────┐                    │
//!     │      ┌─────┴─────┐             ┌───────┴──────┐             │
//!     │      │ redb store│             │ fallback buf │             │
//!     │      └───────────┘             └──────────────┘             │
//!     └─────────────────────────────────────────────────────────────┘
//!
//! ==============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use telemetry_host::client::{self, ApiClient, DataContext};
use telemetry_host::config::HostConfig;
use telemetry_host::store::{self, ReadingStore, UnavailableStore};
use telemetry_host::{api, generator, AppContext};

#[derive(Parser)]
#[command(name = "telemetry-host", about = "IoT telemetry demo host")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the readings api and the data generator (default).
    Serve,
    /// Poll a running api and log device readings.
    Watch {
        /// Readings api base url; overrides client.api_url.
        #[arg(long)]
        api_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // step 1: load configuration
    let config = HostConfig::load_or_default().with_env_overrides();

    // step 2: logging (RUST_LOG wins over the configured level)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Watch { api_url } => watch_api(config, api_url).await,
    }
}

// ==============================================================================
// serve
// ==============================================================================

async fn serve(config: HostConfig) -> Result<()> {
    println!("===========================================================");
    println!("  Telemetry Host - Readings API");
    println!("===========================================================");
    config.print_summary();

    // step 3: open persistence, or carry on in degraded mode
    let store: Arc<dyn ReadingStore> = match store::connect(&config.database) {
        Ok(db) => {
            info!("database connected");
            Arc::new(db)
        }
        Err(e) if config.database.required => {
            error!(error = %e, "database required but unavailable");
            return Err(e).context("database connection is required");
        }
        Err(e) => {
            if config.server.environment == "production" {
                error!("production host is running without its database");
            }
            warn!(error = %e, "continuing without database, serving in-memory data");
            Arc::new(UnavailableStore::new(e.to_string()))
        }
    };

    // step 4: shared context
    let ctx = AppContext::new(store, &config).shared();

    // step 5: generator in background
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let generator_handle = config
        .simulation
        .enabled
        .then(|| generator::spawn(ctx.clone(), shutdown_rx));

    // step 6: web server in foreground
    let app = api::build_router(ctx);
    let listener = tokio::net::TcpListener::bind((config.server.bind.as_str(), config.server.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.server.bind, config.server.port))?;
    info!(
        addr = %listener.local_addr()?,
        environment = %config.server.environment,
        "server running"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = generator_handle {
        handle.await.ok();
    }
    info!("server stopped");
    Ok(())
}

// ==============================================================================
// watch
// ==============================================================================

async fn watch_api(config: HostConfig, api_url: Option<String>) -> Result<()> {
    let mut client_config = config.client;
    if let Some(url) = api_url {
        client_config.api_url = url;
    }
    info!(api_url = %client_config.api_url, "watching readings api");

    let ctx = DataContext::new(ApiClient::new(client_config.api_url.clone())).shared();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = tokio::spawn(client::run_polling(
        ctx.clone(),
        client_config.clone(),
        shutdown_rx,
    ));

    let mut ticker = tokio::time::interval(client_config.latest_interval());
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let ctx = ctx.lock().await;
                print_snapshot(&ctx);
            }
            _ = &mut shutdown => break,
        }
    }

    let _ = shutdown_tx.send(true);
    poller.await.ok();
    Ok(())
}

fn print_snapshot(ctx: &DataContext) {
    let state = ctx.state();
    if state.is_loading() {
        info!("loading device data...");
        return;
    }
    if let Some(reason) = state.error() {
        warn!(%reason, "api unavailable, showing local mock data");
    }
    let last_updated = ctx
        .last_updated()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    info!(devices = ctx.device_data().len(), %last_updated, "snapshot");
    for reading in ctx.device_data() {
        let trend: Vec<String> = ctx
            .device_history(&reading.device_id)
            .iter()
            .rev()
            .map(|s| format!("{:.1}", s.temperature))
            .collect();
        info!(
            device_id = %reading.device_id,
            temperature = reading.temperature,
            humidity = reading.humidity,
            trend = %trend.join(" → "),
            "reading"
        );
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
