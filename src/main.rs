// =============================================================================
// autotrade-core — Main Entry Point
// =============================================================================
//
// The engine starts whatever `RuntimeConfig`'s persisted `runtime_mode` says
// (simulator by default) and serves the control-plane API for switching to
// paper or live mode at runtime (§6). Neither scheduler dials out until its
// first tick.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broker;
mod config;
mod decision_scheduler;
mod domain;
mod error;
mod exchange;
mod feedback;
mod indicators;
mod llm;
mod market_cache;
mod market_data_scheduler;
mod metrics;
mod pipeline;
mod reconcile;
mod repository;
mod runtime_config;
mod runtime_controller;
mod tools;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::Services;
use crate::config::Settings;
use crate::runtime_config::RuntimeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("autotrade-core starting up");

    let settings = Settings::from_env()?;

    let runtime_config_path =
        std::env::var("AUTOTRADE_RUNTIME_CONFIG_PATH").unwrap_or_else(|_| "runtime_config.json".to_string());

    let mut runtime_config = RuntimeConfig::load(&runtime_config_path).unwrap_or_else(|e| {
        warn!(error = %e, path = %runtime_config_path, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });

    if !settings.market_data_symbols.is_empty() {
        runtime_config.symbols = settings.market_data_symbols.clone();
    }
    runtime_config.runtime_mode = settings.trading_broker;
    runtime_config.decision_interval_minutes = settings.decision_interval_minutes;

    info!(
        symbols = ?runtime_config.symbols,
        runtime_mode = %runtime_config.runtime_mode,
        "configured trading pairs"
    );

    let services = Arc::new(Services::build(settings, runtime_config, runtime_config_path.clone()).await?);

    services.spawn_schedulers();

    let bind_addr = std::env::var("AUTOTRADE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());
    let app = api::router(services.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server exited");
        }
    });

    info!("all subsystems running — press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    // The active runtime mode is already persisted on every switch via
    // `RuntimeController::set`; there is nothing else in `RuntimeConfig` that
    // changes at runtime, so shutdown needs no extra save.
    info!("autotrade-core shut down complete");
    Ok(())
}
