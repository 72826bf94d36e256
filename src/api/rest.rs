// =============================================================================
// REST control plane — Axum 0.7, mounted under /internal/autotrade/v1 (§6)
// =============================================================================
//
// `/health` is public; everything else needs a valid Bearer token via
// `AuthBearer`. `/healthz`, `/readyz`, and `/metrics` are also left open —
// they're monitoring-probe surfaces (kubelet, Prometheus) that never carry a
// bearer token. Scheduler cron triggers use a separate `x-cron-token` header
// instead (§6 point 6).
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::auth::{cron_token_valid, AuthBearer};
use crate::app_state::Services;
use crate::broker::{BrokerPort, Decision};
use crate::domain::{normalize_symbol, Portfolio};
use crate::error::AppError;
use crate::exchange::ExchangeClient;
use crate::indicators::build_snapshot;
use crate::market_cache::{cache_key, CacheKind};
use crate::pipeline::DecisionPipelineResult;
use crate::types::RuntimeMode;

const OHLCV_LIMIT: u32 = 200;
const VOLUME_RATIO_PERIOD: usize = 20;
/// Smaller than `VOLUME_RATIO_PERIOD`, per §4.1's "higher-timeframe snapshot
/// is the same function with a different timeframe and a smaller
/// `volume_ratio_period`".
const HIGHER_TIMEFRAME_VOLUME_RATIO_PERIOD: usize = 10;
const SERIES_POINTS: usize = crate::tools::indicator_tool::TOOL_SERIES_POINTS;

pub fn router(services: Arc<Services>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let api = Router::new()
        .route("/health", get(health))
        .route("/portfolio", get(portfolio))
        .route("/portfolio/sync", post(portfolio_sync))
        .route("/decisions", get(list_decisions))
        .route("/decisions/:id", get(get_decision))
        .route("/market/indicators/:symbol", get(market_indicators))
        .route("/scheduler/status", get(scheduler_status))
        .route("/scheduler/pause", post(scheduler_pause))
        .route("/scheduler/resume", post(scheduler_resume))
        .route("/scheduler/trigger", post(scheduler_trigger))
        .route("/scheduler/cron-trigger", post(scheduler_cron_trigger))
        .route("/runtime-mode", get(get_runtime_mode))
        .route("/runtime-mode", patch(set_runtime_mode))
        .route("/metrics/latency/okx-order", get(order_latency))
        .route("/metrics", get(prometheus_metrics))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz));

    Router::new()
        .nest("/internal/autotrade/v1", api)
        .route("/ws/market-data", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(services)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    service: &'static str,
    status: &'static str,
    time: DateTime<Utc>,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { service: "autotrade-core", status: "ok", time: Utc::now() })
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn readyz(State(services): State<Arc<Services>>) -> impl IntoResponse {
    let scheduler_status = services.decision_scheduler.status();
    let reconcile_status = services.reconcile.snapshot();
    let degraded = scheduler_status.consecutive_failures >= 3 || !reconcile_status.last_ok;
    let body = serde_json::json!({
        "status": if degraded { "degraded" } else { "ok" },
        "scheduler": scheduler_status,
        "market_data_api_failures": services.market_data_scheduler.api_failures(),
        "reconcile": {
            "last_run_at": reconcile_status.last_run_at,
            "last_ok": reconcile_status.last_ok,
            "balance_drift": reconcile_status.balance_drift,
        },
    });
    let status = if degraded { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK };
    (status, Json(body))
}

// ---------------------------------------------------------------------------
// Portfolio
// ---------------------------------------------------------------------------

async fn portfolio(_auth: AuthBearer, State(services): State<Arc<Services>>) -> Result<Json<Portfolio>, AppError> {
    load_portfolio(&services).await
}

async fn portfolio_sync(_auth: AuthBearer, State(services): State<Arc<Services>>) -> Result<Json<Portfolio>, AppError> {
    let current = load_portfolio(&services).await?;

    let mut snapshots = std::collections::HashMap::new();
    for symbol in current.0.positions.keys() {
        if let Some(value) = services.market_cache.get_json(&cache_key(symbol, CacheKind::Ticker, None)) {
            if let Some(price) = value.get("price").and_then(|v| v.as_f64()) {
                snapshots.insert(symbol.clone(), price);
            }
        }
    }

    services
        .broker_handle
        .mark_to_market(&snapshots)
        .await
        .map_err(|e| AppError::transient(e.to_string()))?;

    load_portfolio(&services).await
}

async fn load_portfolio(services: &Arc<Services>) -> Result<Json<Portfolio>, AppError> {
    let snapshot = services
        .broker_handle
        .get_portfolio_snapshot()
        .await
        .map_err(|e| AppError::transient(e.to_string()))?;
    snapshot.map(Json).ok_or_else(|| AppError::transient("no portfolio snapshot available in this runtime mode"))
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct DecisionRecord {
    run_id: Uuid,
    generated_at: DateTime<Utc>,
    prompt: String,
    response: Vec<Decision>,
}

impl From<&DecisionPipelineResult> for DecisionRecord {
    fn from(r: &DecisionPipelineResult) -> Self {
        Self { run_id: r.run_id, generated_at: r.generated_at, prompt: r.prompt.clone(), response: r.response.clone() }
    }
}

#[derive(Deserialize)]
struct DecisionsQuery {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default = "default_decisions_limit")]
    limit: usize,
}

fn default_decisions_limit() -> usize {
    50
}

async fn list_decisions(
    _auth: AuthBearer,
    State(services): State<Arc<Services>>,
    Query(query): Query<DecisionsQuery>,
) -> impl IntoResponse {
    let symbol = query.symbol.as_deref();
    let records: Vec<DecisionRecord> =
        services.decision_scheduler.recent_decisions(symbol, query.limit).iter().map(|r| DecisionRecord::from(r.as_ref())).collect();
    Json(records)
}

async fn get_decision(
    _auth: AuthBearer,
    State(services): State<Arc<Services>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DecisionRecord>, StatusCode> {
    services
        .decision_scheduler
        .decision_by_id(id)
        .map(|r| Json(DecisionRecord::from(r.as_ref())))
        .ok_or(StatusCode::NOT_FOUND)
}

// ---------------------------------------------------------------------------
// Market indicators
// ---------------------------------------------------------------------------

async fn market_indicators(
    _auth: AuthBearer,
    State(services): State<Arc<Services>>,
    Path(symbol): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let symbol = normalize_symbol(&symbol);

    if let Some(cached) = services.market_cache.get_json(&cache_key(&symbol, CacheKind::Indicators, None)) {
        return Ok(Json(serde_json::json!({ "source": "redis", "indicators": cached })));
    }

    let (short, long) = tokio::join!(
        services.exchange.get_ohlcv(&symbol, "15m", OHLCV_LIMIT),
        services.exchange.get_ohlcv(&symbol, "1h", OHLCV_LIMIT),
    );
    let short_candles = short.map_err(|e| AppError::transient(e.to_string()))?;
    let mut snapshot = build_snapshot(&short_candles, VOLUME_RATIO_PERIOD, SERIES_POINTS)
        .ok_or_else(|| AppError::business(format!("not enough {symbol} candles to compute indicators")))?;
    if let Ok(long_candles) = long {
        snapshot.higher_timeframe =
            build_snapshot(&long_candles, HIGHER_TIMEFRAME_VOLUME_RATIO_PERIOD, SERIES_POINTS).map(Box::new);
    }

    Ok(Json(serde_json::json!({ "source": "live", "indicators": snapshot })))
}

// ---------------------------------------------------------------------------
// Scheduler control
// ---------------------------------------------------------------------------

async fn scheduler_status(_auth: AuthBearer, State(services): State<Arc<Services>>) -> impl IntoResponse {
    Json(services.decision_scheduler.status())
}

async fn scheduler_pause(_auth: AuthBearer, State(services): State<Arc<Services>>) -> impl IntoResponse {
    services.decision_scheduler.pause();
    info!("decision scheduler paused via API");
    Json(services.decision_scheduler.status())
}

async fn scheduler_resume(_auth: AuthBearer, State(services): State<Arc<Services>>) -> impl IntoResponse {
    services.decision_scheduler.resume();
    info!("decision scheduler resumed via API");
    Json(services.decision_scheduler.status())
}

async fn scheduler_trigger(_auth: AuthBearer, State(services): State<Arc<Services>>) -> impl IntoResponse {
    services.decision_scheduler.trigger().await;
    Json(serde_json::json!({ "triggered_at": Utc::now() }))
}

async fn scheduler_cron_trigger(State(services): State<Arc<Services>>, headers: HeaderMap) -> impl IntoResponse {
    let presented = headers.get("x-cron-token").and_then(|v| v.to_str().ok()).unwrap_or("");
    if presented.is_empty() || !cron_token_valid(&services, presented) {
        warn!("cron trigger rejected: missing or invalid x-cron-token");
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "invalid or missing x-cron-token" }))).into_response();
    }
    services.decision_scheduler.trigger().await;
    (StatusCode::OK, Json(serde_json::json!({ "triggered_at": Utc::now() }))).into_response()
}

// ---------------------------------------------------------------------------
// Runtime mode
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct RuntimeModeResponse {
    mode: String,
}

async fn get_runtime_mode(_auth: AuthBearer, State(services): State<Arc<Services>>) -> impl IntoResponse {
    Json(RuntimeModeResponse { mode: services.runtime_controller.current().to_string() })
}

#[derive(Deserialize)]
struct RuntimeModeRequest {
    mode: String,
}

async fn set_runtime_mode(
    _auth: AuthBearer,
    State(services): State<Arc<Services>>,
    Json(req): Json<RuntimeModeRequest>,
) -> impl IntoResponse {
    let Some(mode) = RuntimeMode::parse(&req.mode) else {
        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": format!("invalid runtime mode '{}'", req.mode) }))).into_response();
    };
    if !services.runtime_controller.is_connected() {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({ "error": "repository not connected" }))).into_response();
    }
    match services.runtime_controller.set(mode).await {
        Ok(()) => (StatusCode::OK, Json(RuntimeModeResponse { mode: mode.to_string() })).into_response(),
        Err(e) => AppError::transient(e.to_string()).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

async fn order_latency(_auth: AuthBearer, State(services): State<Arc<Services>>) -> impl IntoResponse {
    match services.exchange_broker.latency.stats() {
        Some(stats) => Json(serde_json::json!({ "stats": stats })).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn prometheus_metrics(State(services): State<Arc<Services>>) -> impl IntoResponse {
    let portfolio = services.broker_handle.get_portfolio_snapshot().await.ok().flatten();
    let body = crate::metrics::render(&services.exchange_broker, &services.decision_scheduler, portfolio.as_ref());
    ([("content-type", "text/plain; version=0.0.4")], body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_decisions_limit_is_fifty() {
        assert_eq!(default_decisions_limit(), 50);
    }

    #[test]
    fn decision_record_carries_run_id_and_response() {
        let result = DecisionPipelineResult {
            prompt: "p".into(),
            response: vec![],
            generated_at: Utc::now(),
            run_id: Uuid::new_v4(),
            tool_cache_snapshot: vec![],
            agent_trace: vec![],
        };
        let record = DecisionRecord::from(&result);
        assert_eq!(record.run_id, result.run_id);
        assert!(record.response.is_empty());
    }
}
