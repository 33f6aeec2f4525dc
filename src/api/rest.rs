// =============================================================================
// Scheduler RPC — Axum 0.7
// =============================================================================
//
// The control surface a sibling process drives:
//   GET  /status                          — liveness + transport state
//   POST /control/start                   — resume the pipelines
//   POST /control/stop                    — pause the pipelines
//   POST /control/generate?kind=&limit=   — force one snapshot now
//   POST /control/cleanup?max_age_hours=  — run retention with an override
//   GET  /stats                           — counters from every subsystem
//   GET  /ws                              — notification stream
//
// CORS is permissive for development; tighten allowed origins in production.
// =============================================================================

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::types::MarketKind;

/// Build the RPC router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(status))
        .route("/control/start", post(control_start))
        .route("/control/stop", post(control_stop))
        .route("/control/generate", post(control_generate))
        .route("/control/cleanup", post(control_cleanup))
        .route("/strategy/evaluate", post(strategy_evaluate))
        .route("/stats", get(stats))
        .route("/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Status
// =============================================================================

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sync = state.supervisor.stats();
    let health = state.health.report();

    Json(json!({
        "status": if state.is_running() { "running" } else { "stopped" },
        "uptime_secs": state.uptime_secs(),
        "healthy": health.healthy,
        "sync": sync,
        "probes": health.probes,
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Control
// =============================================================================

async fn control_start(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.set_running(true);
    info!("pipelines resumed via RPC");
    Json(json!({ "status": "running" }))
}

async fn control_stop(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.set_running(false);
    info!("pipelines paused via RPC");
    Json(json!({ "status": "stopped" }))
}

#[derive(Deserialize)]
struct GenerateQuery {
    kind: Option<String>,
    limit: Option<usize>,
}

async fn control_generate(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GenerateQuery>,
) -> impl IntoResponse {
    let kind = match query.kind.as_deref() {
        Some(raw) => match MarketKind::from_str(raw) {
            Ok(kind) => kind,
            Err(e) => {
                return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
                    .into_response();
            }
        },
        None => MarketKind::Futures,
    };
    let limit = query.limit.unwrap_or(state.config.top_n_gainers);

    match state.force_snapshot(kind, limit).await {
        Ok(snapshot_id) => {
            info!(kind = %kind, snapshot_id, "snapshot forced via RPC");
            Json(json!({ "snapshot_id": snapshot_id, "kind": kind })).into_response()
        }
        Err(e) => {
            warn!(error = %e, "forced snapshot failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct CleanupQuery {
    max_age_hours: Option<u64>,
}

async fn control_cleanup(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CleanupQuery>,
) -> impl IntoResponse {
    let hours = query
        .max_age_hours
        .unwrap_or(state.config.save_controller.retention_hours);
    let cutoff = chrono::Utc::now().timestamp_millis() - (hours as i64) * 3_600_000;
    let max_keep = state.config.save_controller.max_snapshots;

    let mut deleted = 0usize;
    for kind in [MarketKind::Spot, MarketKind::Futures] {
        match state.store.prune_snapshots(kind, cutoff, max_keep) {
            Ok((by_age, by_count)) => deleted += by_age + by_count,
            Err(e) => {
                warn!(kind = %kind, error = %e, "cleanup failed");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": e.to_string() })),
                )
                    .into_response();
            }
        }
    }

    info!(deleted, max_age_hours = hours, "snapshot cleanup via RPC");
    Json(json!({ "deleted": deleted, "max_age_hours": hours })).into_response()
}

// =============================================================================
// Strategy evaluation
// =============================================================================

#[derive(Deserialize)]
struct EvaluateRequest {
    #[serde(flatten)]
    config: crate::strategy::StrategyConfig,
    #[serde(default)]
    open_position_qty: f64,
}

async fn strategy_evaluate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EvaluateRequest>,
) -> impl IntoResponse {
    match state
        .strategy_router
        .evaluate(&request.config, request.open_position_qty)
    {
        Ok((decision, order)) => Json(json!({
            "decision": decision,
            "order_id": order.map(|o| o.id),
        }))
        .into_response(),
        Err(e) => {
            warn!(error = %e, "strategy evaluation failed");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Audit rows included inline in the stats payload.
const RECENT_AUDIT_LIMIT: usize = 20;

async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let op_log_count = state.store.operation_log_count().unwrap_or(0);
    let audit_count = state.store.audit_trail_count().unwrap_or(0);
    let recent_audit = state
        .store
        .recent_audit_entries(RECENT_AUDIT_LIMIT)
        .unwrap_or_default();

    Json(json!({
        "save": state.save_controller.stats(),
        "sync": state.supervisor.stats(),
        "reconciler": state.reconciler.stats(),
        "positions": state.diff_engine.stats(),
        "precompute": state.precompute.stats(),
        "model_cache": state.model_cache.stats(),
        "feature_cache": state.feature_cache.stats(),
        "warmup": state.warmup_pool.stats(),
        "notifications": state.dispatcher.stats(),
        "operation_log_entries": op_log_count,
        "audit_trail_entries": audit_count,
        "recent_audit": recent_audit,
        "price_cache_entries": state.prices.len(),
        "depth_books": state.depth.tracked_count(),
    }))
}
