// =============================================================================
// Health and telemetry HTTP surface — Axum 0.7
// =============================================================================
//
// All endpoints are public: this surface is read by orchestrator probes and
// the external control panel. `/` aliases `/health` for probe compatibility.
//
// Status-code contract: 200 while at least one of the two links (store,
// trade stream) is serving, 503 only when both are down.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::TrackerConfig;
use crate::core::TrackerCore;

/// Build the HTTP router with CORS middleware and shared state.
pub fn router(core: Arc<TrackerCore>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/reload-config", post(reload_config))
        .layer(cors)
        .with_state(core)
}

async fn health(State(core): State<Arc<TrackerCore>>) -> impl IntoResponse {
    let snapshot = core.health_snapshot();
    let code = if core.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(snapshot))
}

async fn metrics(State(core): State<Arc<TrackerCore>>) -> impl IntoResponse {
    core.refresh_runtime_gauges();
    match core.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "metrics rendering failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn reload_config(State(core): State<Arc<TrackerCore>>) -> impl IntoResponse {
    match TrackerConfig::reload() {
        Ok(config) => {
            let snapshot = config.snapshot();
            *core.config.write() = config;
            info!("configuration reloaded via API");
            (StatusCode::OK, Json(snapshot)).into_response()
        }
        Err(e) => {
            warn!(error = %e, "config reload failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
