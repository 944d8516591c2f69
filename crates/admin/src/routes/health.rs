use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::state::SharedState;

/// GET /health
///
/// Healthy only while the counter store answers.
pub async fn health_check(State(state): State<SharedState>) -> (StatusCode, Json<Value>) {
    let uptime = state.engine.uptime_secs();

    match state.engine.ping_store().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "store": "ok",
                "uptime_secs": uptime,
                "version": env!("CARGO_PKG_VERSION")
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "degraded",
                "store": e.to_string(),
                "uptime_secs": uptime,
                "version": env!("CARGO_PKG_VERSION")
            })),
        ),
    }
}
