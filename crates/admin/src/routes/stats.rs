use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use super::{error_response, ApiError};
use crate::state::SharedState;

/// GET /stats
///
/// Totals across every instance sharing the counter store, plus this
/// instance's uptime.
pub async fn get_stats(State(state): State<SharedState>) -> Result<Json<Value>, ApiError> {
    let stats = state
        .engine
        .stats()
        .await
        .map_err(|e| error_response(StatusCode::SERVICE_UNAVAILABLE, e))?;

    let requests_per_second = if stats.uptime_secs > 0 {
        stats.total_requests as f64 / stats.uptime_secs as f64
    } else {
        0.0
    };

    Ok(Json(json!({
        "total_requests": stats.total_requests,
        "blocked_requests": stats.blocked_requests,
        "unique_ips": stats.unique_ips,
        "active_rules": stats.active_rules,
        "uptime_secs": stats.uptime_secs,
        "requests_per_second": requests_per_second
    })))
}
