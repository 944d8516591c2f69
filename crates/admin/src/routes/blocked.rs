use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use super::{error_response, ApiError};
use crate::state::SharedState;

fn rfc3339(epoch_secs: u64) -> Option<String> {
    Utc.timestamp_opt(epoch_secs as i64, 0)
        .single()
        .map(|t| t.to_rfc3339())
}

/// GET /blocked
///
/// Currently blocked IPs with the seconds left on each block.
pub async fn list_blocked(State(state): State<SharedState>) -> Result<Json<Value>, ApiError> {
    let entries = state
        .engine
        .blocked_ips()
        .await
        .map_err(|e| error_response(StatusCode::SERVICE_UNAVAILABLE, e))?;

    let blocked: Vec<Value> = entries
        .iter()
        .map(|entry| {
            json!({
                "ip": entry.record.ip,
                "rule": entry.record.rule,
                "reason": entry.record.reason,
                "blocked_at": rfc3339(entry.record.blocked_at),
                "duration": entry.record.duration,
                "ttl": entry.remaining_secs
            })
        })
        .collect();

    Ok(Json(json!({
        "count": blocked.len(),
        "blocked": blocked
    })))
}

/// DELETE /blocked/{ip}
///
/// Lifts the block and clears the violation count. Succeeds whether or not
/// the IP was blocked.
pub async fn unblock(
    State(state): State<SharedState>,
    Path(ip): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let was_blocked = state
        .engine
        .unblock(&ip)
        .await
        .map_err(|e| error_response(StatusCode::SERVICE_UNAVAILABLE, e))?;

    Ok(Json(json!({
        "status": "unblocked",
        "ip": ip,
        "was_blocked": was_blocked
    })))
}
