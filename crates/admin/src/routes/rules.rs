use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use ratewarden_common::RateLimitRule;
use ratewarden_rules::RuleError;
use serde_json::{json, Value};

use super::{error_response, ApiError};
use crate::state::SharedState;

fn rule_error(e: RuleError) -> ApiError {
    let status = match &e {
        RuleError::Invalid(_) | RuleError::Serde(_) => StatusCode::BAD_REQUEST,
        RuleError::NotFound(_) => StatusCode::NOT_FOUND,
        RuleError::BuiltIn(_) => StatusCode::CONFLICT,
        RuleError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(status, e)
}

/// GET /rules
///
/// The effective rule set in evaluation order.
pub async fn list_rules(State(state): State<SharedState>) -> Json<Value> {
    let rules = state.engine.rules().rules().await;
    Json(json!({
        "count": rules.len(),
        "rules": rules
    }))
}

/// POST /rules
///
/// Creates the rule or replaces the one with the same key.
pub async fn save_rule(
    State(state): State<SharedState>,
    Json(rule): Json<RateLimitRule>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let key = rule.key.clone();
    state
        .engine
        .rules()
        .save_rule(rule)
        .await
        .map_err(rule_error)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "saved",
            "key": key
        })),
    ))
}

/// DELETE /rules/{key}
pub async fn delete_rule(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .engine
        .rules()
        .delete_rule(&key)
        .await
        .map_err(rule_error)?;

    Ok(Json(json!({
        "status": "deleted",
        "key": key
    })))
}
