pub mod blocked;
pub mod check;
pub mod health;
pub mod metrics;
pub mod rules;
pub mod stats;

use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

pub(crate) type ApiError = (StatusCode, Json<Value>);

pub(crate) fn error_response(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (
        status,
        Json(json!({
            "status": "error",
            "message": message.to_string()
        })),
    )
}
