use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::Json;
use ratewarden_common::RateLimitContext;
use serde_json::{json, Value};

use crate::state::SharedState;

/// POST /check
///
/// Evaluates a request context exactly as the gateway would, counting it
/// against its limits. The decision is always returned with 200; the
/// status the gateway would have used is in the body. Quota headers match
/// the ones the gateway sends.
pub async fn check_request(
    State(state): State<SharedState>,
    Json(ctx): Json<RateLimitContext>,
) -> (StatusCode, HeaderMap, Json<Value>) {
    let decision = state.engine.check(&ctx).await;

    let mut headers = HeaderMap::new();
    for (name, value) in decision.quota_headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }

    let mut body = serde_json::to_value(&decision.response).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut body {
        map.insert("rule".into(), json!(decision.rule));
        map.insert("status".into(), json!(decision.status));
        map.insert("decision".into(), json!(decision.kind.as_str()));
    }

    (StatusCode::OK, headers, Json(body))
}
