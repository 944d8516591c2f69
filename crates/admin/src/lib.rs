pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use ratewarden_engine::RateLimitService;
use tower_http::cors::{Any, CorsLayer};

use crate::state::SharedState;

pub use state::AppState;

/// Build the Axum router for the management API.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::metrics::get_metrics))
        .route("/check", post(routes::check::check_request))
        .route(
            "/rules",
            get(routes::rules::list_rules).post(routes::rules::save_rule),
        )
        .route("/rules/{key}", delete(routes::rules::delete_rule))
        .route("/blocked", get(routes::blocked::list_blocked))
        .route("/blocked/{ip}", delete(routes::blocked::unblock))
        .route("/stats", get(routes::stats::get_stats))
        .with_state(state)
        .layer(cors)
}

/// Serve the management API until the process exits.
pub async fn run_admin_server(state: SharedState, listen_addr: &str) -> anyhow::Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!("admin API server listening on {}", listen_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

pub fn new_shared_state(engine: Arc<RateLimitService>) -> SharedState {
    Arc::new(AppState::new(engine))
}
