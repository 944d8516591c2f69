use std::sync::Arc;

use ratewarden_engine::RateLimitService;

/// Shared state type alias used across all route handlers.
pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub engine: Arc<RateLimitService>,
}

impl AppState {
    pub fn new(engine: Arc<RateLimitService>) -> Self {
        Self { engine }
    }
}
