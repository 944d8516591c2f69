use ratewarden_engine::Decision;
use std::time::Instant;

/// Per-request state carried through the pingora pipeline.
pub struct RequestContext {
    pub client_ip: String,
    pub method: String,
    pub uri: String,
    pub request_start: Instant,
    /// Engine decision, set in the request phase.
    pub decision: Option<Decision>,
    pub response_status: u16,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            client_ip: String::new(),
            method: String::new(),
            uri: String::new(),
            request_start: Instant::now(),
            decision: None,
            response_status: 0,
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
