//! Shared types for the ratewarden rate-limiting engine.
//!
//! Every other crate in the workspace speaks in terms of the records defined
//! here: the [`RateLimitRule`] an operator configures, the
//! [`RateLimitContext`] describing one inbound request, and the
//! [`RateLimitResponse`] the engine hands back.

pub mod clock;
pub mod config;
pub mod error;
pub mod model;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AdminConfig, AppConfig, EscalationConfig, FailurePolicy, IpProtectionConfig,
    ProtectionConfig, RequestPatternConfig, RulesConfig, ServerConfig, StoreBackend, StoreConfig,
    UserAgentConfig,
};
pub use error::{WardenError, WardenResult};
pub use model::{
    RateLimitAlgorithm, RateLimitContext, RateLimitResponse, RateLimitRule, Scope, TimeWindow,
};
