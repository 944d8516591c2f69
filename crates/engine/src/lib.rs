//! The ratewarden decision engine.
//!
//! [`RateLimitService::check`] answers one question per request: admit or
//! deny, and with which quota. In order it consults
//!
//! 1. the client's block record, which while live overrides everything;
//! 2. the abuse heuristics;
//! 3. the highest-priority matching rule, evaluating each configured window
//!    finest first and stopping at the first exhausted one.
//!
//! A rule denial bumps a per-IP violation counter; at the escalation
//! threshold a block record is written for the rule's `block_duration`.
//! Counter-store failures never surface to the caller: they resolve through
//! the configured [`FailurePolicy`](ratewarden_common::FailurePolicy).

pub mod blocks;
pub mod decision;
pub mod metrics;
pub mod service;

pub use blocks::{BlockEntry, BlockRecord};
pub use decision::{Decision, DecisionKind};
pub use metrics::EngineMetrics;
pub use service::{EngineStats, RateLimitService};
