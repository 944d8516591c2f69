use std::sync::Arc;

use async_trait::async_trait;
use ratewarden_common::RateLimitContext;
use ratewarden_store::{AtomicCounter, EXPIRY_SLACK_MS};

use crate::{Heuristic, HeuristicError, Verdict};

const FANOUT_WINDOW_MS: u64 = 60_000;
const AUTH_WINDOW_MS: u64 = 300_000;

/// Request-pattern signals per client IP.
///
/// - Fan-out: distinct endpoints touched within a minute. Scanners walk
///   many paths quickly; people do not.
/// - Credential stuffing: hits on authentication endpoints within five
///   minutes.
pub struct RequestPatternCheck {
    store: Arc<dyn AtomicCounter>,
    fanout_threshold: u64,
    auth_endpoints: Vec<glob::Pattern>,
    auth_threshold: u64,
}

impl RequestPatternCheck {
    pub fn new(
        store: Arc<dyn AtomicCounter>,
        fanout_threshold: u64,
        auth_endpoints: &[String],
        auth_threshold: u64,
    ) -> Result<Self, glob::PatternError> {
        let auth_endpoints = auth_endpoints
            .iter()
            .map(|p| glob::Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            store,
            fanout_threshold,
            auth_endpoints,
            auth_threshold,
        })
    }

    fn is_auth_endpoint(&self, endpoint: &str) -> bool {
        self.auth_endpoints.iter().any(|p| p.matches(endpoint))
    }
}

#[async_trait]
impl Heuristic for RequestPatternCheck {
    fn name(&self) -> &'static str {
        "request_pattern"
    }

    async fn check(&self, ctx: &RateLimitContext, now_ms: u64) -> Result<Verdict, HeuristicError> {
        let fanout_key = format!("fanout:{}:{}", ctx.ip, now_ms / FANOUT_WINDOW_MS);
        let distinct = self
            .store
            .add_member(
                &fanout_key,
                &ctx.endpoint,
                Some(FANOUT_WINDOW_MS + EXPIRY_SLACK_MS),
                now_ms,
            )
            .await?;
        if distinct > self.fanout_threshold {
            tracing::warn!(client_ip = %ctx.ip, distinct, "endpoint fan-out above threshold");
            return Ok(Verdict::Deny("too many distinct endpoints".into()));
        }

        if self.is_auth_endpoint(&ctx.endpoint) {
            let auth_key = format!("auth:{}:{}", ctx.ip, now_ms / AUTH_WINDOW_MS);
            let attempts = self
                .store
                .increment(&auth_key, Some(AUTH_WINDOW_MS + EXPIRY_SLACK_MS), now_ms)
                .await?;
            if attempts > self.auth_threshold {
                tracing::warn!(client_ip = %ctx.ip, attempts, "authentication attempts above threshold");
                return Ok(Verdict::Deny("too many authentication attempts".into()));
            }
        }

        Ok(Verdict::Pass)
    }
}
