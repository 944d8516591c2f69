//! Abuse heuristics that run ahead of rate limiting.
//!
//! Each check implements [`Heuristic`]. A [`HeuristicChain`] runs them in
//! order and stops at the first denial. A check may also vouch for a
//! request ([`Verdict::Trust`]), which ends the chain with a pass; the IP
//! check does this for allowlisted and internal addresses.

pub mod ip;
pub mod pattern;
pub mod user_agent;

use std::sync::Arc;

use async_trait::async_trait;
use ratewarden_common::{ProtectionConfig, RateLimitContext};
use ratewarden_ip_reputation::IpReputation;
use ratewarden_store::{AtomicCounter, StoreError};
use thiserror::Error;
use tracing::debug;

pub use ip::IpCheck;
pub use pattern::RequestPatternCheck;
pub use user_agent::UserAgentCheck;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// Pass and skip the remaining checks.
    Trust,
    Deny(String),
}

#[derive(Debug, Error)]
pub enum HeuristicError {
    /// The request itself is malformed, e.g. an unparseable client IP.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait Heuristic: Send + Sync {
    /// Short label used in logs and metrics.
    fn name(&self) -> &'static str;

    async fn check(&self, ctx: &RateLimitContext, now_ms: u64) -> Result<Verdict, HeuristicError>;
}

/// A request refused by one of the heuristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub heuristic: &'static str,
    pub reason: String,
}

/// Ordered list of heuristics.
#[derive(Clone, Default)]
pub struct HeuristicChain {
    checks: Vec<Arc<dyn Heuristic>>,
}

impl HeuristicChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, check: Arc<dyn Heuristic>) -> Self {
        self.checks.push(check);
        self
    }

    /// The chain for a protection config. Disabled checks are left out.
    pub fn from_config(
        config: &ProtectionConfig,
        store: Arc<dyn AtomicCounter>,
    ) -> anyhow::Result<Self> {
        let mut chain = Self::new();
        if !config.enabled {
            return Ok(chain);
        }

        if config.ip.enabled {
            let lists = IpReputation::from_files(
                config.ip.blocklist.as_deref(),
                config.ip.allowlist.as_deref(),
            )?;
            chain = chain.with(Arc::new(IpCheck::new(
                Arc::new(lists),
                store.clone(),
                config.ip.new_ip_threshold,
                config.ip.seen_ttl_secs,
            )));
        }
        if config.user_agent.enabled {
            chain = chain.with(Arc::new(UserAgentCheck::new(
                config.user_agent.allowlist.clone(),
            )));
        }
        if config.request_pattern.enabled {
            chain = chain.with(Arc::new(RequestPatternCheck::new(
                store,
                config.request_pattern.fanout_threshold,
                &config.request_pattern.auth_endpoints,
                config.request_pattern.auth_threshold,
            )?));
        }

        Ok(chain)
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run every check until one denies or vouches for the request.
    ///
    /// Malformed input is a denial. Store failures are returned so the
    /// caller can apply its failure policy.
    pub async fn evaluate(
        &self,
        ctx: &RateLimitContext,
        now_ms: u64,
    ) -> Result<Option<Denial>, StoreError> {
        for check in &self.checks {
            match check.check(ctx, now_ms).await {
                Ok(Verdict::Pass) => continue,
                Ok(Verdict::Trust) => {
                    debug!(heuristic = check.name(), client_ip = %ctx.ip, "request trusted");
                    return Ok(None);
                }
                Ok(Verdict::Deny(reason)) => {
                    return Ok(Some(Denial {
                        heuristic: check.name(),
                        reason,
                    }))
                }
                Err(HeuristicError::InvalidInput(reason)) => {
                    return Ok(Some(Denial {
                        heuristic: check.name(),
                        reason,
                    }))
                }
                Err(HeuristicError::Store(e)) => return Err(e),
            }
        }
        Ok(None)
    }
}
