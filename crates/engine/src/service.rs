use std::sync::Arc;
use std::time::Instant;

use ratewarden_abuse::{Denial, HeuristicChain};
use ratewarden_common::{
    AppConfig, Clock, EscalationConfig, FailurePolicy, RateLimitContext, RateLimitResponse,
    RateLimitRule,
};
use ratewarden_rate_limit::{AlgorithmOutcome, RateLimiter, WindowLimit};
use ratewarden_rules::{RuleManager, SharedRuleStore};
use ratewarden_store::{AtomicCounter, StoreError, EXPIRY_SLACK_MS};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::blocks::{block_key, violation_key, BlockEntry, BlockRecord, BLOCK_PREFIX};
use crate::decision::{Decision, DecisionKind};
use crate::metrics::EngineMetrics;

const FAIL_CLOSED_RETRY_SECS: u64 = 1;
/// Status for heuristic denials and blocks without a recorded rule.
const DEFAULT_DENIAL_STATUS: u16 = 429;

const STATS_TOTAL: &str = "stats:total";
const STATS_DENIED: &str = "stats:denied";
const STATS_UNIQUE_IPS: &str = "stats:unique_ips";
const DAY_MS: u64 = 86_400_000;

/// Distinct client IPs are counted per UTC day so the set never outlives
/// the day it describes.
fn unique_ips_key(now_ms: u64) -> String {
    format!("{}:{}", STATS_UNIQUE_IPS, now_ms / DAY_MS)
}

fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

/// Aggregate counters. Request totals come from the shared store and so
/// cover every instance; uptime is this instance's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub total_requests: u64,
    pub blocked_requests: u64,
    /// Distinct client IPs seen since the start of the current UTC day.
    pub unique_ips: u64,
    pub active_rules: usize,
    pub uptime_secs: u64,
}

pub struct RateLimitService {
    store: Arc<dyn AtomicCounter>,
    limiter: RateLimiter,
    rules: Arc<RuleManager>,
    heuristics: HeuristicChain,
    escalation: EscalationConfig,
    failure_policy: FailurePolicy,
    denial_secs: u64,
    metrics: EngineMetrics,
    clock: Arc<dyn Clock>,
    started_at_ms: u64,
}

impl RateLimitService {
    pub fn new(
        store: Arc<dyn AtomicCounter>,
        rules: Arc<RuleManager>,
        heuristics: HeuristicChain,
        config: &AppConfig,
        clock: Arc<dyn Clock>,
    ) -> prometheus::Result<Self> {
        Ok(Self {
            limiter: RateLimiter::new(store.clone()),
            store,
            rules,
            heuristics,
            escalation: config.escalation.clone(),
            failure_policy: config.store.failure_policy,
            denial_secs: config.protection.denial_secs,
            metrics: EngineMetrics::new()?,
            started_at_ms: clock.now_ms(),
            clock,
        })
    }

    /// Wire the engine to a counter store: rules persist in that store and
    /// the heuristics count there too.
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn AtomicCounter>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let rule_store = Arc::new(SharedRuleStore::new(store.clone(), clock.clone()));
        let rules = Arc::new(RuleManager::new(
            rule_store,
            config.rules.include_defaults,
            config.rules.rules.clone(),
            config.rules.cache_ttl_secs,
            clock.clone(),
        ));
        let heuristics = HeuristicChain::from_config(&config.protection, store.clone())?;
        info!(
            heuristics = heuristics.len(),
            failure_policy = ?config.store.failure_policy,
            "rate limit engine ready"
        );
        Ok(Self::new(store, rules, heuristics, config, clock)?)
    }

    pub fn rules(&self) -> &Arc<RuleManager> {
        &self.rules
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn uptime_secs(&self) -> u64 {
        self.clock.now_ms().saturating_sub(self.started_at_ms) / 1000
    }

    /// Decide one request. Never fails; store outages resolve through the
    /// failure policy.
    pub async fn check(&self, ctx: &RateLimitContext) -> Decision {
        let started = Instant::now();
        let now_ms = self.clock.now_ms();
        self.metrics.decisions_total.inc();

        let decision = match self.decide(ctx, now_ms).await {
            Ok(decision) => {
                self.record_stats(ctx, &decision, now_ms).await;
                decision
            }
            Err(e) => self.on_store_failure(ctx, now_ms, e).await,
        };

        if !decision.allowed() {
            self.metrics
                .denials_total
                .with_label_values(&[decision.kind.as_str()])
                .inc();
        }
        self.metrics
            .decision_duration
            .observe(started.elapsed().as_secs_f64());

        decision
    }

    async fn decide(&self, ctx: &RateLimitContext, now_ms: u64) -> Result<Decision, StoreError> {
        if let Some(blocked) = self.active_block(ctx, now_ms).await? {
            return Ok(blocked);
        }

        if let Some(denial) = self.heuristics.evaluate(ctx, now_ms).await? {
            return Ok(self.heuristic_denial(ctx, denial, now_ms));
        }

        let Some(matched) = self.rules.match_rule(ctx).await else {
            return Ok(Decision::admitted(
                RateLimitResponse::unbounded(now_ms / 1000),
                None,
            ));
        };
        self.metrics
            .rule_hits
            .with_label_values(&[matched.rule.key.as_str()])
            .inc();

        self.apply_rule(ctx, &matched.rule, now_ms).await
    }

    async fn active_block(
        &self,
        ctx: &RateLimitContext,
        now_ms: u64,
    ) -> Result<Option<Decision>, StoreError> {
        let key = block_key(&ctx.ip);
        let Some(raw) = self.store.get(&key, now_ms).await? else {
            return Ok(None);
        };
        let remaining_ms = self.store.ttl_ms(&key, now_ms).await?.unwrap_or(0);
        let retry_after = ceil_secs(remaining_ms).max(1);

        let (rule, status) = match serde_json::from_str::<BlockRecord>(&raw) {
            Ok(record) => (Some(record.rule), record.response_code),
            Err(e) => {
                warn!(client_ip = %ctx.ip, error = %e, "unreadable block record, honouring it anyway");
                (None, DEFAULT_DENIAL_STATUS)
            }
        };

        debug!(client_ip = %ctx.ip, retry_after, "request from blocked ip");
        let response = RateLimitResponse::denied(
            0,
            now_ms / 1000 + retry_after,
            retry_after,
            "ip address is temporarily blocked",
        );
        Ok(Some(Decision::denied(
            DecisionKind::Blocked,
            response,
            status,
            rule,
        )))
    }

    fn heuristic_denial(&self, ctx: &RateLimitContext, denial: Denial, now_ms: u64) -> Decision {
        self.metrics
            .heuristic_denials
            .with_label_values(&[denial.heuristic])
            .inc();
        info!(
            client_ip = %ctx.ip,
            endpoint = %ctx.endpoint,
            heuristic = denial.heuristic,
            reason = %denial.reason,
            "request refused by abuse heuristic"
        );

        let response = RateLimitResponse::denied(
            0,
            (now_ms / 1000).saturating_add(self.denial_secs),
            self.denial_secs,
            denial.reason,
        );
        Decision::denied(
            DecisionKind::Suspicious,
            response,
            DEFAULT_DENIAL_STATUS,
            None,
        )
    }

    /// Evaluate each window finest first, stopping at the first denial.
    async fn apply_rule(
        &self,
        ctx: &RateLimitContext,
        rule: &RateLimitRule,
        now_ms: u64,
    ) -> Result<Decision, StoreError> {
        let mut last: Option<AlgorithmOutcome> = None;
        for (window, limit) in rule.windows() {
            let outcome = self
                .limiter
                .check(
                    rule.algorithm,
                    &rule.counter_key(ctx, window),
                    WindowLimit::new(limit, window).with_burst(rule.burst_size),
                    now_ms,
                )
                .await?;
            last = Some(outcome);
            if !outcome.allowed {
                break;
            }
        }

        let rule_key = Some(rule.key.clone());
        let Some(outcome) = last else {
            return Ok(Decision::admitted(
                RateLimitResponse::unbounded(now_ms / 1000),
                rule_key,
            ));
        };
        let reset_at = ceil_secs(now_ms + outcome.reset_after_ms);

        if outcome.allowed {
            return Ok(Decision::admitted(
                RateLimitResponse::admitted(outcome.limit, outcome.remaining, reset_at),
                rule_key,
            ));
        }

        if rule.advisory {
            info!(rule = %rule.key, client_ip = %ctx.ip, "advisory rule limit exceeded");
            return Ok(Decision::admitted(
                RateLimitResponse::admitted(outcome.limit, 0, reset_at)
                    .with_reason("advisory limit exceeded"),
                rule_key,
            ));
        }

        if let Some(blocked) = self.escalate(ctx, rule, outcome.limit, now_ms).await? {
            return Ok(blocked);
        }

        let retry_after = ceil_secs(outcome.retry_after_ms.unwrap_or(outcome.reset_after_ms)).max(1);
        debug!(rule = %rule.key, client_ip = %ctx.ip, retry_after, "rate limit exceeded");
        Ok(Decision::denied(
            DecisionKind::Limited,
            RateLimitResponse::denied(outcome.limit, reset_at, retry_after, "rate limit exceeded"),
            rule.response_code,
            rule_key,
        ))
    }

    /// Count a violation against the client IP and block it once the count
    /// reaches the threshold. The counter is shared by all rules.
    async fn escalate(
        &self,
        ctx: &RateLimitContext,
        rule: &RateLimitRule,
        limit: u64,
        now_ms: u64,
    ) -> Result<Option<Decision>, StoreError> {
        let violations = self
            .store
            .increment(
                &violation_key(&ctx.ip),
                Some(self.escalation.violation_window_secs.saturating_mul(1000)),
                now_ms,
            )
            .await?;
        // A zero block duration opts the rule out of escalation.
        if violations < self.escalation.violation_threshold || rule.block_duration == 0 {
            return Ok(None);
        }

        let key = block_key(&ctx.ip);
        let record = BlockRecord {
            ip: ctx.ip.clone(),
            rule: rule.key.clone(),
            reason: format!(
                "{} violations within {}s",
                violations, self.escalation.violation_window_secs
            ),
            blocked_at: now_ms / 1000,
            duration: rule.block_duration,
            response_code: rule.response_code,
        };
        let raw = serde_json::to_string(&record).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            message: e.to_string(),
        })?;
        self.store
            .set(&key, &raw, Some(rule.block_duration.saturating_mul(1000)), now_ms)
            .await?;

        self.metrics.blocks_issued.inc();
        warn!(
            client_ip = %ctx.ip,
            rule = %rule.key,
            violations,
            duration_secs = rule.block_duration,
            "client blocked after repeated violations"
        );

        let response = RateLimitResponse::denied(
            limit,
            (now_ms / 1000).saturating_add(rule.block_duration),
            rule.block_duration,
            "ip address is temporarily blocked",
        );
        Ok(Some(Decision::denied(
            DecisionKind::Blocked,
            response,
            rule.response_code,
            Some(rule.key.clone()),
        )))
    }

    async fn on_store_failure(
        &self,
        ctx: &RateLimitContext,
        now_ms: u64,
        err: StoreError,
    ) -> Decision {
        self.metrics.store_failures.inc();
        let now_secs = now_ms / 1000;
        let admit = || {
            Decision::admitted(
                RateLimitResponse::unbounded(now_secs).with_reason("counter store unavailable"),
                None,
            )
        };

        if self.failure_policy == FailurePolicy::Open {
            error!(client_ip = %ctx.ip, error = %err, "counter store unavailable, failing open");
            return admit();
        }

        match self.rules.match_rule(ctx).await {
            Some(matched) if !matched.rule.advisory => {
                error!(
                    client_ip = %ctx.ip,
                    rule = %matched.rule.key,
                    error = %err,
                    "counter store unavailable, failing closed"
                );
                let response = RateLimitResponse::denied(
                    0,
                    now_secs + FAIL_CLOSED_RETRY_SECS,
                    FAIL_CLOSED_RETRY_SECS,
                    "rate limiting temporarily unavailable",
                );
                Decision::denied(
                    DecisionKind::Unavailable,
                    response,
                    503,
                    Some(matched.rule.key.clone()),
                )
            }
            _ => {
                error!(client_ip = %ctx.ip, error = %err, "counter store unavailable, no limiting rule applies");
                admit()
            }
        }
    }

    /// Best effort; a failure here never affects the decision.
    async fn record_stats(&self, ctx: &RateLimitContext, decision: &Decision, now_ms: u64) {
        let result = async {
            self.store.increment(STATS_TOTAL, None, now_ms).await?;
            if !decision.allowed() {
                self.store.increment(STATS_DENIED, None, now_ms).await?;
            }
            self.store
                .add_member(
                    &unique_ips_key(now_ms),
                    &ctx.ip,
                    Some(DAY_MS + EXPIRY_SLACK_MS),
                    now_ms,
                )
                .await?;
            Ok::<_, StoreError>(())
        }
        .await;

        if let Err(e) = result {
            debug!(error = %e, "failed to record request stats");
        }
    }

    pub async fn stats(&self) -> Result<EngineStats, StoreError> {
        let now_ms = self.clock.now_ms();
        let counter = |raw: Option<String>| raw.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);

        Ok(EngineStats {
            total_requests: counter(self.store.get(STATS_TOTAL, now_ms).await?),
            blocked_requests: counter(self.store.get(STATS_DENIED, now_ms).await?),
            unique_ips: self
                .store
                .cardinality(&unique_ips_key(now_ms), now_ms)
                .await?,
            active_rules: self.rules.active_rule_count().await,
            uptime_secs: self.uptime_secs(),
        })
    }

    /// Every live block, ordered by IP.
    pub async fn blocked_ips(&self) -> Result<Vec<BlockEntry>, StoreError> {
        let now_ms = self.clock.now_ms();
        let mut entries = Vec::new();

        for key in self.store.keys_with_prefix(BLOCK_PREFIX, now_ms).await? {
            // Expired between listing and reading.
            let Some(raw) = self.store.get(&key, now_ms).await? else {
                continue;
            };
            let record = match serde_json::from_str::<BlockRecord>(&raw) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping unreadable block record");
                    continue;
                }
            };
            let remaining_secs = ceil_secs(self.store.ttl_ms(&key, now_ms).await?.unwrap_or(0));
            entries.push(BlockEntry {
                record,
                remaining_secs,
            });
        }

        entries.sort_by(|a, b| a.record.ip.cmp(&b.record.ip));
        Ok(entries)
    }

    /// Lift a block and forget the IP's violations. Unblocking an IP that
    /// is not blocked succeeds; the return value says whether one existed.
    pub async fn unblock(&self, ip: &str) -> Result<bool, StoreError> {
        let was_blocked = self.store.remove(&block_key(ip)).await?;
        self.store.remove(&violation_key(ip)).await?;
        if was_blocked {
            info!(client_ip = %ip, "ip unblocked");
        }
        Ok(was_blocked)
    }

    /// Round-trip to the counter store.
    pub async fn ping_store(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }
}
