//! Rule management for ratewarden.
//!
//! The effective rule set is three layers merged by key, later layers
//! winning: the built-in defaults, rules from the config file, and rules
//! saved at runtime through a [`RuleStore`]. The merged list is sorted by
//! priority and cached for a short TTL; readers share one immutable
//! snapshot through an [`ArcSwapOption`] so a reload never disturbs a
//! request that is mid-match.

pub mod defaults;
pub mod store;

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use ipnet::IpNet;
use ratewarden_common::{Clock, RateLimitContext, RateLimitRule};
use ratewarden_store::StoreError;
use thiserror::Error;
use tracing::{debug, warn};

pub use defaults::builtin_rules;
pub use store::{MemoryRuleStore, RuleStore, SharedRuleStore};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid rule: {0}")]
    Invalid(String),

    #[error("rule not found: {0}")]
    NotFound(String),

    #[error("rule '{0}' is built in; save it with enabled: false to disable it")]
    BuiltIn(String),

    #[error("rule store error: {0}")]
    Store(#[from] StoreError),

    #[error("rule serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A rule with its endpoint globs and exempt networks parsed once.
#[derive(Debug)]
pub struct CompiledRule {
    pub rule: RateLimitRule,
    patterns: Vec<glob::Pattern>,
    exempt_nets: Vec<IpNet>,
}

impl CompiledRule {
    pub fn compile(rule: RateLimitRule) -> Result<Self, RuleError> {
        rule.validate()
            .map_err(|e| RuleError::Invalid(e.to_string()))?;

        let patterns = rule
            .endpoints
            .iter()
            .map(|p| glob::Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RuleError::Invalid(e.to_string()))?;

        let mut exempt_nets = Vec::with_capacity(rule.exempt_ips.len());
        for raw in &rule.exempt_ips {
            let net = match raw.parse::<IpNet>() {
                Ok(net) => net,
                Err(_) => raw
                    .parse::<IpAddr>()
                    .map(IpNet::from)
                    .map_err(|e| RuleError::Invalid(format!("exempt ip '{}': {}", raw, e)))?,
            };
            exempt_nets.push(net);
        }

        Ok(Self {
            rule,
            patterns,
            exempt_nets,
        })
    }

    /// True if the request's role or address is exempt from this rule.
    pub fn is_exempt(&self, ctx: &RateLimitContext) -> bool {
        if let Some(role) = &ctx.role {
            if self.rule.exempt_roles.iter().any(|r| r == role) {
                return true;
            }
        }
        match ctx.ip.parse::<IpAddr>() {
            Ok(addr) => self.exempt_nets.iter().any(|net| net.contains(&addr)),
            Err(_) => false,
        }
    }

    /// A rule without endpoint patterns covers every endpoint.
    pub fn covers(&self, endpoint: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches(endpoint))
    }

    pub fn matches(&self, ctx: &RateLimitContext) -> bool {
        self.rule.enabled && !self.is_exempt(ctx) && self.covers(&ctx.endpoint)
    }
}

/// One loaded, priority-ordered rule set.
struct Snapshot {
    rules: Vec<Arc<CompiledRule>>,
    loaded_at_ms: u64,
}

/// Loads, caches, matches and mutates rules.
pub struct RuleManager {
    store: Arc<dyn RuleStore>,
    /// Built-in defaults overlaid with config-file rules.
    base: Vec<RateLimitRule>,
    builtin_keys: Vec<String>,
    cache: ArcSwapOption<Snapshot>,
    cache_ttl_ms: u64,
    clock: Arc<dyn Clock>,
}

impl RuleManager {
    pub fn new(
        store: Arc<dyn RuleStore>,
        include_defaults: bool,
        config_rules: Vec<RateLimitRule>,
        cache_ttl_secs: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut base = if include_defaults {
            builtin_rules()
        } else {
            Vec::new()
        };
        let builtin_keys = base.iter().map(|r| r.key.clone()).collect();
        for rule in config_rules {
            overlay(&mut base, rule);
        }

        Self {
            store,
            base,
            builtin_keys,
            cache: ArcSwapOption::empty(),
            cache_ttl_ms: cache_ttl_secs.saturating_mul(1000),
            clock,
        }
    }

    /// Merge base and stored rules, skipping stored rules that fail to
    /// decode or validate, and sort ascending by priority.
    pub async fn load_rules(&self) -> Result<Vec<RateLimitRule>, RuleError> {
        let mut rules = self.base.clone();

        for doc in self.store.load().await? {
            let key = doc
                .get("key")
                .and_then(|k| k.as_str())
                .unwrap_or("<missing>")
                .to_string();

            let rule: RateLimitRule = match serde_json::from_value(doc) {
                Ok(rule) => rule,
                Err(e) => {
                    warn!(rule = %key, error = %e, "skipping undecodable stored rule");
                    continue;
                }
            };
            if let Err(e) = rule.validate() {
                warn!(rule = %key, error = %e, "skipping invalid stored rule");
                continue;
            }
            overlay(&mut rules, rule);
        }

        // Stable, so equal priorities keep their layer order.
        rules.sort_by_key(|r| r.priority);
        Ok(rules)
    }

    /// The cached rule set, reloaded once the TTL has passed.
    ///
    /// A failed reload keeps serving the previous snapshot; with no
    /// snapshot yet, the base rules are used alone.
    async fn snapshot(&self) -> Arc<Snapshot> {
        let now = self.clock.now_ms();
        let current = self.cache.load_full();
        if let Some(snapshot) = &current {
            if now.saturating_sub(snapshot.loaded_at_ms) < self.cache_ttl_ms {
                return snapshot.clone();
            }
        }

        let rules = match self.load_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(error = %e, "failed to reload rules");
                if let Some(snapshot) = current {
                    return snapshot;
                }
                let mut rules = self.base.clone();
                rules.sort_by_key(|r| r.priority);
                rules
            }
        };

        let compiled = rules
            .into_iter()
            .filter_map(|rule| {
                let key = rule.key.clone();
                match CompiledRule::compile(rule) {
                    Ok(c) => Some(Arc::new(c)),
                    Err(e) => {
                        warn!(rule = %key, error = %e, "skipping rule that failed to compile");
                        None
                    }
                }
            })
            .collect::<Vec<_>>();

        debug!(count = compiled.len(), "rule set loaded");
        let snapshot = Arc::new(Snapshot {
            rules: compiled,
            loaded_at_ms: now,
        });
        self.cache.store(Some(snapshot.clone()));
        snapshot
    }

    /// The first enabled, non-exempt rule, in priority order, whose
    /// endpoint patterns cover the request.
    pub async fn match_rule(&self, ctx: &RateLimitContext) -> Option<Arc<CompiledRule>> {
        let snapshot = self.snapshot().await;
        snapshot.rules.iter().find(|r| r.matches(ctx)).cloned()
    }

    /// The effective rule set, as matched.
    pub async fn rules(&self) -> Vec<RateLimitRule> {
        self.snapshot()
            .await
            .rules
            .iter()
            .map(|r| r.rule.clone())
            .collect()
    }

    pub async fn active_rule_count(&self) -> usize {
        self.snapshot()
            .await
            .rules
            .iter()
            .filter(|r| r.rule.enabled)
            .count()
    }

    /// Validate and persist a rule, replacing any rule with the same key.
    pub async fn save_rule(&self, rule: RateLimitRule) -> Result<(), RuleError> {
        rule.validate()
            .map_err(|e| RuleError::Invalid(e.to_string()))?;
        self.store.save(&rule).await?;
        self.invalidate();
        tracing::info!(rule = %rule.key, priority = rule.priority, "rule saved");
        Ok(())
    }

    /// Remove a stored rule. Rules that exist only as built-in defaults
    /// cannot be deleted.
    pub async fn delete_rule(&self, key: &str) -> Result<(), RuleError> {
        if self.store.delete(key).await? {
            self.invalidate();
            tracing::info!(rule = %key, "rule deleted");
            return Ok(());
        }
        if self.builtin_keys.iter().any(|k| k == key) {
            return Err(RuleError::BuiltIn(key.to_string()));
        }
        Err(RuleError::NotFound(key.to_string()))
    }

    /// Drop the cached snapshot so the next match reloads.
    pub fn invalidate(&self) {
        self.cache.store(None);
    }
}

fn overlay(rules: &mut Vec<RateLimitRule>, rule: RateLimitRule) {
    match rules.iter_mut().find(|r| r.key == rule.key) {
        Some(existing) => *existing = rule,
        None => rules.push(rule),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratewarden_common::ManualClock;
    use std::time::Duration;

    fn rule(key: &str, priority: i32, endpoints: &[&str]) -> RateLimitRule {
        RateLimitRule {
            per_minute: Some(5),
            priority,
            endpoints: endpoints.iter().map(|s| s.to_string()).collect(),
            ..RateLimitRule::new(key)
        }
    }

    fn manager_with(store: Arc<dyn RuleStore>, config: Vec<RateLimitRule>) -> RuleManager {
        RuleManager::new(store, true, config, 5, Arc::new(ManualClock::new(0)))
    }

    #[tokio::test]
    async fn defaults_are_sorted_by_priority() {
        let manager = manager_with(Arc::new(MemoryRuleStore::new()), vec![]);
        let keys: Vec<_> = manager
            .load_rules()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, ["auth", "search", "write", "global"]);
    }

    #[tokio::test]
    async fn priority_picks_auth_over_global() {
        let manager = manager_with(Arc::new(MemoryRuleStore::new()), vec![]);
        let ctx = RateLimitContext::new("203.0.113.5", "/api/auth/login");
        let matched = manager.match_rule(&ctx).await.unwrap();
        assert_eq!(matched.rule.key, "auth");

        let ctx = RateLimitContext::new("203.0.113.5", "/api/bills/42");
        assert_eq!(manager.match_rule(&ctx).await.unwrap().rule.key, "global");
    }

    #[tokio::test]
    async fn exempt_role_falls_through() {
        let mut reports = rule("reports", 50, &["/api/reports/*"]);
        reports.exempt_roles = vec!["analyst".into()];
        let manager = manager_with(Arc::new(MemoryRuleStore::new()), vec![reports]);

        let ctx = RateLimitContext::new("203.0.113.5", "/api/reports/weekly");
        assert_eq!(manager.match_rule(&ctx).await.unwrap().rule.key, "reports");

        let analyst = ctx.with_role("analyst");
        assert_eq!(manager.match_rule(&analyst).await.unwrap().rule.key, "global");

        // Admins are exempt from the global default too.
        let admin = RateLimitContext::new("203.0.113.5", "/api/bills").with_role("admin");
        assert!(manager.match_rule(&admin).await.is_none());
    }

    #[tokio::test]
    async fn exempt_cidr() {
        let mut internal = rule("internal", 5, &[]);
        internal.exempt_ips = vec!["10.0.0.0/8".into(), "192.0.2.7".into()];
        let manager = RuleManager::new(
            Arc::new(MemoryRuleStore::new()),
            false,
            vec![internal],
            5,
            Arc::new(ManualClock::new(0)),
        );

        assert!(manager
            .match_rule(&RateLimitContext::new("10.20.30.40", "/"))
            .await
            .is_none());
        assert!(manager
            .match_rule(&RateLimitContext::new("192.0.2.7", "/"))
            .await
            .is_none());
        assert!(manager
            .match_rule(&RateLimitContext::new("192.0.2.8", "/"))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn disabled_override_hides_builtin() {
        let store = Arc::new(MemoryRuleStore::new());
        let manager = manager_with(store, vec![]);
        let mut auth = builtin_rules().remove(0);
        auth.enabled = false;
        manager.save_rule(auth).await.unwrap();

        let ctx = RateLimitContext::new("203.0.113.5", "/api/auth/login");
        assert_eq!(manager.match_rule(&ctx).await.unwrap().rule.key, "global");
        assert_eq!(manager.active_rule_count().await, 3);
    }

    #[tokio::test]
    async fn bad_stored_rules_are_skipped() {
        let store = Arc::new(MemoryRuleStore::with_documents(vec![
            serde_json::json!({"key": "odd", "per_minute": 5, "scope": "galaxy", "priority": 1}),
            serde_json::json!({"key": "nolimit", "priority": 1}),
            serde_json::json!({"key": "reports", "per_minute": 5, "priority": 1}),
        ]));
        let manager = manager_with(store, vec![]);

        let keys: Vec<_> = manager.rules().await.into_iter().map(|r| r.key).collect();
        assert_eq!(keys[0], "reports");
        assert!(!keys.iter().any(|k| k == "odd" || k == "nolimit"));
    }

    #[tokio::test]
    async fn invalid_rule_is_rejected_at_write() {
        let manager = manager_with(Arc::new(MemoryRuleStore::new()), vec![]);
        let err = manager
            .save_rule(RateLimitRule::new("empty"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuleError::Invalid(_)));
    }

    #[tokio::test]
    async fn delete_distinguishes_builtin_and_missing() {
        let manager = manager_with(Arc::new(MemoryRuleStore::new()), vec![]);
        assert!(matches!(
            manager.delete_rule("auth").await,
            Err(RuleError::BuiltIn(_))
        ));
        assert!(matches!(
            manager.delete_rule("nope").await,
            Err(RuleError::NotFound(_))
        ));

        manager
            .save_rule(rule("reports", 50, &["/api/reports/*"]))
            .await
            .unwrap();
        manager.delete_rule("reports").await.unwrap();
    }

    #[tokio::test]
    async fn cache_expires_after_ttl() {
        let store = Arc::new(MemoryRuleStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let manager = RuleManager::new(store.clone(), false, vec![], 5, clock.clone());
        assert!(manager.rules().await.is_empty());

        // Written behind the manager's back, as another instance would.
        store.save(&rule("reports", 50, &[])).await.unwrap();
        assert!(manager.rules().await.is_empty());

        clock.advance(Duration::from_secs(5));
        assert_eq!(manager.rules().await.len(), 1);
    }
}
