use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::model::{RateLimitRule, MAX_BLOCK_DURATION_SECS};

/// Store calls must answer well inside the request latency budget.
pub const MAX_STORE_TIMEOUT_MS: u64 = 99;

/// Top-level ratewarden configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub protection: ProtectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: Vec<String>,
    /// Address admitted requests are forwarded to.
    pub upstream: String,
    #[serde(default)]
    pub upstream_tls: bool,
    /// Peers whose `X-Forwarded-For` is believed, as addresses or CIDRs.
    /// Empty means the socket peer is always the client.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    #[serde(default)]
    pub admin: AdminConfig,
}

impl ServerConfig {
    /// Parse `trusted_proxies`, accepting bare addresses as host routes.
    pub fn trusted_proxy_nets(&self) -> anyhow::Result<Vec<IpNet>> {
        self.trusted_proxies
            .iter()
            .map(|raw| {
                let raw = raw.trim();
                raw.parse::<IpNet>()
                    .or_else(|_| raw.parse::<IpAddr>().map(IpNet::from))
                    .map_err(|_| anyhow::anyhow!("invalid trusted proxy '{}'", raw))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

/// What the engine does when the counter store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request and log the outage.
    Open,
    /// Deny every request that some rule would have limited.
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_failure_policy")]
    pub failure_policy: FailurePolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_store_timeout_ms(),
            failure_policy: default_failure_policy(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default = "default_true")]
    pub include_defaults: bool,
    #[serde(default = "default_rule_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// Operator rules layered over the built-in defaults.
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            include_defaults: true,
            cache_ttl_secs: default_rule_cache_ttl(),
            rules: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: u64,
    #[serde(default = "default_violation_window")]
    pub violation_window_secs: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            violation_threshold: default_violation_threshold(),
            violation_window_secs: default_violation_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Retry-After attached to every heuristic denial.
    #[serde(default = "default_denial_secs")]
    pub denial_secs: u64,
    #[serde(default)]
    pub ip: IpProtectionConfig,
    #[serde(default)]
    pub user_agent: UserAgentConfig,
    #[serde(default)]
    pub request_pattern: RequestPatternConfig,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            denial_secs: default_denial_secs(),
            ip: IpProtectionConfig::default(),
            user_agent: UserAgentConfig::default(),
            request_pattern: RequestPatternConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpProtectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub blocklist: Option<PathBuf>,
    #[serde(default)]
    pub allowlist: Option<PathBuf>,
    /// Distinct first-seen IPs per minute before new traffic is refused.
    #[serde(default = "default_new_ip_threshold")]
    pub new_ip_threshold: u64,
    /// How long an IP counts as already seen.
    #[serde(default = "default_seen_ttl")]
    pub seen_ttl_secs: u64,
}

impl Default for IpProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            blocklist: None,
            allowlist: None,
            new_ip_threshold: default_new_ip_threshold(),
            seen_ttl_secs: default_seen_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAgentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Crawlers that may identify themselves as bots, matched as
    /// case-insensitive substrings of the User-Agent.
    #[serde(default = "default_crawler_allowlist")]
    pub allowlist: Vec<String>,
}

impl Default for UserAgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowlist: default_crawler_allowlist(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPatternConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Distinct endpoints one IP may touch per minute.
    #[serde(default = "default_fanout_threshold")]
    pub fanout_threshold: u64,
    #[serde(default = "default_auth_endpoints")]
    pub auth_endpoints: Vec<String>,
    /// Authentication attempts one IP may make per five minutes.
    #[serde(default = "default_auth_threshold")]
    pub auth_threshold: u64,
}

impl Default for RequestPatternConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fanout_threshold: default_fanout_threshold(),
            auth_endpoints: default_auth_endpoints(),
            auth_threshold: default_auth_threshold(),
        }
    }
}

// Default value helpers
fn default_admin_listen() -> String {
    "127.0.0.1:9090".to_string()
}
fn default_true() -> bool {
    true
}
fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}
fn default_key_prefix() -> String {
    "ratewarden:".to_string()
}
fn default_store_timeout_ms() -> u64 {
    50
}
fn default_failure_policy() -> FailurePolicy {
    FailurePolicy::Open
}
fn default_rule_cache_ttl() -> u64 {
    5
}
fn default_violation_threshold() -> u64 {
    10
}
fn default_violation_window() -> u64 {
    3_600
}
fn default_denial_secs() -> u64 {
    86_400
}
fn default_new_ip_threshold() -> u64 {
    1_000
}
fn default_seen_ttl() -> u64 {
    86_400
}
fn default_crawler_allowlist() -> Vec<String> {
    [
        "googlebot",
        "bingbot",
        "yandexbot",
        "duckduckbot",
        "baiduspider",
        "slurp",
        "facebookexternalhit",
        "twitterbot",
        "linkedinbot",
        "applebot",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_fanout_threshold() -> u64 {
    50
}
fn default_auth_endpoints() -> Vec<String> {
    vec!["/api/auth/*".to_string(), "*/login".to_string()]
}
fn default_auth_threshold() -> u64 {
    20
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)?;
        tracing::debug!(
            path,
            listeners = config.server.listen.len(),
            inline_rules = config.rules.rules.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.listen.is_empty() {
            anyhow::bail!("server.listen must have at least one address");
        }
        if self.server.upstream.trim().is_empty() {
            anyhow::bail!("server.upstream must not be empty");
        }

        self.server.trusted_proxy_nets()?;

        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            anyhow::bail!("store.backend is redis but store.redis_url is not set");
        }
        if self.store.timeout_ms == 0 || self.store.timeout_ms > MAX_STORE_TIMEOUT_MS {
            anyhow::bail!(
                "store.timeout_ms must be between 1 and {}",
                MAX_STORE_TIMEOUT_MS
            );
        }

        if self.escalation.violation_threshold == 0 {
            anyhow::bail!("escalation.violation_threshold must be positive");
        }

        let durations = [
            ("escalation.violation_window_secs", self.escalation.violation_window_secs),
            ("protection.denial_secs", self.protection.denial_secs),
            ("protection.ip.seen_ttl_secs", self.protection.ip.seen_ttl_secs),
            ("rules.cache_ttl_secs", self.rules.cache_ttl_secs),
        ];
        for (name, secs) in durations {
            if secs > MAX_BLOCK_DURATION_SECS {
                anyhow::bail!("{} must not exceed {} seconds", name, MAX_BLOCK_DURATION_SECS);
            }
        }

        for rule in &self.rules.rules {
            rule.validate()?;
        }

        for pattern in &self.protection.request_pattern.auth_endpoints {
            if let Err(e) = glob::Pattern::new(pattern) {
                anyhow::bail!("invalid auth endpoint pattern '{}': {}", pattern, e);
            }
        }

        Ok(())
    }
}
