use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{WardenError, WardenResult};

/// The limiting algorithm a rule applies to each of its windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
    LeakyBucket,
}

impl fmt::Display for RateLimitAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RateLimitAlgorithm::TokenBucket => "token_bucket",
            RateLimitAlgorithm::SlidingWindow => "sliding_window",
            RateLimitAlgorithm::FixedWindow => "fixed_window",
            RateLimitAlgorithm::LeakyBucket => "leaky_bucket",
        };
        f.write_str(name)
    }
}

/// The dimension over which a rule's counters are tracked independently.
///
/// Serialized as a plain string: `global`, `ip`, `user`, `endpoint`,
/// `api_key`, or `attribute:<name>` for a value taken from the context's
/// attribute map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Ip,
    User,
    Endpoint,
    ApiKey,
    Attribute(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => f.write_str("global"),
            Scope::Ip => f.write_str("ip"),
            Scope::User => f.write_str("user"),
            Scope::Endpoint => f.write_str("endpoint"),
            Scope::ApiKey => f.write_str("api_key"),
            Scope::Attribute(name) => write!(f, "attribute:{}", name),
        }
    }
}

impl FromStr for Scope {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Scope::Global),
            "ip" => Ok(Scope::Ip),
            "user" => Ok(Scope::User),
            "endpoint" => Ok(Scope::Endpoint),
            "api_key" => Ok(Scope::ApiKey),
            other => match other.strip_prefix("attribute:") {
                Some(name) if !name.is_empty() => Ok(Scope::Attribute(name.to_string())),
                _ => Err(WardenError::UnknownScope(other.to_string())),
            },
        }
    }
}

impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One of the four windows a rule may set a limit for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeWindow {
    /// Finest to coarsest, the order windows are evaluated in.
    pub const ALL: [TimeWindow; 4] = [
        TimeWindow::Second,
        TimeWindow::Minute,
        TimeWindow::Hour,
        TimeWindow::Day,
    ];

    pub fn secs(self) -> u64 {
        match self {
            TimeWindow::Second => 1,
            TimeWindow::Minute => 60,
            TimeWindow::Hour => 3_600,
            TimeWindow::Day => 86_400,
        }
    }

    pub fn millis(self) -> u64 {
        self.secs() * 1000
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeWindow::Second => "second",
            TimeWindow::Minute => "minute",
            TimeWindow::Hour => "hour",
            TimeWindow::Day => "day",
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Largest per-window limit or burst size a rule may set.
pub const MAX_WINDOW_LIMIT: u64 = 1_000_000_000;
/// Longest block a rule may impose: one year.
pub const MAX_BLOCK_DURATION_SECS: u64 = 365 * 86_400;

/// A configured rate-limit rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub per_second: Option<u64>,
    #[serde(default)]
    pub per_minute: Option<u64>,
    #[serde(default)]
    pub per_hour: Option<u64>,
    #[serde(default)]
    pub per_day: Option<u64>,
    #[serde(default)]
    pub burst_size: Option<u64>,
    #[serde(default = "default_algorithm")]
    pub algorithm: RateLimitAlgorithm,
    #[serde(default = "default_scope")]
    pub scope: Scope,
    /// Glob patterns matched against the request path. Empty means every
    /// endpoint.
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Seconds an escalated offender stays blocked.
    #[serde(default = "default_block_duration")]
    pub block_duration: u64,
    #[serde(default = "default_response_code")]
    pub response_code: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub exempt_roles: Vec<String>,
    /// Single addresses or CIDR ranges.
    #[serde(default)]
    pub exempt_ips: Vec<String>,
    /// Lower values are evaluated first.
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Advisory rules match and are logged but never deny.
    #[serde(default)]
    pub advisory: bool,
}

impl RateLimitRule {
    /// A rule with the given key and every optional field at its default.
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            name: key.clone(),
            key,
            description: String::new(),
            per_second: None,
            per_minute: None,
            per_hour: None,
            per_day: None,
            burst_size: None,
            algorithm: default_algorithm(),
            scope: default_scope(),
            endpoints: Vec::new(),
            block_duration: default_block_duration(),
            response_code: default_response_code(),
            enabled: true,
            exempt_roles: Vec::new(),
            exempt_ips: Vec::new(),
            priority: default_priority(),
            advisory: false,
        }
    }

    pub fn limit_for(&self, window: TimeWindow) -> Option<u64> {
        match window {
            TimeWindow::Second => self.per_second,
            TimeWindow::Minute => self.per_minute,
            TimeWindow::Hour => self.per_hour,
            TimeWindow::Day => self.per_day,
        }
    }

    /// The configured windows with their limits, finest first.
    pub fn windows(&self) -> Vec<(TimeWindow, u64)> {
        TimeWindow::ALL
            .iter()
            .filter_map(|w| self.limit_for(*w).map(|limit| (*w, limit)))
            .collect()
    }

    /// Reject rules that could never be enforced as written.
    pub fn validate(&self) -> WardenResult<()> {
        let invalid = |message: String| WardenError::InvalidRule {
            key: self.key.clone(),
            message,
        };

        if self.key.trim().is_empty() {
            return Err(invalid("key must not be empty".into()));
        }
        if self.key.contains(':') {
            return Err(invalid("key must not contain ':'".into()));
        }

        for window in TimeWindow::ALL {
            match self.limit_for(window) {
                Some(0) => return Err(invalid(format!("per_{} must be positive", window))),
                Some(limit) if limit > MAX_WINDOW_LIMIT => {
                    return Err(invalid(format!(
                        "per_{} must not exceed {}",
                        window, MAX_WINDOW_LIMIT
                    )))
                }
                _ => {}
            }
        }
        if self.windows().is_empty() && !self.advisory {
            return Err(invalid(
                "at least one of per_second, per_minute, per_hour, per_day is required".into(),
            ));
        }

        match self.burst_size {
            Some(0) => return Err(invalid("burst_size must be positive".into())),
            Some(burst) if burst > MAX_WINDOW_LIMIT => {
                return Err(invalid(format!(
                    "burst_size must not exceed {}",
                    MAX_WINDOW_LIMIT
                )))
            }
            _ => {}
        }
        if self.block_duration > MAX_BLOCK_DURATION_SECS {
            return Err(invalid(format!(
                "block_duration must not exceed {} seconds",
                MAX_BLOCK_DURATION_SECS
            )));
        }
        if !(400..=599).contains(&self.response_code) {
            return Err(invalid(format!(
                "response_code {} is not an HTTP error status",
                self.response_code
            )));
        }

        for pattern in &self.endpoints {
            if let Err(e) = glob::Pattern::new(pattern) {
                return Err(invalid(format!("endpoint pattern '{}': {}", pattern, e)));
            }
        }
        for ip in &self.exempt_ips {
            let parses = ip.parse::<ipnet::IpNet>().is_ok()
                || ip.parse::<std::net::IpAddr>().is_ok();
            if !parses {
                return Err(invalid(format!("exempt ip '{}' is not an address or CIDR", ip)));
            }
        }

        Ok(())
    }

    /// The value this rule's scope selects from a request.
    pub fn scope_value(&self, ctx: &RateLimitContext) -> String {
        match &self.scope {
            Scope::Global => "global".to_string(),
            Scope::Ip => ctx.ip.clone(),
            Scope::User => ctx.user_id.clone().unwrap_or_else(|| ctx.ip.clone()),
            Scope::Endpoint => ctx.endpoint.clone(),
            Scope::ApiKey => ctx.api_key.clone().unwrap_or_else(|| ctx.ip.clone()),
            Scope::Attribute(name) => ctx
                .attributes
                .get(name)
                .cloned()
                .unwrap_or_else(|| ctx.ip.clone()),
        }
    }

    /// `{rule_key}:{scope_value}:{window}`
    pub fn counter_key(&self, ctx: &RateLimitContext, window: TimeWindow) -> String {
        format!("{}:{}:{}", self.key, self.scope_value(ctx), window)
    }
}

/// Everything the engine knows about one inbound request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitContext {
    pub ip: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl RateLimitContext {
    pub fn new(ip: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            endpoint: endpoint.into(),
            method: default_method(),
            ..Default::default()
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// The engine's verdict for a single request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitResponse {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Epoch seconds.
    pub reset_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RateLimitResponse {
    /// Admission with no quota attached (no rule matched).
    pub fn unbounded(now_secs: u64) -> Self {
        Self {
            allowed: true,
            limit: u64::MAX,
            remaining: u64::MAX,
            reset_at: now_secs,
            retry_after: None,
            reason: None,
        }
    }

    pub fn admitted(limit: u64, remaining: u64, reset_at: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_at,
            retry_after: None,
            reason: None,
        }
    }

    pub fn denied(
        limit: u64,
        reset_at: u64,
        retry_after: u64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at,
            retry_after: Some(retry_after),
            reason: Some(reason.into()),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

fn default_algorithm() -> RateLimitAlgorithm {
    RateLimitAlgorithm::SlidingWindow
}
fn default_scope() -> Scope {
    Scope::Ip
}
fn default_block_duration() -> u64 {
    3_600
}
fn default_response_code() -> u16 {
    429
}
fn default_true() -> bool {
    true
}
fn default_priority() -> i32 {
    1_000
}
fn default_method() -> String {
    "GET".to_string()
}
