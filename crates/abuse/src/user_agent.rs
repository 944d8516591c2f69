use async_trait::async_trait;
use ratewarden_common::RateLimitContext;

use crate::{Heuristic, HeuristicError, Verdict};

/// Signatures of HTTP libraries and automation tools.
const AUTOMATION_SIGNATURES: &[&str] = &[
    "curl",
    "wget",
    "python-requests",
    "python-urllib",
    "aiohttp",
    "scrapy",
    "httpclient",
    "go-http-client",
    "java/",
    "okhttp",
    "libwww-perl",
    "mechanize",
    "phantomjs",
    "headlesschrome",
    "selenium",
    "puppeteer",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Missing,
    DeclaredCrawler,
    Automation,
    Other,
}

/// Classify a User-Agent against the operator's crawler allow-list.
///
/// An agent carrying an automation signature is `Automation` even when it
/// also names an allowed crawler; only an allow-list entry equal to the
/// whole agent string carves a tool out. Other agents are declared
/// crawlers when they contain an allow-list entry.
pub fn classify(user_agent: Option<&str>, allowlist: &[String]) -> AgentKind {
    let ua = match user_agent.map(str::trim) {
        Some(ua) if !ua.is_empty() => ua.to_lowercase(),
        _ => return AgentKind::Missing,
    };

    if AUTOMATION_SIGNATURES.iter().any(|s| ua.contains(s)) {
        let exact = allowlist
            .iter()
            .any(|allowed| allowed.trim().to_lowercase() == ua);
        return if exact {
            AgentKind::DeclaredCrawler
        } else {
            AgentKind::Automation
        };
    }

    let declared = allowlist
        .iter()
        .map(|allowed| allowed.trim().to_lowercase())
        .any(|allowed| !allowed.is_empty() && ua.contains(&allowed));
    if declared {
        AgentKind::DeclaredCrawler
    } else {
        AgentKind::Other
    }
}

/// Refuses requests without a User-Agent or from automation tooling.
pub struct UserAgentCheck {
    allowlist: Vec<String>,
}

impl UserAgentCheck {
    pub fn new(allowlist: Vec<String>) -> Self {
        Self { allowlist }
    }
}

#[async_trait]
impl Heuristic for UserAgentCheck {
    fn name(&self) -> &'static str {
        "user_agent"
    }

    async fn check(&self, ctx: &RateLimitContext, _now_ms: u64) -> Result<Verdict, HeuristicError> {
        let verdict = match classify(ctx.user_agent.as_deref(), &self.allowlist) {
            AgentKind::Missing => Verdict::Deny("missing user agent".into()),
            AgentKind::Automation => Verdict::Deny("automated client".into()),
            AgentKind::DeclaredCrawler | AgentKind::Other => Verdict::Pass,
        };
        Ok(verdict)
    }
}
