use ratewarden_common::RateLimitResponse;
use serde_json::{json, Value};

/// Why a request was let through or turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionKind {
    Admitted,
    /// A rule's window was exhausted.
    Limited,
    /// The client IP has a live block record.
    Blocked,
    /// An abuse heuristic refused the request.
    Suspicious,
    /// The counter store is down and the policy is fail-closed.
    Unavailable,
}

impl DecisionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionKind::Admitted => "admitted",
            DecisionKind::Limited => "rate_limit_exceeded",
            DecisionKind::Blocked => "blocked",
            DecisionKind::Suspicious => "suspicious_request",
            DecisionKind::Unavailable => "service_unavailable",
        }
    }
}

/// The engine's answer for one request, with what the gateway needs to
/// render it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub kind: DecisionKind,
    pub response: RateLimitResponse,
    /// HTTP status for a denial; 200 when admitted.
    pub status: u16,
    /// Key of the rule that produced the decision, if any.
    pub rule: Option<String>,
}

impl Decision {
    pub fn admitted(response: RateLimitResponse, rule: Option<String>) -> Self {
        Self {
            kind: DecisionKind::Admitted,
            response,
            status: 200,
            rule,
        }
    }

    pub fn denied(
        kind: DecisionKind,
        response: RateLimitResponse,
        status: u16,
        rule: Option<String>,
    ) -> Self {
        Self {
            kind,
            response,
            status,
            rule,
        }
    }

    pub fn allowed(&self) -> bool {
        self.response.allowed
    }

    /// `X-RateLimit-*` headers, plus `Retry-After` on denials.
    pub fn quota_headers(&self) -> Vec<(&'static str, String)> {
        let r = &self.response;
        let mut headers = vec![
            ("X-RateLimit-Limit", r.limit.to_string()),
            ("X-RateLimit-Remaining", r.remaining.to_string()),
            ("X-RateLimit-Reset", r.reset_at.to_string()),
        ];
        if let Some(retry) = r.retry_after {
            headers.push(("Retry-After", retry.to_string()));
        }
        headers
    }

    /// JSON body for a denial.
    pub fn denial_body(&self) -> Value {
        json!({
            "error": self.kind.as_str(),
            "message": self.response.reason.as_deref().unwrap_or("request denied"),
            "retry_after": self.response.retry_after.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denial_rendering() {
        let d = Decision::denied(
            DecisionKind::Limited,
            RateLimitResponse::denied(5, 1_700_000_060, 12, "rate limit exceeded"),
            429,
            Some("auth".into()),
        );
        let headers = d.quota_headers();
        assert!(headers.contains(&("X-RateLimit-Limit", "5".into())));
        assert!(headers.contains(&("X-RateLimit-Remaining", "0".into())));
        assert!(headers.contains(&("Retry-After", "12".into())));

        let body = d.denial_body();
        assert_eq!(body["error"], "rate_limit_exceeded");
        assert_eq!(body["message"], "rate limit exceeded");
        assert_eq!(body["retry_after"], 12);
    }

    #[test]
    fn admission_has_no_retry_after() {
        let d = Decision::admitted(RateLimitResponse::admitted(10, 9, 1_700_000_001), None);
        assert!(d.allowed());
        assert!(d.quota_headers().iter().all(|(name, _)| *name != "Retry-After"));
    }
}
