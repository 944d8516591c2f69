use ratewarden_common::{RateLimitAlgorithm, RateLimitRule, Scope};

/// Rules every deployment starts with. Operators override any of them by
/// saving a rule with the same key.
pub fn builtin_rules() -> Vec<RateLimitRule> {
    vec![
        RateLimitRule {
            name: "Authentication".into(),
            description: "Login and token endpoints, tight limits against guessing".into(),
            per_minute: Some(5),
            per_hour: Some(20),
            algorithm: RateLimitAlgorithm::SlidingWindow,
            scope: Scope::Ip,
            endpoints: vec!["/api/auth/*".into()],
            block_duration: 900,
            priority: 10,
            ..RateLimitRule::new("auth")
        },
        RateLimitRule {
            name: "Search".into(),
            description: "Full-text search across bills, debates and votes".into(),
            per_minute: Some(30),
            algorithm: RateLimitAlgorithm::FixedWindow,
            scope: Scope::Ip,
            endpoints: vec!["/api/search*".into()],
            block_duration: 600,
            priority: 100,
            ..RateLimitRule::new("search")
        },
        RateLimitRule {
            name: "Writes".into(),
            description: "Create and update calls, smoothed to a steady rate".into(),
            per_second: Some(10),
            algorithm: RateLimitAlgorithm::LeakyBucket,
            scope: Scope::User,
            endpoints: vec!["/api/*/create".into(), "/api/*/update".into()],
            block_duration: 600,
            priority: 200,
            ..RateLimitRule::new("write")
        },
        RateLimitRule {
            name: "Global default".into(),
            description: "Catch-all per-IP limit".into(),
            per_second: Some(10),
            per_minute: Some(300),
            algorithm: RateLimitAlgorithm::TokenBucket,
            scope: Scope::Ip,
            exempt_roles: vec!["admin".into()],
            block_duration: 3_600,
            priority: 1_000,
            ..RateLimitRule::new("global")
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_valid_and_unique() {
        let rules = builtin_rules();
        for rule in &rules {
            rule.validate().unwrap();
        }

        let mut keys: Vec<_> = rules.iter().map(|r| r.key.as_str()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), rules.len());
    }
}
