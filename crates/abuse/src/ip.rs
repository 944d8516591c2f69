use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ratewarden_common::RateLimitContext;
use ratewarden_ip_reputation::{IpReputation, Standing};
use ratewarden_store::{AtomicCounter, EXPIRY_SLACK_MS};

use crate::{Heuristic, HeuristicError, Verdict};

const MINUTE_MS: u64 = 60_000;
const TOO_MANY_NEW: &str = "too many new clients";

/// IP reputation and novelty.
///
/// Blocklisted addresses are denied; allowlisted and internal addresses are
/// trusted. Every other address is recorded as seen, and the number of
/// first-time addresses per minute is counted globally. Once that count
/// passes the threshold, new addresses are refused for the rest of the
/// minute, which is the signature of a distributed flood.
///
/// A refused address is not recorded as seen. It carries a refusal marker
/// until the minute ends and is counted again as new in the next one.
pub struct IpCheck {
    lists: Arc<IpReputation>,
    store: Arc<dyn AtomicCounter>,
    new_ip_threshold: u64,
    seen_ttl_ms: u64,
}

impl IpCheck {
    pub fn new(
        lists: Arc<IpReputation>,
        store: Arc<dyn AtomicCounter>,
        new_ip_threshold: u64,
        seen_ttl_secs: u64,
    ) -> Self {
        Self {
            lists,
            store,
            new_ip_threshold,
            seen_ttl_ms: seen_ttl_secs.saturating_mul(1000),
        }
    }
}

#[async_trait]
impl Heuristic for IpCheck {
    fn name(&self) -> &'static str {
        "ip"
    }

    async fn check(&self, ctx: &RateLimitContext, now_ms: u64) -> Result<Verdict, HeuristicError> {
        let addr: IpAddr = ctx
            .ip
            .parse()
            .map_err(|_| HeuristicError::InvalidInput(format!("invalid client ip '{}'", ctx.ip)))?;

        match self.lists.standing(addr) {
            Standing::Blocklisted => return Ok(Verdict::Deny("ip address is blocklisted".into())),
            Standing::Allowlisted | Standing::Internal => return Ok(Verdict::Trust),
            Standing::Unknown => {}
        }

        let minute = now_ms / MINUTE_MS;
        let refused_key = format!("refused_new:{}:{}", minute, addr);
        if self.store.get(&refused_key, now_ms).await?.is_some() {
            return Ok(Verdict::Deny(TOO_MANY_NEW.into()));
        }

        let seen_key = format!("seen:{}", addr);
        let first_seen = self
            .store
            .insert_if_absent(&seen_key, "1", Some(self.seen_ttl_ms), now_ms)
            .await?;
        if !first_seen {
            return Ok(Verdict::Pass);
        }

        let new_ips = self
            .store
            .increment(
                &format!("new_ips:{}", minute),
                Some(MINUTE_MS + EXPIRY_SLACK_MS),
                now_ms,
            )
            .await?;
        if new_ips > self.new_ip_threshold {
            let minute_left = (minute + 1) * MINUTE_MS - now_ms;
            self.store.remove(&seen_key).await?;
            self.store
                .set(&refused_key, "1", Some(minute_left + EXPIRY_SLACK_MS), now_ms)
                .await?;
            tracing::warn!(client_ip = %addr, new_ips, "new ip rate above threshold");
            return Ok(Verdict::Deny(TOO_MANY_NEW.into()));
        }

        Ok(Verdict::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratewarden_store::MemoryCounter;

    fn check(threshold: u64) -> IpCheck {
        IpCheck::new(
            Arc::new(IpReputation::new()),
            Arc::new(MemoryCounter::new()),
            threshold,
            86_400,
        )
    }

    #[tokio::test]
    async fn internal_addresses_are_trusted() {
        let c = check(0);
        let ctx = RateLimitContext::new("127.0.0.1", "/");
        assert_eq!(c.check(&ctx, 0).await.unwrap(), Verdict::Trust);
        let ctx = RateLimitContext::new("192.168.1.20", "/");
        assert_eq!(c.check(&ctx, 0).await.unwrap(), Verdict::Trust);
    }

    #[tokio::test]
    async fn invalid_ip_is_invalid_input() {
        let c = check(10);
        let ctx = RateLimitContext::new("999.1.1.1", "/");
        assert!(matches!(
            c.check(&ctx, 0).await,
            Err(HeuristicError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn new_ip_flood_is_refused() {
        let c = check(3);
        let now = 120_000;
        for i in 1..=3 {
            let ctx = RateLimitContext::new(format!("198.51.100.{}", i), "/");
            assert_eq!(c.check(&ctx, now).await.unwrap(), Verdict::Pass);
        }
        let ctx = RateLimitContext::new("198.51.100.4", "/");
        assert!(matches!(c.check(&ctx, now).await.unwrap(), Verdict::Deny(_)));

        // Known addresses are unaffected.
        let ctx = RateLimitContext::new("198.51.100.1", "/");
        assert_eq!(c.check(&ctx, now).await.unwrap(), Verdict::Pass);

        // A new minute starts a fresh count.
        let ctx = RateLimitContext::new("198.51.100.5", "/");
        assert_eq!(c.check(&ctx, now + MINUTE_MS).await.unwrap(), Verdict::Pass);
    }

    #[tokio::test]
    async fn refused_new_ip_stays_refused_for_the_minute() {
        let c = check(1);
        let now = 120_000;
        let first = RateLimitContext::new("198.51.100.1", "/");
        assert_eq!(c.check(&first, now).await.unwrap(), Verdict::Pass);

        let late = RateLimitContext::new("198.51.100.2", "/");
        assert!(matches!(c.check(&late, now).await.unwrap(), Verdict::Deny(_)));
        // Retrying does not turn the address into a known one.
        assert!(matches!(c.check(&late, now + 1).await.unwrap(), Verdict::Deny(_)));
        assert!(matches!(
            c.check(&late, now + MINUTE_MS - 1).await.unwrap(),
            Verdict::Deny(_)
        ));

        // Next minute it is new again and fits under the fresh count.
        assert_eq!(c.check(&late, now + MINUTE_MS).await.unwrap(), Verdict::Pass);
        assert_eq!(c.check(&late, now + MINUTE_MS + 1).await.unwrap(), Verdict::Pass);
    }
}
