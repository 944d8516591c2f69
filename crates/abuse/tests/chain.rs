use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use ratewarden_abuse::HeuristicChain;
use ratewarden_common::{ProtectionConfig, RateLimitContext};
use ratewarden_store::MemoryCounter;

const BROWSER: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";

struct TempList(PathBuf);

impl TempList {
    fn new(name: &str, contents: &str) -> Self {
        let path = std::env::temp_dir().join(format!("ratewarden_chain_{}_{}", name, std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        Self(path)
    }
}

impl Drop for TempList {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn chain(config: &ProtectionConfig) -> HeuristicChain {
    HeuristicChain::from_config(config, Arc::new(MemoryCounter::new())).unwrap()
}

#[tokio::test]
async fn blocklisted_ip_is_denied_before_user_agent() {
    let list = TempList::new("block", "203.0.113.0/24\n");
    let mut config = ProtectionConfig::default();
    config.ip.blocklist = Some(list.0.clone());
    let chain = chain(&config);

    let ctx = RateLimitContext::new("203.0.113.50", "/api/bills").with_user_agent(BROWSER);
    let denial = chain.evaluate(&ctx, 0).await.unwrap().unwrap();
    assert_eq!(denial.heuristic, "ip");
}

#[tokio::test]
async fn internal_traffic_skips_user_agent_check() {
    let chain = chain(&ProtectionConfig::default());

    // Health checks from inside the network often send no User-Agent.
    let health = RateLimitContext::new("10.0.3.7", "/healthz");
    assert!(chain.evaluate(&health, 0).await.unwrap().is_none());

    let outside = RateLimitContext::new("198.51.100.20", "/healthz");
    let denial = chain.evaluate(&outside, 0).await.unwrap().unwrap();
    assert_eq!(denial.heuristic, "user_agent");
}

#[tokio::test]
async fn browser_traffic_passes_every_check() {
    let chain = chain(&ProtectionConfig::default());
    let ctx = RateLimitContext::new("198.51.100.20", "/api/bills").with_user_agent(BROWSER);
    for t in 0..10 {
        assert!(chain.evaluate(&ctx, t * 1_000).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn missing_blocklist_file_fails_to_build() {
    let mut config = ProtectionConfig::default();
    config.ip.blocklist = Some(PathBuf::from("/nonexistent/ratewarden-blocklist"));
    assert!(HeuristicChain::from_config(&config, Arc::new(MemoryCounter::new())).is_err());
}
