use serde::{Deserialize, Serialize};

pub(crate) const BLOCK_PREFIX: &str = "block:";
pub(crate) const VIOLATION_PREFIX: &str = "violations:";

pub(crate) fn block_key(ip: &str) -> String {
    format!("{}{}", BLOCK_PREFIX, ip)
}

pub(crate) fn violation_key(ip: &str) -> String {
    format!("{}{}", VIOLATION_PREFIX, ip)
}

/// Stored while an IP is blocked. Lives exactly `duration` seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub ip: String,
    /// Rule whose denial tipped the violation count over.
    pub rule: String,
    pub reason: String,
    /// Epoch seconds.
    pub blocked_at: u64,
    pub duration: u64,
    #[serde(default = "default_block_status")]
    pub response_code: u16,
}

fn default_block_status() -> u16 {
    429
}

/// A live block as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockEntry {
    #[serde(flatten)]
    pub record: BlockRecord,
    pub remaining_secs: u64,
}
