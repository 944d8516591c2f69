//! Static IP standing: operator block/allow lists and internal ranges.
//!
//! Lists are loaded from plain-text files, one address or CIDR range per
//! line, into prefix tries. Each list sits behind an [`ArcSwap`] so a reload
//! replaces it wholesale without stalling lookups on the request path.

mod trie;

use std::io::BufRead;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::IpNet;
use tracing::{info, warn};

pub use crate::trie::IpTrie;

/// Private, loopback and link-local ranges. Traffic from these is internal
/// and never subject to reputation checks.
const INTERNAL_RANGES: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

/// Where an address stands before any behavioural check runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Standing {
    /// Listed in the operator allowlist.
    Allowlisted,
    /// Private or loopback.
    Internal,
    /// Listed in the operator blocklist.
    Blocklisted,
    /// On no list and not internal.
    Unknown,
}

/// Operator block and allow lists plus the fixed internal ranges.
///
/// Lookups take a lock-free snapshot of each list, so a concurrent
/// [`IpReputation::reload`] never blocks the request path.
pub struct IpReputation {
    blocklist: ArcSwap<IpTrie>,
    allowlist: ArcSwap<IpTrie>,
    internal: IpTrie,
}

impl IpReputation {
    /// Empty block and allow lists; internal ranges preloaded.
    pub fn new() -> Self {
        let internal = IpTrie::from_networks(
            INTERNAL_RANGES
                .iter()
                .filter_map(|r| r.parse::<IpNet>().ok()),
        );
        Self {
            blocklist: ArcSwap::from_pointee(IpTrie::new()),
            allowlist: ArcSwap::from_pointee(IpTrie::new()),
            internal,
        }
    }

    /// Build from optional list files. A configured file that cannot be
    /// read is an error; a missing path leaves that list empty.
    pub fn from_files(blocklist: Option<&Path>, allowlist: Option<&Path>) -> anyhow::Result<Self> {
        let rep = Self::new();
        rep.reload(blocklist, allowlist)?;
        Ok(rep)
    }

    /// Replace both lists. On error neither list is changed.
    pub fn reload(&self, blocklist: Option<&Path>, allowlist: Option<&Path>) -> anyhow::Result<()> {
        let block = blocklist.map(read_list).transpose()?.unwrap_or_default();
        let allow = allowlist.map(read_list).transpose()?.unwrap_or_default();
        info!(
            blocklisted = block.len(),
            allowlisted = allow.len(),
            "ip lists loaded"
        );
        self.blocklist.store(Arc::new(block));
        self.allowlist.store(Arc::new(allow));
        Ok(())
    }

    /// True for private, loopback and link-local addresses.
    pub fn is_internal(&self, addr: IpAddr) -> bool {
        self.internal.contains(addr)
    }

    /// The allowlist wins over the blocklist; internal ranges are reported
    /// as such unless explicitly blocklisted.
    pub fn standing(&self, addr: IpAddr) -> Standing {
        if self.allowlist.load().contains(addr) {
            Standing::Allowlisted
        } else if self.blocklist.load().contains(addr) {
            Standing::Blocklisted
        } else if self.is_internal(addr) {
            Standing::Internal
        } else {
            Standing::Unknown
        }
    }
}

impl Default for IpReputation {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a list file. Blank lines and `#` comments are ignored; bare
/// addresses become host routes; unparseable lines are logged and skipped.
fn read_list(path: &Path) -> anyhow::Result<IpTrie> {
    let file = std::fs::File::open(path)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", path.display(), e))?;

    let mut trie = IpTrie::new();
    for (idx, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        let entry = line.trim();
        if entry.is_empty() || entry.starts_with('#') {
            continue;
        }

        match entry
            .parse::<IpNet>()
            .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from))
        {
            Ok(net) => trie.insert(net),
            Err(_) => warn!(
                path = %path.display(),
                line = idx + 1,
                entry,
                "skipping unparseable ip list entry"
            ),
        }
    }
    Ok(trie)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::path::PathBuf;

    struct TempList(PathBuf);

    impl TempList {
        fn new(name: &str, contents: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "ratewarden_{}_{}_{:?}",
                name,
                std::process::id(),
                std::thread::current().id()
            ));
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

    #[test]
    fn internal_ranges() {
        let rep = IpReputation::new();
        for ip in ["10.1.2.3", "192.168.0.10", "127.0.0.1", "::1", "fd00::5"] {
            assert_eq!(rep.standing(ip.parse().unwrap()), Standing::Internal, "{}", ip);
        }
        assert_eq!(rep.standing("8.8.8.8".parse().unwrap()), Standing::Unknown);
    }

    #[test]
    fn lists_from_files() {
        let block = TempList::new("block", "# bad actors\n198.51.100.0/24\n203.0.113.9\nnot-an-ip\n\n10.9.9.9\n");
        let allow = TempList::new("allow", "198.51.100.7\n");

        let rep = IpReputation::from_files(Some(&block.0), Some(&allow.0)).unwrap();
        assert_eq!(rep.standing("198.51.100.1".parse().unwrap()), Standing::Blocklisted);
        assert_eq!(rep.standing("203.0.113.9".parse().unwrap()), Standing::Blocklisted);
        // Allowlist beats blocklist.
        assert_eq!(rep.standing("198.51.100.7".parse().unwrap()), Standing::Allowlisted);
        // A blocklisted internal address stays blocked.
        assert_eq!(rep.standing("10.9.9.9".parse().unwrap()), Standing::Blocklisted);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(IpReputation::from_files(Some(Path::new("/nonexistent/ratewarden.list")), None).is_err());
    }

    #[test]
    fn reload_clears_unset_lists() {
        let block = TempList::new("reload", "203.0.113.0/24\n");
        let rep = IpReputation::from_files(Some(&block.0), None).unwrap();
        assert_eq!(rep.standing("203.0.113.4".parse().unwrap()), Standing::Blocklisted);

        rep.reload(None, None).unwrap();
        assert_eq!(rep.standing("203.0.113.4".parse().unwrap()), Standing::Unknown);
    }
}
