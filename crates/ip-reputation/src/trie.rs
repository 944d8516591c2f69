use std::net::IpAddr;

use ipnet::IpNet;

/// Binary prefix trie answering "is this address inside any stored range".
///
/// IPv4 and IPv6 live under separate roots. Addresses are walked as a
/// left-aligned `u128`, most significant bit first.
#[derive(Default)]
pub struct IpTrie {
    v4: Node,
    v6: Node,
    len: usize,
}

/// One bit position. A terminal node marks the end of a stored prefix.
#[derive(Default)]
struct Node {
    children: [Option<Box<Node>>; 2],
    terminal: bool,
}

/// The address as 128 left-aligned bits plus its family width.
fn bits_of(addr: IpAddr) -> (u128, u8) {
    match addr {
        IpAddr::V4(v4) => ((u32::from(v4) as u128) << 96, 32),
        IpAddr::V6(v6) => (u128::from(v6), 128),
    }
}

/// Bit `i` of `bits`, counting from the most significant end.
fn bit_at(bits: u128, i: u8) -> usize {
    ((bits >> (127 - i)) & 1) as usize
}

impl IpTrie {
    /// An empty trie.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a trie holding every range in `networks`.
    pub fn from_networks(networks: impl IntoIterator<Item = IpNet>) -> Self {
        let mut trie = Self::new();
        for net in networks {
            trie.insert(net);
        }
        trie
    }

    /// Insert a range. Re-inserting a range already present is a no-op.
    pub fn insert(&mut self, network: IpNet) {
        let (bits, _) = bits_of(network.network());
        let mut node = match network {
            IpNet::V4(_) => &mut self.v4,
            IpNet::V6(_) => &mut self.v6,
        };

        for i in 0..network.prefix_len() {
            node = &mut **node.children[bit_at(bits, i)].get_or_insert_with(Box::default);
        }
        if !node.terminal {
            node.terminal = true;
            self.len += 1;
        }
    }

    /// True if any stored range contains the address.
    pub fn contains(&self, addr: IpAddr) -> bool {
        let (bits, width) = bits_of(addr);
        let mut node = match addr {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => &self.v6,
        };

        for i in 0..width {
            if node.terminal {
                return true;
            }
            match &node.children[bit_at(bits, i)] {
                Some(child) => node = &**child,
                None => return false,
            }
        }
        node.terminal
    }

    /// Number of distinct ranges inserted.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no range has been inserted.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trie(ranges: &[&str]) -> IpTrie {
        IpTrie::from_networks(ranges.iter().map(|r| r.parse().unwrap()))
    }

    #[test]
    fn empty_trie_contains_nothing() {
        let t = IpTrie::new();
        assert!(t.is_empty());
        assert!(!t.contains("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn host_route() {
        let t = trie(&["203.0.113.7/32"]);
        assert!(t.contains("203.0.113.7".parse().unwrap()));
        assert!(!t.contains("203.0.113.8".parse().unwrap()));
    }

    #[test]
    fn cidr_boundaries() {
        let t = trie(&["172.16.0.0/12"]);
        assert!(t.contains("172.16.0.0".parse().unwrap()));
        assert!(t.contains("172.31.255.255".parse().unwrap()));
        assert!(!t.contains("172.32.0.0".parse().unwrap()));
        assert!(!t.contains("172.15.255.255".parse().unwrap()));
    }

    #[test]
    fn families_do_not_mix() {
        let t = trie(&["0.0.0.0/0", "fd00::/8"]);
        assert!(t.contains("198.51.100.1".parse().unwrap()));
        assert!(t.contains("fd12::1".parse().unwrap()));
        assert!(!t.contains("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn duplicates_count_once() {
        let t = trie(&["10.0.0.0/8", "10.0.0.0/8", "10.0.0.0/24"]);
        assert_eq!(t.len(), 2);
        assert!(t.contains("10.200.0.1".parse().unwrap()));
    }

    #[test]
    fn ipv6_host() {
        let t = trie(&["::1/128"]);
        assert!(t.contains("::1".parse().unwrap()));
        assert!(!t.contains("::2".parse().unwrap()));
    }
}
