//! Static Address Table
//!
//! Bootstrap mapping of well-known service domains to their addresses.
//! Entries are keyed by domain suffix, so `scontent.instagram.com` is
//! answered by the `instagram.com` entry. When several suffixes match,
//! the longest one wins.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

/// Lowercase a domain and strip surrounding whitespace and the root dot.
///
/// Returns `None` for strings that cannot be a domain name.
pub fn normalize_domain(domain: &str) -> Option<String> {
    let normalized = domain.trim().trim_end_matches('.').to_lowercase();

    if normalized.is_empty()
        || normalized.starts_with('.')
        || normalized.contains("..")
        || normalized.chars().any(|c| c.is_whitespace() || c == '/')
    {
        return None;
    }

    Some(normalized)
}

/// Check whether `suffix` matches `domain` on a label boundary.
pub fn suffix_matches(domain: &str, suffix: &str) -> bool {
    domain == suffix
        || (domain.len() > suffix.len()
            && domain.ends_with(suffix)
            && domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.')
}

/// Exact host range for an address (`/32` for IPv4, `/128` for IPv6).
pub fn host_range(addr: IpAddr) -> IpNet {
    IpNet::from(addr)
}

/// Domain suffix → address table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Vec<IpAddr>>", into = "BTreeMap<String, Vec<IpAddr>>")]
pub struct StaticAddressTable {
    entries: BTreeMap<String, Vec<IpAddr>>,
}

impl From<BTreeMap<String, Vec<IpAddr>>> for StaticAddressTable {
    fn from(raw: BTreeMap<String, Vec<IpAddr>>) -> Self {
        let mut table = Self::new();
        for (suffix, addresses) in raw {
            table.insert(&suffix, addresses);
        }
        table
    }
}

impl From<StaticAddressTable> for BTreeMap<String, Vec<IpAddr>> {
    fn from(table: StaticAddressTable) -> Self {
        table.entries
    }
}

impl StaticAddressTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) the addresses for a domain suffix.
    ///
    /// Suffixes that do not normalize to a domain are ignored.
    pub fn insert(&mut self, suffix: &str, addresses: Vec<IpAddr>) {
        if let Some(key) = normalize_domain(suffix) {
            self.entries.insert(key, addresses);
        }
    }

    /// Builder-style insert
    pub fn with(mut self, suffix: &str, addresses: Vec<IpAddr>) -> Self {
        self.insert(suffix, addresses);
        self
    }

    /// Number of suffix entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the entry with the longest suffix matching `domain`.
    ///
    /// `domain` must already be normalized.
    pub fn lookup(&self, domain: &str) -> Option<(&str, &[IpAddr])> {
        self.entries
            .iter()
            .filter(|(suffix, _)| suffix_matches(domain, suffix))
            .max_by_key(|(suffix, _)| suffix.len())
            .map(|(suffix, addrs)| (suffix.as_str(), addrs.as_slice()))
    }

    /// Addresses for the major social, messaging and streaming services.
    pub fn bootstrap() -> Self {
        let v4 = |a, b, c, d| IpAddr::V4(Ipv4Addr::new(a, b, c, d));

        Self::new()
            .with("facebook.com", vec![v4(157, 240, 0, 0), v4(31, 13, 64, 0)])
            .with("instagram.com", vec![v4(157, 240, 0, 0), v4(31, 13, 64, 0)])
            .with("snapchat.com", vec![v4(35, 186, 224, 0), v4(35, 241, 0, 0)])
            .with("tiktok.com", vec![v4(104, 244, 42, 0), v4(104, 244, 43, 0)])
            .with("twitter.com", vec![v4(104, 244, 42, 0), v4(199, 16, 156, 0)])
            .with("youtube.com", vec![v4(216, 58, 194, 0), v4(172, 217, 0, 0)])
            .with("whatsapp.com", vec![v4(157, 240, 0, 0), v4(31, 13, 64, 0)])
            .with("discord.com", vec![v4(162, 159, 128, 0), v4(162, 159, 129, 0)])
            .with("spotify.com", vec![v4(35, 186, 224, 0), v4(104, 154, 0, 0)])
            .with("netflix.com", vec![v4(23, 246, 0, 0), v4(37, 77, 184, 0)])
    }
}
