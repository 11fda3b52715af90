#![deny(missing_docs)]
// Documentation
//! An immutable, ordered set of IPv4/IPv6 CIDR prefixes with O(log N)
//! membership testing.
//!
//! Entries are stored sorted first by address family (IPv4 before IPv6),
//! then by the prefix's network bytes ascending, with host bits already
//! cleared. Membership is a 3-way binary search rather than a trie: CIDR
//! lists in a DNS filter are typically a few thousand entries at most,
//! looked up once or twice per response, so a sorted slice with a
//! branch-predictable compare beats the extra memory and pointer-chasing
//! of a trie.
//!
//! ```
//! use cidrset::CidrSet;
//!
//! let set = CidrSet::from_lines("10.0.0.0/8\n192.168.1.1\n").unwrap();
//! assert!(set.contains("10.1.2.3".parse().unwrap()));
//! assert!(set.contains("192.168.1.1".parse().unwrap()));
//! assert!(!set.contains("8.8.8.8".parse().unwrap()));
//! ```

use std::cmp::Ordering;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use thiserror::Error;
use tokio::{fs::File, io::AsyncReadExt};

/// Errors produced while loading or parsing a [`CidrSet`].
#[derive(Error, Debug)]
pub enum CidrError {
    /// The backing file could not be read.
    #[error("failed to read cidr file {path}: {source}")]
    Io {
        /// Path that failed to open or read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A non-empty line did not parse as a CIDR prefix or bare address.
    #[error("invalid cidr entry in {path}, line {line}: {content:?}")]
    InvalidEntry {
        /// Path of the file containing the bad line.
        path: String,
        /// 1-based line number.
        line: usize,
        /// The offending line's trimmed content.
        content: String,
    },
}

/// A single stored network prefix: host bits already cleared, family
/// implicit in the byte length (4 for IPv4, 16 for IPv6).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Prefix {
    network: Vec<u8>,
    prefix_len: u8,
}

/// An immutable, ordered set of CIDR prefixes.
#[derive(Debug, Clone, Default)]
pub struct CidrSet {
    prefixes: Vec<Prefix>,
}

impl Prefix {
    fn new(addr: IpAddr, prefix_len: u8) -> Self {
        let bytes = match addr {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        Self {
            network: mask_bytes(&bytes, prefix_len),
            prefix_len,
        }
    }

    /// Sort key: (family byte-length, network bytes).
    fn sort_key(&self) -> (usize, &[u8]) {
        (self.network.len(), &self.network)
    }
}

/// Clear host bits in `bytes` beyond `prefix_len`, returning the network
/// address bytes. `bytes` is expected to be 4 (IPv4) or 16 (IPv6) long.
fn mask_bytes(bytes: &[u8], prefix_len: u8) -> Vec<u8> {
    let mut out = bytes.to_vec();
    let full_bytes = (prefix_len / 8) as usize;
    let rem_bits = prefix_len % 8;
    for (i, b) in out.iter_mut().enumerate() {
        if i < full_bytes {
            continue;
        } else if i == full_bytes && rem_bits > 0 {
            *b &= 0xffu8 << (8 - rem_bits);
        } else if i >= full_bytes {
            *b = 0;
        }
    }
    out
}

/// Normalize IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) to their
/// canonical 4-byte IPv4 form; everything else passes through unchanged.
fn canonicalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => {
            let o = v6.octets();
            if o[..10] == [0; 10] && o[10] == 0xff && o[11] == 0xff {
                IpAddr::V4(Ipv4Addr::new(o[12], o[13], o[14], o[15]))
            } else {
                IpAddr::V6(v6)
            }
        }
        v4 => v4,
    }
}

/// Compare a query address against a stored prefix using the prefix's own
/// mask. Families compare by byte-length first (IPv4 < IPv6); within a
/// family, compare `query & prefix.mask` against `prefix.network`
/// byte-by-byte.
fn compare_to_prefix(query: &[u8], prefix: &Prefix) -> Ordering {
    match query.len().cmp(&prefix.network.len()) {
        Ordering::Equal => mask_bytes(query, prefix.prefix_len).cmp(&prefix.network),
        other => other,
    }
}

/// Parse one non-empty, already-trimmed CIDR-file line into an address and
/// prefix length. Bare addresses are auto-suffixed `/32` (IPv4) or `/128`
/// (IPv6).
fn parse_entry(entry: &str) -> Option<(IpAddr, u8)> {
    if let Some((addr, len)) = entry.split_once('/') {
        let addr: IpAddr = addr.trim().parse().ok()?;
        let len: u8 = len.trim().parse().ok()?;
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if len > max {
            return None;
        }
        Some((addr, len))
    } else {
        let addr: IpAddr = entry.parse().ok()?;
        let len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Some((addr, len))
    }
}

impl CidrSet {
    /// Parse a CIDR set from newline-separated text, one entry per
    /// non-empty line (matches the on-disk file format, minus the I/O).
    pub fn from_lines(text: &str) -> Result<Self, CidrError> {
        Self::from_lines_named(text, "<memory>")
    }

    fn from_lines_named(text: &str, path: &str) -> Result<Self, CidrError> {
        let mut prefixes = Vec::new();
        for (i, raw) in text.lines().enumerate() {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            let (addr, len) = parse_entry(trimmed).ok_or_else(|| CidrError::InvalidEntry {
                path: path.to_string(),
                line: i + 1,
                content: trimmed.to_string(),
            })?;
            prefixes.push(Prefix::new(addr, len));
        }
        prefixes.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Ok(Self { prefixes })
    }

    /// Load a CIDR set from a file: one prefix or bare address per
    /// non-empty line. Invalid entries are reported with the offending
    /// file path, line number, and line content.
    pub async fn load_file(path: impl AsRef<Path>) -> Result<Self, CidrError> {
        let path_str = path.as_ref().display().to_string();
        let mut file = File::open(path.as_ref())
            .await
            .map_err(|source| CidrError::Io {
                path: path_str.clone(),
                source,
            })?;
        let mut data = String::new();
        file.read_to_string(&mut data)
            .await
            .map_err(|source| CidrError::Io {
                path: path_str.clone(),
                source,
            })?;
        Self::from_lines_named(&data, &path_str)
    }

    /// Test whether `ip` falls within any stored prefix.
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = canonicalize(ip);
        let bytes = match ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        self.prefixes
            .binary_search_by(|p| compare_to_prefix(&bytes, p).reverse())
            .is_ok()
    }

    /// Number of prefixes held in the set.
    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    /// Whether the set holds no prefixes.
    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_addresses_get_host_masks() {
        let set = CidrSet::from_lines("192.168.1.1\n::1\n").unwrap();
        assert!(set.contains("192.168.1.1".parse().unwrap()));
        assert!(!set.contains("192.168.1.2".parse().unwrap()));
        assert!(set.contains("::1".parse().unwrap()));
    }

    #[test]
    fn cidr_membership() {
        let set = CidrSet::from_lines("10.0.0.0/8\n2001:db8::/32\n").unwrap();
        assert!(set.contains("10.255.0.1".parse().unwrap()));
        assert!(!set.contains("11.0.0.1".parse().unwrap()));
        assert!(set.contains("2001:db8::1".parse().unwrap()));
        assert!(!set.contains("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn blank_lines_are_ignored() {
        let set = CidrSet::from_lines("\n\n10.0.0.0/8\n\n").unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn invalid_entry_names_file_and_line() {
        let err = CidrSet::from_lines_named("10.0.0.0/8\nnonsense\n", "ads.txt").unwrap_err();
        match err {
            CidrError::InvalidEntry { path, line, content } => {
                assert_eq!(path, "ads.txt");
                assert_eq!(line, 2);
                assert_eq!(content, "nonsense");
            }
            _ => panic!("expected InvalidEntry"),
        }
    }

    #[test]
    fn ipv4_mapped_ipv6_is_canonicalized() {
        let set = CidrSet::from_lines("10.0.0.0/8\n").unwrap();
        let mapped: IpAddr = "::ffff:10.1.2.3".parse().unwrap();
        assert!(set.contains(mapped));
    }

    #[test]
    fn ipv4_and_ipv6_are_ordered_and_do_not_cross_match() {
        let set = CidrSet::from_lines("2001:db8::/32\n10.0.0.0/8\n").unwrap();
        assert_eq!(set.prefixes[0].network.len(), 4);
        assert_eq!(set.prefixes[1].network.len(), 16);
        assert!(!set.contains("172.16.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn load_file_reports_missing_file() {
        let err = CidrSet::load_file("/nonexistent/path/does-not-exist.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, CidrError::Io { .. }));
    }
}
