//! Consensus view and file-based consensus sources.
//!
//! A [`ConsensusView`] is the guard-relevant projection of one network
//! consensus: for every listed relay its fingerprint, flags, OR address and
//! guard-position bandwidth weight. Views are immutable once built and are
//! replaced wholesale on every refresh (see [`crate::refresh`]).
//!
//! # Building a View
//!
//! ```text
//!   ns/all text ──► parse_network_statuses() ──┐
//!                                              ├──► ConsensusView::from_routers()
//!   cached consensus ──► get_consensus_weights() ┘
//! ```
//!
//! Construction validates every fingerprint and rejects duplicates before
//! anything is returned, so a malformed consensus never reaches the store.
//!
//! # Guard Weight
//!
//! | Flags | Weight key |
//! |-------|------------|
//! | Guard + Exit | `Wgd` |
//! | Guard only | `Wgg` |
//! | Exit only | `Wge` |
//! | Neither | `Wgm` |
//!
//! ```text
//! weight = (measured or advertised bandwidth) × W / 10000
//! ```
//!
//! Missing keys count as 10000 (no scaling).

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::path::Path;

use chrono::Utc;
use stem_rs::descriptor::router_status::{RouterStatusEntry, RouterStatusEntryType};

use crate::error::{Error, Result};
use crate::node_selection::is_valid_fingerprint;

/// Scale of the consensus `bandwidth-weights` values.
pub const WEIGHT_SCALE: f64 = 10000.0;

/// One relay as seen by guard selection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusEntry {
    /// Upper-case hex identity fingerprint.
    pub fingerprint: String,
    /// Relay nickname.
    pub nickname: String,
    /// Primary OR address.
    pub address: IpAddr,
    /// Primary OR port.
    pub or_port: u16,
    /// Additional OR addresses `(address, port, is_ipv6)`.
    pub or_addresses: Vec<(IpAddr, u16, bool)>,
    /// Consensus flags.
    pub flags: Vec<String>,
    /// Guard-position bandwidth weight.
    pub weight: u64,
}

impl ConsensusEntry {
    /// Builds a running, valid, stable guard that also serves directory data.
    ///
    /// ```rust
    /// use entry_guards_rs::consensus::ConsensusEntry;
    ///
    /// let entry = ConsensusEntry::guard(&"AB".repeat(20), "192.0.2.1".parse().unwrap(), 443, 500);
    /// assert!(entry.is_guard_eligible());
    /// assert!(entry.is_dir_cache());
    /// ```
    pub fn guard(fingerprint: &str, address: IpAddr, or_port: u16, weight: u64) -> Self {
        Self {
            fingerprint: fingerprint.to_uppercase(),
            nickname: format!("guard{}", fingerprint.chars().take(8).collect::<String>()),
            address,
            or_port,
            or_addresses: Vec::new(),
            flags: ["Guard", "Running", "Stable", "V2Dir", "Valid"]
                .iter()
                .map(|f| f.to_string())
                .collect(),
            weight,
        }
    }

    /// Returns true if the relay carries `flag`.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// Guard flag.
    pub fn is_guard(&self) -> bool {
        self.has_flag("Guard")
    }

    /// V2Dir flag: the relay caches directory documents.
    pub fn is_dir_cache(&self) -> bool {
        self.has_flag("V2Dir")
    }

    /// Stable flag, the consensus proxy for uptime.
    pub fn is_stable(&self) -> bool {
        self.has_flag("Stable")
    }

    /// Guard, Running and Valid together.
    pub fn is_guard_eligible(&self) -> bool {
        self.is_guard() && self.has_flag("Running") && self.has_flag("Valid")
    }

    /// Every OR address, primary first.
    pub fn all_addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        std::iter::once(self.address).chain(self.or_addresses.iter().map(|(a, _, _)| *a))
    }
}

/// The guard-relevant projection of one consensus.
///
/// Entries keep consensus order; lookups go through a fingerprint index.
#[derive(Debug, Clone, Default)]
pub struct ConsensusView {
    entries: Vec<ConsensusEntry>,
    index: HashMap<String, usize>,
}

impl ConsensusView {
    /// Builds a view from entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Consensus`] on an invalid or repeated fingerprint.
    pub fn new(entries: Vec<ConsensusEntry>) -> Result<Self> {
        let mut index = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            if !is_valid_fingerprint(&entry.fingerprint)
                || entry.fingerprint != entry.fingerprint.to_uppercase()
            {
                return Err(Error::Consensus(format!(
                    "invalid fingerprint: {}",
                    entry.fingerprint
                )));
            }
            if index.insert(entry.fingerprint.clone(), i).is_some() {
                return Err(Error::Consensus(format!(
                    "duplicate relay {}",
                    entry.fingerprint
                )));
            }
        }
        Ok(Self { entries, index })
    }

    /// Builds a view from parsed router status entries and the consensus
    /// `bandwidth-weights` map.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Consensus`] on an invalid or repeated fingerprint.
    pub fn from_routers(
        routers: &[RouterStatusEntry],
        bw_weights: &HashMap<String, i64>,
    ) -> Result<Self> {
        let entries = routers
            .iter()
            .map(|r| ConsensusEntry {
                fingerprint: r.fingerprint.to_uppercase(),
                nickname: r.nickname.clone(),
                address: r.address,
                or_port: r.or_port,
                or_addresses: r.or_addresses.clone(),
                flags: r.flags.clone(),
                weight: guard_weight(r, bw_weights),
            })
            .collect();
        Self::new(entries)
    }

    /// Looks up a relay by fingerprint.
    pub fn get(&self, fingerprint: &str) -> Option<&ConsensusEntry> {
        self.index.get(fingerprint).map(|&i| &self.entries[i])
    }

    /// Returns true if the relay is in this consensus.
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.index.contains_key(fingerprint)
    }

    /// Returns true if the relay is listed here with the Guard flag.
    pub fn is_listed_guard(&self, fingerprint: &str) -> bool {
        self.get(fingerprint).is_some_and(|e| e.is_guard())
    }

    /// Number of relays listed with the Guard flag.
    pub fn guard_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_guard()).count()
    }

    /// All entries in consensus order.
    pub fn entries(&self) -> &[ConsensusEntry] {
        &self.entries
    }

    /// Number of relays.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the view holds no relays.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Guard-position weight of one router.
pub fn guard_weight(router: &RouterStatusEntry, bw_weights: &HashMap<String, i64>) -> u64 {
    let bw = router.measured.or(router.bandwidth).unwrap_or(0) as f64;
    let has_guard = router.flags.iter().any(|f| f == "Guard");
    let has_exit = router.flags.iter().any(|f| f == "Exit");

    let key = match (has_guard, has_exit) {
        (true, true) => "Wgd",
        (true, false) => "Wgg",
        (false, true) => "Wge",
        (false, false) => "Wgm",
    };
    let multiplier = bw_weights.get(key).copied().unwrap_or(10000).max(0) as f64 / WEIGHT_SCALE;

    (bw * multiplier).round() as u64
}

/// Parses the `bandwidth-weights` line of a cached consensus file.
///
/// # Errors
///
/// Returns [`Error::Consensus`] if the file cannot be read or holds no
/// `bandwidth-weights` line.
///
/// # File Format
///
/// ```text
/// bandwidth-weights Wbd=0 Wbe=0 Wbg=4194 Wbm=10000 ...
/// ```
pub fn get_consensus_weights(consensus_filename: &Path) -> Result<HashMap<String, i64>> {
    let file = std::fs::File::open(consensus_filename).map_err(|e| {
        Error::Consensus(format!(
            "cannot read {}: {}",
            consensus_filename.display(),
            e
        ))
    })?;
    let reader = BufReader::new(file);

    let mut weights = HashMap::new();

    for line in reader.lines() {
        let line = line.map_err(|e| Error::Consensus(format!("read error: {}", e)))?;
        if let Some(rest) = line.strip_prefix("bandwidth-weights ") {
            for part in rest.split_whitespace() {
                if let Some((key, value)) = part.split_once('=') {
                    if let Ok(v) = value.parse::<i64>() {
                        weights.insert(key.to_string(), v);
                    }
                }
            }
            break;
        }
    }

    if weights.is_empty() {
        return Err(Error::Consensus(
            "no bandwidth-weights found in consensus".to_string(),
        ));
    }

    Ok(weights)
}

/// Reads and parses a file in control-port `ns/all` format.
pub fn read_network_statuses(path: &Path) -> Result<Vec<RouterStatusEntry>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Consensus(format!("cannot read {}: {}", path.display(), e)))?;
    parse_network_statuses(&text)
}

/// Parses router status entries from `GETINFO ns/all` output.
///
/// Handles `r`, `s` and `w` lines. Any malformed `r` line rejects the whole
/// input.
///
/// # Errors
///
/// Returns [`Error::Consensus`] on a short `r` line, a bad address or port,
/// or an identity that does not decode to a 20-byte fingerprint.
pub fn parse_network_statuses(response: &str) -> Result<Vec<RouterStatusEntry>> {
    let mut routers = Vec::new();
    let mut current_router: Option<RouterStatusEntry> = None;

    for (lineno, line) in response.lines().enumerate() {
        if let Some(rest) = line.strip_prefix("r ") {
            if let Some(router) = current_router.take() {
                routers.push(router);
            }

            // r nickname identity digest date time IP ORPort DirPort
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() < 7 {
                return Err(Error::Consensus(format!(
                    "line {}: truncated router line",
                    lineno + 1
                )));
            }
            let fingerprint = decode_base64_fingerprint(parts[1]).ok_or_else(|| {
                Error::Consensus(format!("line {}: bad identity {}", lineno + 1, parts[1]))
            })?;
            let address: IpAddr = parts[5].parse().map_err(|_| {
                Error::Consensus(format!("line {}: bad address {}", lineno + 1, parts[5]))
            })?;
            let or_port: u16 = parts[6].parse().map_err(|_| {
                Error::Consensus(format!("line {}: bad ORPort {}", lineno + 1, parts[6]))
            })?;

            current_router = Some(RouterStatusEntry::new(
                RouterStatusEntryType::V3,
                parts[0].to_string(),
                fingerprint,
                Utc::now(),
                address,
                or_port,
            ));
        } else if let Some(stripped) = line.strip_prefix("s ") {
            if let Some(ref mut router) = current_router {
                router.flags = stripped.split_whitespace().map(|s| s.to_string()).collect();
            }
        } else if let Some(stripped) = line.strip_prefix("w ") {
            if let Some(ref mut router) = current_router {
                for part in stripped.split_whitespace() {
                    if let Some((key, value)) = part.split_once('=') {
                        if let Ok(v) = value.parse::<u64>() {
                            match key {
                                "Bandwidth" => router.bandwidth = Some(v),
                                "Measured" => router.measured = Some(v),
                                _ => {}
                            }
                        }
                    }
                }
            }
        }
    }

    if let Some(router) = current_router {
        routers.push(router);
    }

    Ok(routers)
}

/// Loads a view from an `ns/all` file and an optional cached consensus
/// carrying bandwidth weights.
pub fn load_consensus(ns_path: &Path, weights_path: Option<&Path>) -> Result<ConsensusView> {
    let routers = read_network_statuses(ns_path)?;
    let weights = match weights_path {
        Some(p) => get_consensus_weights(p)?,
        None => HashMap::new(),
    };
    ConsensusView::from_routers(&routers, &weights)
}

/// Decodes an unpadded base64 identity to a 40-character hex fingerprint.
fn decode_base64_fingerprint(b64: &str) -> Option<String> {
    let decoded = base64_decode(b64)?;
    if decoded.len() != 20 {
        return None;
    }
    Some(decoded.iter().map(|b| format!("{:02X}", b)).collect())
}

fn base64_decode(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    let input = input.trim_end_matches('=');
    let mut output = Vec::new();
    let mut buffer = 0u32;
    let mut bits = 0;

    for c in input.bytes() {
        let value = ALPHABET.iter().position(|&x| x == c)? as u32;
        buffer = (buffer << 6) | value;
        bits += 6;

        if bits >= 8 {
            bits -= 8;
            output.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    Some(output)
}
