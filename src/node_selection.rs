//! Bandwidth-weighted guard sampling and input validation.
//!
//! This module draws new guards from the consensus when the store has no
//! suitable candidate left. It never relaxes constraints on its own: callers
//! either ask for one exact draw with [`WeightedSampler::sample`] or walk the
//! fixed relaxation ladder with [`WeightedSampler::sample_with_relaxation`].
//!
//! # Sampling Pipeline
//!
//! ```text
//!   ConsensusView entries
//!          │
//!          ▼
//!   NodeRestrictionList ◄── flags (Guard, Running, Valid, Stable?, V2Dir?)
//!          │            ◄── minimum bandwidth weight
//!          │            ◄── pool (utopic / dystopic)
//!          ▼
//!   exclusion set + ExcludeNodes
//!          │
//!          ▼
//!   cumulative weight draw ──► fingerprint
//! ```
//!
//! # Relaxation Ladder
//!
//! | Rung | Bandwidth / Stable | Directory cache |
//! |------|--------------------|-----------------|
//! | 1 | as configured | as requested |
//! | 2 | dropped | as requested |
//! | 3 | dropped | dropped |
//!
//! [`Error::NoEligibleGuards`] is returned only after rung 3 comes up empty.
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashSet;
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//! use entry_guards_rs::consensus::{ConsensusEntry, ConsensusView};
//! use entry_guards_rs::node_selection::{ExcludeNodes, PoolPolicy, SampleConstraints, WeightedSampler};
//!
//! let view = ConsensusView::new(vec![
//!     ConsensusEntry::guard(&"AA".repeat(20), "192.0.2.1".parse().unwrap(), 9001, 10),
//!     ConsensusEntry::guard(&"BB".repeat(20), "192.0.2.2".parse().unwrap(), 443, 30),
//! ]).unwrap();
//!
//! let sampler = WeightedSampler::new(PoolPolicy::default(), ExcludeNodes::new());
//! let mut rng = StdRng::seed_from_u64(7);
//! let picked = sampler.sample(&view, &SampleConstraints::default(), &mut rng).unwrap();
//! assert!(view.contains(&picked.fingerprint));
//! ```

use std::collections::HashSet;
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use rand::Rng;
use tracing::{debug, warn};

use crate::consensus::ConsensusEntry;
use crate::consensus::ConsensusView;
use crate::error::{Error, Result};

/// Validates that a string is a valid relay fingerprint.
///
/// A valid fingerprint is exactly 40 hexadecimal characters (case-insensitive).
///
/// ```rust
/// use entry_guards_rs::node_selection::is_valid_fingerprint;
///
/// assert!(is_valid_fingerprint("AABBCCDD00112233445566778899AABBCCDDEEFF"));
/// assert!(!is_valid_fingerprint("AABBCCDD"));
/// assert!(!is_valid_fingerprint("GGHHIIJJ00112233445566778899AABBCCDDEEFF"));
/// ```
pub fn is_valid_fingerprint(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Interface for relay filtering policies.
///
/// Multiple restrictions combine through [`NodeRestrictionList`].
pub trait NodeRestriction: Send + Sync {
    /// Returns true if the relay passes this restriction.
    fn r_is_ok(&self, entry: &ConsensusEntry) -> bool;
}

/// Mandatory and forbidden consensus flags.
#[derive(Debug, Clone)]
pub struct FlagsRestriction {
    /// Flags that must be present.
    pub mandatory: Vec<String>,
    /// Flags that must be absent.
    pub forbidden: Vec<String>,
}

impl FlagsRestriction {
    /// Creates a new flags restriction.
    pub fn new(mandatory: Vec<String>, forbidden: Vec<String>) -> Self {
        Self {
            mandatory,
            forbidden,
        }
    }
}

impl NodeRestriction for FlagsRestriction {
    fn r_is_ok(&self, entry: &ConsensusEntry) -> bool {
        self.mandatory.iter().all(|m| entry.has_flag(m))
            && !self.forbidden.iter().any(|f| entry.has_flag(f))
    }
}

/// Minimum guard-position weight.
#[derive(Debug, Clone, Copy)]
pub struct BandwidthRestriction {
    /// Smallest accepted weight.
    pub min_bandwidth: u64,
}

impl NodeRestriction for BandwidthRestriction {
    fn r_is_ok(&self, entry: &ConsensusEntry) -> bool {
        entry.weight >= self.min_bandwidth
    }
}

/// Membership in the utopic or dystopic pool.
#[derive(Debug, Clone)]
pub struct PoolRestriction {
    policy: PoolPolicy,
    pool: Pool,
}

impl NodeRestriction for PoolRestriction {
    fn r_is_ok(&self, entry: &ConsensusEntry) -> bool {
        self.policy.in_pool(entry.or_port, self.pool)
    }
}

/// All restrictions must pass for a relay to be accepted.
pub struct NodeRestrictionList {
    restrictions: Vec<Box<dyn NodeRestriction>>,
}

impl NodeRestrictionList {
    /// Creates a new restriction list.
    pub fn new(restrictions: Vec<Box<dyn NodeRestriction>>) -> Self {
        Self { restrictions }
    }

    /// Returns true if the relay passes all restrictions.
    pub fn r_is_ok(&self, entry: &ConsensusEntry) -> bool {
        self.restrictions.iter().all(|r| r.r_is_ok(entry))
    }
}

/// Guard pool a session is currently drawing from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Pool {
    /// Any reachable port (all relays unless pools are disjoint).
    #[default]
    Utopic,
    /// Relays whose OR port passes restrictive firewalls.
    Dystopic,
}

impl std::fmt::Display for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pool::Utopic => f.write_str("utopic"),
            Pool::Dystopic => f.write_str("dystopic"),
        }
    }
}

/// How OR ports map onto pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPolicy {
    /// Ports that make a relay dystopic.
    pub dystopic_ports: Vec<u16>,
    /// When set, the utopic pool excludes dystopic relays.
    pub disjoint: bool,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            dystopic_ports: vec![80, 443],
            disjoint: false,
        }
    }
}

impl PoolPolicy {
    /// Returns true if `or_port` is a dystopic port.
    pub fn is_dystopic(&self, or_port: u16) -> bool {
        self.dystopic_ports.contains(&or_port)
    }

    /// Returns true if a relay on `or_port` belongs to `pool`.
    pub fn in_pool(&self, or_port: u16, pool: Pool) -> bool {
        match pool {
            Pool::Dystopic => self.is_dystopic(or_port),
            Pool::Utopic => !self.disjoint || !self.is_dystopic(or_port),
        }
    }
}

/// Constraints for one draw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleConstraints {
    /// Only directory caches.
    pub need_dir_cache: bool,
    /// Minimum guard-position weight.
    pub min_bandwidth: u64,
    /// Require the Stable flag.
    pub require_stable: bool,
    /// Pool to draw from.
    pub pool: Pool,
    /// Fingerprints that must not be drawn (stored or already tried).
    pub exclude: HashSet<String>,
}

impl SampleConstraints {
    /// The fixed ladder: full constraints, then without bandwidth and uptime
    /// thresholds, then without the directory requirement.
    pub fn relaxation_ladder(&self) -> [SampleConstraints; 3] {
        let full = self.clone();
        let relaxed = SampleConstraints {
            min_bandwidth: 0,
            require_stable: false,
            ..self.clone()
        };
        let no_dir = SampleConstraints {
            need_dir_cache: false,
            ..relaxed.clone()
        };
        [full, relaxed, no_dir]
    }

    fn restrictions(&self, policy: &PoolPolicy) -> NodeRestrictionList {
        let mut mandatory = vec![
            "Guard".to_string(),
            "Running".to_string(),
            "Valid".to_string(),
        ];
        if self.require_stable {
            mandatory.push("Stable".to_string());
        }
        if self.need_dir_cache {
            mandatory.push("V2Dir".to_string());
        }
        NodeRestrictionList::new(vec![
            Box::new(FlagsRestriction::new(mandatory, vec![])),
            Box::new(BandwidthRestriction {
                min_bandwidth: self.min_bandwidth,
            }),
            Box::new(PoolRestriction {
                policy: policy.clone(),
                pool: self.pool,
            }),
        ])
    }
}

/// Bandwidth-weighted guard sampler.
///
/// Selection probability is proportional to each candidate's consensus
/// weight. A non-empty pool whose weights are all zero is drawn uniformly,
/// as is every pool once [`uniform`](Self::uniform) is set.
///
/// # Selection Algorithm
///
/// 1. Filter the view through the restriction list
/// 2. Drop excluded fingerprints and ExcludeNodes matches
/// 3. Generate a random value in `[0, total_weight)`
/// 4. Select the relay whose cumulative weight first exceeds it
#[derive(Debug, Clone, Default)]
pub struct WeightedSampler {
    policy: PoolPolicy,
    exclude_nodes: ExcludeNodes,
    uniform: bool,
}

impl WeightedSampler {
    /// Creates a sampler for the given pool layout and configured exclusions.
    pub fn new(policy: PoolPolicy, exclude_nodes: ExcludeNodes) -> Self {
        Self {
            policy,
            exclude_nodes,
            uniform: false,
        }
    }

    /// Ignores bandwidth weights and draws uniformly when `uniform` is true.
    pub fn uniform(mut self, uniform: bool) -> Self {
        self.uniform = uniform;
        self
    }

    /// Returns true if draws ignore bandwidth weights.
    pub fn is_uniform(&self) -> bool {
        self.uniform
    }

    /// The pool layout.
    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    /// Configured ExcludeNodes.
    pub fn exclude_nodes(&self) -> &ExcludeNodes {
        &self.exclude_nodes
    }

    /// Relays eligible under `constraints`, in consensus order.
    pub fn candidates<'a>(
        &self,
        view: &'a ConsensusView,
        constraints: &SampleConstraints,
    ) -> Vec<&'a ConsensusEntry> {
        let restrictions = constraints.restrictions(&self.policy);
        view.entries()
            .iter()
            .filter(|e| restrictions.r_is_ok(e))
            .filter(|e| !constraints.exclude.contains(&e.fingerprint))
            .filter(|e| !self.exclude_nodes.router_is_excluded(e))
            .collect()
    }

    /// Number of guard-eligible relays in `pool`, ignoring other constraints.
    pub fn pool_size(&self, view: &ConsensusView, pool: Pool) -> usize {
        view.entries()
            .iter()
            .filter(|e| e.is_guard_eligible() && self.policy.in_pool(e.or_port, pool))
            .count()
    }

    /// Draws one relay under exactly these constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoEligibleGuards`] if no relay qualifies.
    pub fn sample<'a, R: Rng + ?Sized>(
        &self,
        view: &'a ConsensusView,
        constraints: &SampleConstraints,
        rng: &mut R,
    ) -> Result<&'a ConsensusEntry> {
        let pool = self.candidates(view, constraints);
        if pool.is_empty() {
            return Err(Error::NoEligibleGuards);
        }

        let weight_total: f64 = pool.iter().map(|e| e.weight as f64).sum();
        if self.uniform || weight_total <= 0.0 {
            return Ok(pool[rng.gen_range(0..pool.len())]);
        }

        let choice_val = rng.gen_range(0.0..weight_total);
        let mut cumulative = 0.0;
        for &entry in &pool {
            cumulative += entry.weight as f64;
            if cumulative > choice_val {
                return Ok(entry);
            }
        }

        // Float rounding can leave choice_val at the very top of the range.
        pool.iter()
            .rev()
            .find(|e| e.weight > 0)
            .copied()
            .ok_or(Error::NoEligibleGuards)
    }

    /// Draws one relay, walking the relaxation ladder until a rung succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoEligibleGuards`] once every rung is empty.
    pub fn sample_with_relaxation<'a, R: Rng + ?Sized>(
        &self,
        view: &'a ConsensusView,
        constraints: &SampleConstraints,
        rng: &mut R,
    ) -> Result<&'a ConsensusEntry> {
        for (rung, c) in constraints.relaxation_ladder().iter().enumerate() {
            match self.sample(view, c, rng) {
                Ok(entry) => {
                    if rung > 0 {
                        debug!(rung, pool = %c.pool, "sampled guard after relaxing constraints");
                    }
                    return Ok(entry);
                }
                Err(Error::NoEligibleGuards) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::NoEligibleGuards)
    }
}

/// Parsed ExcludeNodes setting.
///
/// Entries are comma-separated and can be:
///
/// - `$FINGERPRINT` or `FINGERPRINT` (a `~nick` or `=nick` suffix is stripped)
/// - `192.168.0.0/24`, `2001:db8::/32` or a bare address
/// - `nickname`
///
/// Country codes (`{cc}`) need GeoIP data and are skipped with a warning.
///
/// ```rust
/// use entry_guards_rs::node_selection::ExcludeNodes;
///
/// let exclude = ExcludeNodes::parse("$AABBCCDD00112233445566778899AABBCCDDEEFF,10.0.0.0/8,BadRelay");
/// assert_eq!(exclude.idhexes.len(), 1);
/// assert_eq!(exclude.networks.len(), 1);
/// assert!(exclude.nicks.contains("BadRelay"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ExcludeNodes {
    /// IP networks to exclude.
    pub networks: Vec<IpNetwork>,
    /// Relay fingerprints to exclude (uppercase hex).
    pub idhexes: HashSet<String>,
    /// Relay nicknames to exclude.
    pub nicks: HashSet<String>,
}

impl ExcludeNodes {
    /// Creates an empty exclusion set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses an ExcludeNodes configuration line.
    pub fn parse(conf_line: &str) -> Self {
        let mut result = Self::new();

        for part in conf_line.split(',') {
            let mut p = part.trim();
            if p.is_empty() {
                continue;
            }

            p = p.strip_prefix('$').unwrap_or(p);
            if let Some(idx) = p.find(['~', '=']) {
                p = &p[..idx];
            }

            if is_valid_fingerprint(p) {
                result.idhexes.insert(p.to_uppercase());
            } else if p.starts_with('{') && p.ends_with('}') {
                warn!(entry = p, "ignoring country code in ExcludeNodes");
            } else if p.contains(':') || p.contains('.') {
                if let Ok(network) = p.parse::<IpNetwork>() {
                    result.networks.push(network);
                } else if let Ok(ip) = p.parse::<IpAddr>() {
                    result.networks.push(IpNetwork::from(ip));
                } else {
                    warn!(entry = p, "ignoring unparseable ExcludeNodes entry");
                }
            } else {
                result.nicks.insert(p.to_string());
            }
        }

        result
    }

    /// Returns true if the relay matches any exclusion.
    pub fn router_is_excluded(&self, entry: &ConsensusEntry) -> bool {
        if self.idhexes.contains(&entry.fingerprint) || self.nicks.contains(&entry.nickname) {
            return true;
        }
        entry
            .all_addresses()
            .any(|addr| self.networks.iter().any(|n| n.contains(addr)))
    }

    /// Returns true if any exclusion is configured.
    pub fn has_exclusions(&self) -> bool {
        !self.networks.is_empty() || !self.idhexes.is_empty() || !self.nicks.is_empty()
    }
}
