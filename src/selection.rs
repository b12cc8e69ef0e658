//! Guard selection state machine.
//!
//! One [`SelectionSession`] drives guard choice for one circuit-build
//! session. It walks a fixed sequence of states, each widening the set of
//! guards it is willing to try:
//!
//! ```text
//!   ┌───────────────┐  none left   ┌───────────┐  exhausted   ┌─────────────┐
//!   │ PrimaryGuards │─────────────►│ TryUtopic │─────────────►│ TryDystopic │
//!   └───────────────┘              └───────────┘              └──────┬──────┘
//!                                                                    │ exhausted
//!                                  ┌───────────┐  none left   ┌──────▼──────┐
//!                                  │ Exhausted │◄─────────────│  RetryOnly  │
//!                                  └───────────┘              └─────────────┘
//! ```
//!
//! | State | Candidates | Leaves when |
//! |-------|------------|-------------|
//! | `PrimaryGuards` | first `n_primary_guards` listed records, in order | none untried and live |
//! | `TryUtopic` | live untried records, store grown from the utopic pool | failover limit hit or nothing left |
//! | `TryDystopic` | same, over OR ports 80/443 | failover limit hit or nothing left |
//! | `RetryOnly` | listed records that failed, oldest attempt first | each offered once |
//!
//! Two rules cut across the sequence:
//!
//! - **Primary retry.** From `TryUtopic`, `TryDystopic` or `RetryOnly`, once
//!   a primary guard's last attempt is `primary_guards_retry_interval_secs`
//!   old, the session goes back to `PrimaryGuards`, offers it, and then
//!   resumes the state it left.
//! - **Try threshold.** When more than `guards_try_threshold` of the
//!   consensus guards were tried as new guards within the threshold window,
//!   the `Try*` states hand over to `RetryOnly` at once and no new primaries
//!   are sampled.
//!
//! The decision itself is the pure [`SelectionSession::transition`], which
//! returns an [`Action`] and the state to move to. [`SelectionSession::next_guard`]
//! carries the action out: it grows the store through the sampler or draws
//! uniformly from the candidates.
//!
//! # Exposure
//!
//! Candidate sets in the two `Try*` states are built by walking live records
//! in store order and stopping right after the first never-contacted one, so
//! no random choice ever sees more than one guard the client has not talked to.

use std::collections::{HashMap, HashSet};

use rand::Rng;
use tracing::{debug, info};

use crate::config::GuardsConfig;
use crate::consensus::ConsensusView;
use crate::error::{Error, Result};
use crate::live::{entry_is_live, live_guards, LiveFilter};
use crate::node_selection::{Pool, SampleConstraints, WeightedSampler};
use crate::store::{GuardRecord, GuardStore};

/// Where a session currently is in the fallback sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionState {
    /// Trying the ordered primary guards.
    PrimaryGuards,
    /// Trying live guards from the utopic pool.
    TryUtopic,
    /// Trying live guards reachable behind restrictive firewalls.
    TryDystopic,
    /// Re-offering guards that failed before.
    RetryOnly,
    /// Nothing left to try.
    Exhausted,
}

impl std::fmt::Display for SelectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SelectionState::PrimaryGuards => "primary",
            SelectionState::TryUtopic => "utopic",
            SelectionState::TryDystopic => "dystopic",
            SelectionState::RetryOnly => "retry-only",
            SelectionState::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

impl SelectionState {
    fn pool(self) -> Option<Pool> {
        match self {
            SelectionState::TryUtopic => Some(Pool::Utopic),
            SelectionState::TryDystopic => Some(Pool::Dystopic),
            _ => None,
        }
    }
}

/// What the session should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Pick one of these fingerprints uniformly at random.
    Choose(Vec<String>),
    /// Add a guard from this pool to the store, then decide again.
    Grow(Pool),
    /// Move to the returned state without trying anything.
    Advance,
}

/// Per-session selection parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionParams {
    /// Size of the primary prefix.
    pub n_primary_guards: usize,
    /// Live guards wanted before choosing at random.
    pub num_needed: usize,
    /// The circuit is for directory fetches.
    pub need_dir: bool,
    /// Fraction of a pool that may be tried per state.
    pub failover_threshold: f64,
    /// Weight floor for newly sampled guards.
    pub min_bandwidth: u64,
    /// Require Stable on newly sampled guards.
    pub require_stable: bool,
    /// Seconds before a failed primary guard is due for another attempt.
    pub primary_retry_interval: i64,
    /// Fraction of consensus guards that may be tried new per window.
    pub try_threshold: f64,
    /// Length of the new-guard window in seconds.
    pub try_window: i64,
}

impl SelectionParams {
    /// Parameters for an ordinary or a directory session.
    pub fn from_config(config: &GuardsConfig, need_dir: bool) -> Self {
        Self {
            n_primary_guards: config.n_primary_guards,
            num_needed: if need_dir {
                config.num_dir_needed
            } else {
                config.num_needed
            },
            need_dir,
            failover_threshold: config.guards_failover_threshold,
            min_bandwidth: config.min_bandwidth,
            require_stable: config.require_stable,
            primary_retry_interval: config.primary_guards_retry_interval_secs as i64,
            try_threshold: config.guards_try_threshold,
            try_window: config.guards_try_threshold_window_secs as i64,
        }
    }

    /// Attempts allowed in one `Try*` state for a pool of `pool_size` relays.
    pub fn failover_limit(&self, pool_size: usize) -> usize {
        ((self.failover_threshold * pool_size as f64).ceil() as usize).max(1)
    }

    /// New guards that may be tried per window for `guard_count` consensus guards.
    pub fn new_guard_limit(&self, guard_count: usize) -> usize {
        ((self.try_threshold * guard_count as f64).ceil() as usize).max(1)
    }

    /// Returns true once more new guards were tried in the window than
    /// [`new_guard_limit`](Self::new_guard_limit) allows.
    pub fn new_guard_budget_spent(&self, store: &GuardStore, view: &ConsensusView, now: i64) -> bool {
        store.new_guards_tried_since(now - self.try_window) > self.new_guard_limit(view.guard_count())
    }

    fn constraints(&self, pool: Pool, exclude: HashSet<String>) -> SampleConstraints {
        SampleConstraints {
            need_dir_cache: self.need_dir,
            min_bandwidth: self.min_bandwidth,
            require_stable: self.require_stable,
            pool,
            exclude,
        }
    }

    fn is_primary_eligible(&self, record: &GuardRecord) -> bool {
        record.listed && (!self.need_dir || record.is_dir_cache)
    }
}

/// Primary guards: the first `n_primary_guards` eligible records in store order.
pub fn primary_guards<'a>(store: &'a GuardStore, params: &SelectionParams) -> Vec<&'a GuardRecord> {
    store
        .all()
        .iter()
        .filter(|g| params.is_primary_eligible(g))
        .take(params.n_primary_guards)
        .collect()
}

/// Tops the store up to `n_primary_guards` primary-eligible records.
///
/// Draws from the utopic pool through the relaxation ladder. Returns the
/// number of guards added. Nothing is added while the new-guard budget is
/// spent.
///
/// # Errors
///
/// Returns [`Error::NoEligibleGuards`] only if sampling left the store empty.
pub fn repair_primaries<R: Rng + ?Sized>(
    store: &mut GuardStore,
    view: &ConsensusView,
    sampler: &WeightedSampler,
    params: &SelectionParams,
    rng: &mut R,
    now: i64,
) -> Result<usize> {
    let mut added = 0;
    while primary_guards(store, params).len() < params.n_primary_guards {
        if params.new_guard_budget_spent(store, view, now) {
            debug!("new-guard budget spent, not adding primary guards");
            return Ok(added);
        }
        let constraints = params.constraints(Pool::Utopic, store.fingerprints());
        let entry = match sampler.sample_with_relaxation(view, &constraints, rng) {
            Ok(entry) => entry,
            Err(Error::NoEligibleGuards) => break,
            Err(e) => return Err(e),
        };
        let record = GuardRecord::from_entry(entry, now);
        let counts = params.is_primary_eligible(&record);
        info!(guard = %record.fingerprint, "added guard to primary set");
        store.add(record)?;
        added += 1;
        if !counts {
            break;
        }
    }

    if store.size() == 0 {
        return Err(Error::NoEligibleGuards);
    }
    Ok(added)
}

/// Transient state of one circuit-build session.
#[derive(Debug, Clone)]
pub struct SelectionSession {
    params: SelectionParams,
    state: SelectionState,
    tried: HashSet<String>,
    retried: HashSet<String>,
    attempts: HashMap<SelectionState, usize>,
    growth_failed: HashSet<Pool>,
    visited: Vec<SelectionState>,
    offered_at: HashMap<String, i64>,
    resume: Option<SelectionState>,
}

impl SelectionSession {
    /// Creates a session in `PrimaryGuards`.
    pub fn new(params: SelectionParams) -> Self {
        Self {
            params,
            state: SelectionState::PrimaryGuards,
            tried: HashSet::new(),
            retried: HashSet::new(),
            attempts: HashMap::new(),
            growth_failed: HashSet::new(),
            visited: vec![SelectionState::PrimaryGuards],
            offered_at: HashMap::new(),
            resume: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> SelectionState {
        self.state
    }

    /// States entered so far, in order.
    pub fn visited(&self) -> &[SelectionState] {
        &self.visited
    }

    /// Fingerprints offered this session.
    pub fn tried(&self) -> &HashSet<String> {
        &self.tried
    }

    /// Session parameters.
    pub fn params(&self) -> &SelectionParams {
        &self.params
    }

    /// Attempts made in `state`.
    pub fn attempts_in(&self, state: SelectionState) -> usize {
        self.attempts.get(&state).copied().unwrap_or(0)
    }

    /// Decides the next action from the current state at time `now`. Pure.
    pub fn transition(
        &self,
        store: &GuardStore,
        view: &ConsensusView,
        sampler: &WeightedSampler,
        now: i64,
    ) -> (Action, SelectionState) {
        if matches!(
            self.state,
            SelectionState::TryUtopic | SelectionState::TryDystopic | SelectionState::RetryOnly
        ) && self.any_primary_due(store, view, now)
        {
            return (Action::Advance, SelectionState::PrimaryGuards);
        }

        match self.state {
            SelectionState::PrimaryGuards => {
                let next = primary_guards(store, &self.params).into_iter().find(|g| {
                    (!self.tried.contains(&g.fingerprint) && entry_is_live(g, view))
                        || self.primary_is_due(g, view, now)
                });
                match next {
                    Some(g) => (
                        Action::Choose(vec![g.fingerprint.clone()]),
                        SelectionState::PrimaryGuards,
                    ),
                    None => (
                        Action::Advance,
                        self.resume.unwrap_or(SelectionState::TryUtopic),
                    ),
                }
            }
            SelectionState::TryUtopic | SelectionState::TryDystopic => {
                let pool = self.state.pool().unwrap_or_default();
                let next = if self.state == SelectionState::TryUtopic {
                    SelectionState::TryDystopic
                } else {
                    SelectionState::RetryOnly
                };

                if self.params.new_guard_budget_spent(store, view, now) {
                    return (Action::Advance, SelectionState::RetryOnly);
                }

                let limit = self.params.failover_limit(sampler.pool_size(view, pool));
                if self.attempts_in(self.state) >= limit {
                    return (Action::Advance, next);
                }

                let candidates = self.exposure_candidates(store, view, sampler, pool);
                let has_new = candidates.iter().any(|g| !g.made_contact);
                if !candidates.is_empty() && (has_new || candidates.len() >= self.params.num_needed)
                {
                    return (Action::Choose(fingerprints(&candidates)), self.state);
                }
                if !self.growth_failed.contains(&pool) {
                    return (Action::Grow(pool), self.state);
                }
                if !candidates.is_empty() {
                    return (Action::Choose(fingerprints(&candidates)), self.state);
                }
                (Action::Advance, next)
            }
            SelectionState::RetryOnly => match self.retry_candidates(store, view).first() {
                Some(g) => (
                    Action::Choose(vec![g.fingerprint.clone()]),
                    SelectionState::RetryOnly,
                ),
                None => (Action::Advance, SelectionState::Exhausted),
            },
            SelectionState::Exhausted => (Action::Advance, SelectionState::Exhausted),
        }
    }

    /// A primary is due once its last attempt, in the store or in this
    /// session, is at least the retry interval old.
    fn primary_is_due(&self, record: &GuardRecord, view: &ConsensusView, now: i64) -> bool {
        if !record.listed || !view.is_listed_guard(&record.fingerprint) {
            return false;
        }
        let offered = self.offered_at.get(&record.fingerprint).copied();
        match record.last_tried_at.max(offered) {
            Some(last) => now - last >= self.params.primary_retry_interval,
            None => false,
        }
    }

    fn any_primary_due(&self, store: &GuardStore, view: &ConsensusView, now: i64) -> bool {
        primary_guards(store, &self.params)
            .into_iter()
            .any(|g| self.primary_is_due(g, view, now))
    }

    /// Live, untried records of `pool` in store order, cut right after the
    /// first never-contacted record or at `num_needed`.
    fn exposure_candidates<'a>(
        &self,
        store: &'a GuardStore,
        view: &ConsensusView,
        sampler: &WeightedSampler,
        pool: Pool,
    ) -> Vec<&'a GuardRecord> {
        let filter = LiveFilter {
            need_dir: self.params.need_dir,
            pool: Some(pool),
        };
        let mut out = Vec::new();
        for g in live_guards(store, view, &filter, sampler.policy()) {
            if self.tried.contains(&g.fingerprint) {
                continue;
            }
            out.push(g);
            if !g.made_contact || out.len() >= self.params.num_needed {
                break;
            }
        }
        out
    }

    /// Listed records that failed earlier, oldest attempt first.
    fn retry_candidates<'a>(
        &self,
        store: &'a GuardStore,
        view: &ConsensusView,
    ) -> Vec<&'a GuardRecord> {
        let mut out: Vec<&GuardRecord> = store
            .all()
            .iter()
            .filter(|g| g.listed && view.is_listed_guard(&g.fingerprint))
            .filter(|g| !self.params.need_dir || g.is_dir_cache)
            .filter(|g| !self.retried.contains(&g.fingerprint))
            .filter(|g| self.tried.contains(&g.fingerprint) || g.offline_since.is_some())
            .collect();
        out.sort_by_key(|g| g.last_tried_at);
        out
    }

    fn enter(&mut self, state: SelectionState) {
        if state != self.state {
            debug!(from = %self.state, to = %state, "guard selection state change");
            if state == SelectionState::PrimaryGuards {
                self.resume = Some(self.state);
            } else if self.state == SelectionState::PrimaryGuards {
                self.resume = None;
            }
            self.state = state;
            self.visited.push(state);
        }
    }

    /// Returns the next guard to attempt, growing the store when needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoUsableGuard`] once every state is exhausted.
    pub fn next_guard<R: Rng + ?Sized>(
        &mut self,
        store: &mut GuardStore,
        view: &ConsensusView,
        sampler: &WeightedSampler,
        rng: &mut R,
        now: i64,
    ) -> Result<String> {
        loop {
            let (action, next) = self.transition(store, view, sampler, now);
            match action {
                Action::Choose(candidates) => {
                    let fp = candidates[rng.gen_range(0..candidates.len())].clone();
                    *self.attempts.entry(self.state).or_insert(0) += 1;
                    match self.state {
                        SelectionState::RetryOnly => {
                            self.retried.insert(fp.clone());
                        }
                        SelectionState::PrimaryGuards => {
                            self.offered_at.insert(fp.clone(), now);
                        }
                        _ => {}
                    }
                    self.tried.insert(fp.clone());
                    debug!(guard = %fp, state = %self.state, "offering guard");
                    return Ok(fp);
                }
                Action::Grow(pool) => self.grow(store, view, sampler, pool, rng, now)?,
                Action::Advance => {
                    self.enter(next);
                    if next == SelectionState::Exhausted {
                        return Err(Error::NoUsableGuard);
                    }
                }
            }
        }
    }

    fn grow<R: Rng + ?Sized>(
        &mut self,
        store: &mut GuardStore,
        view: &ConsensusView,
        sampler: &WeightedSampler,
        pool: Pool,
        rng: &mut R,
        now: i64,
    ) -> Result<()> {
        let mut exclude = store.fingerprints();
        exclude.extend(self.tried.iter().cloned());
        let constraints = self.params.constraints(pool, exclude);

        match sampler.sample_with_relaxation(view, &constraints, rng) {
            Ok(entry) => {
                let record = GuardRecord::from_entry(entry, now);
                if self.params.need_dir && !record.is_dir_cache {
                    // Usable for ordinary circuits only; stop growing this pool.
                    self.growth_failed.insert(pool);
                }
                info!(guard = %record.fingerprint, %pool, "sampled new guard");
                store.add(record)
            }
            Err(Error::NoEligibleGuards) => {
                debug!(%pool, "no guard left to sample");
                self.growth_failed.insert(pool);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn fingerprints(records: &[&GuardRecord]) -> Vec<String> {
    records.iter().map(|g| g.fingerprint.clone()).collect()
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::consensus::ConsensusEntry;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn choose_sets_hold_at_most_one_new_guard(
            guards in prop::collection::vec((any::<bool>(), any::<bool>(), any::<bool>()), 1..20),
            num_needed in 1usize..6,
            seed in any::<u64>(),
        ) {
            let mut entries = Vec::new();
            let mut store = GuardStore::new();
            for (i, (contacted, dystopic, down)) in guards.iter().enumerate() {
                let port = if *dystopic { 443 } else { 9001 };
                let e = ConsensusEntry::guard(&format!("{:040X}", i + 1), "192.0.2.1".parse().unwrap(), port, 10);
                let mut r = GuardRecord::from_entry(&e, 0);
                r.made_contact = *contacted;
                if *down {
                    r.last_tried_at = Some(1);
                    r.offline_since = Some(1);
                }
                store.add(r).unwrap();
                entries.push(e);
            }
            let view = ConsensusView::new(entries).unwrap();
            let sampler = WeightedSampler::default();
            let mut p = SelectionParams::from_config(&GuardsConfig::default(), false);
            p.num_needed = num_needed;
            let mut session = SelectionSession::new(p);
            let mut rng = StdRng::seed_from_u64(seed);

            for _ in 0..64 {
                let (action, _) = session.transition(&store, &view, &sampler, 2);
                if let Action::Choose(set) = &action {
                    let fresh = set
                        .iter()
                        .filter(|fp| store.get(fp).is_some_and(|g| !g.made_contact))
                        .count();
                    prop_assert!(fresh <= 1);
                }
                if session.next_guard(&mut store, &view, &sampler, &mut rng, 2).is_err() {
                    break;
                }
            }
        }
    }
}
