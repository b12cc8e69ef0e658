//! Persistent guard store.
//!
//! The [`GuardStore`] holds the client's guards as an ordered list of
//! [`GuardRecord`]s. Order is meaningful: the first `n_primary_guards` listed
//! records are the primary guards, so it must survive every save and load.
//!
//! # Record Lifecycle
//!
//! ```text
//!   sampler draw ──► add() ──► [never contacted]
//!                                 │         │
//!                  first failure  │         │ first success
//!                  (removed)  ◄───┘         ▼
//!                                      [contacted] ◄──┐
//!                                         │           │ success clears
//!                                 failure │           │ offline_since
//!                                         ▼           │
//!                                  [offline_since] ───┘
//!                                         │
//!                  refresh: unlisted/offline/added ≥ 30 days ──► purged
//! ```
//!
//! # Persistence
//!
//! The store is saved as a Python pickle, written to a temporary file with
//! mode 0600, flushed, synced to disk and renamed over the old file. A missing
//! file loads as an empty store. A file that fails to parse or validate, or
//! that was written by a newer format revision, is reported as
//! [`Error::StoreCorrupt`] and never silently replaced. Timestamps more than
//! an hour ahead of the clock are pulled back to the current time on load.
//!
//! Besides the records, the store keeps a log of never-contacted guards that
//! were tried. The log outlives the records it names, since a new guard that
//! fails is removed at once, and it feeds the session's try threshold.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::consensus::ConsensusEntry;
use crate::error::{Error, Result};
use crate::node_selection::is_valid_fingerprint;

/// Clock skew tolerated when validating persisted timestamps.
const MAX_CLOCK_SKEW_SECS: i64 = 3600;

/// Format revision written into the state file.
pub const PICKLE_REVISION: u32 = 2;

/// One guard and its trial history.
///
/// All timestamps are Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardRecord {
    /// Upper-case hex identity fingerprint.
    pub fingerprint: String,
    /// OR address as last seen in the consensus.
    pub address: String,
    /// OR port as last seen in the consensus.
    pub or_port: u16,
    /// Serves directory data (V2Dir).
    pub is_dir_cache: bool,
    /// Carried the Guard flag in the last consensus that listed it.
    pub is_guard: bool,
    /// Listed as a guard in the current consensus.
    pub listed: bool,
    /// Guard-position bandwidth weight.
    pub bandwidth: u64,
    /// When the guard was added to the store.
    pub added_at: i64,
    /// Last connection attempt.
    pub last_tried_at: Option<i64>,
    /// At least one connection ever succeeded.
    pub made_contact: bool,
    /// A circuit was built through this guard.
    pub confirmed: bool,
    /// Start of the current run of failed attempts.
    pub offline_since: Option<i64>,
    /// Start of the current unlisted stretch.
    pub unlisted_since: Option<i64>,
}

impl GuardRecord {
    /// Creates a fresh, never-tried record from a consensus entry.
    pub fn from_entry(entry: &ConsensusEntry, now: i64) -> Self {
        Self {
            fingerprint: entry.fingerprint.clone(),
            address: entry.address.to_string(),
            or_port: entry.or_port,
            is_dir_cache: entry.is_dir_cache(),
            is_guard: entry.is_guard(),
            listed: entry.is_guard(),
            bandwidth: entry.weight,
            added_at: now,
            last_tried_at: None,
            made_contact: false,
            confirmed: false,
            offline_since: None,
            unlisted_since: None,
        }
    }

    /// Copies flags, weight and address from the consensus.
    pub fn sync_from(&mut self, entry: &ConsensusEntry) {
        self.address = entry.address.to_string();
        self.or_port = entry.or_port;
        self.is_dir_cache = entry.is_dir_cache();
        self.is_guard = entry.is_guard();
        self.bandwidth = entry.weight;
    }

    /// Socket address to connect to, if the stored address parses.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.address
            .parse()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.or_port))
    }

    /// Returns true if the guard has been tried and is currently marked offline.
    pub fn is_marked_down(&self) -> bool {
        self.offline_since.is_some() && self.last_tried_at.is_some()
    }
}

/// A connection attempt to a guard that had never been contacted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGuardTry {
    /// Guard attempted.
    pub fingerprint: String,
    /// When the attempt finished.
    pub at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    guards: Vec<GuardRecord>,
    #[serde(default)]
    new_guard_tries: Vec<NewGuardTry>,
    pickle_revision: u32,
}

/// Ordered set of guard records, unique by fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardStore {
    guards: Vec<GuardRecord>,
    new_guard_tries: Vec<NewGuardTry>,
}

impl GuardStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateGuard`] if the fingerprint is already stored.
    pub fn add(&mut self, record: GuardRecord) -> Result<()> {
        if self.contains(&record.fingerprint) {
            return Err(Error::DuplicateGuard(record.fingerprint));
        }
        self.guards.push(record);
        Ok(())
    }

    /// Removes a record, returning it if it was present.
    pub fn remove(&mut self, fingerprint: &str) -> Option<GuardRecord> {
        let pos = self.position(fingerprint)?;
        Some(self.guards.remove(pos))
    }

    /// Sets `offline_since` if not already set. Returns false if absent.
    pub fn mark_offline(&mut self, fingerprint: &str, when: i64) -> bool {
        self.update(fingerprint, |g| {
            g.offline_since.get_or_insert(when);
        })
    }

    /// Records a successful contact: `made_contact` set, `offline_since` cleared.
    pub fn mark_contacted(&mut self, fingerprint: &str, when: i64) -> bool {
        self.update(fingerprint, |g| {
            g.made_contact = true;
            g.offline_since = None;
            g.last_tried_at = Some(when);
        })
    }

    /// Marks the guard as used for a built circuit.
    pub fn mark_confirmed(&mut self, fingerprint: &str) -> bool {
        self.update(fingerprint, |g| g.confirmed = true)
    }

    /// Stamps `last_tried_at`.
    pub fn mark_tried(&mut self, fingerprint: &str, when: i64) -> bool {
        self.update(fingerprint, |g| g.last_tried_at = Some(when))
    }

    /// Clears `offline_since` on every record except `fingerprint`.
    ///
    /// Returns the number of records changed.
    pub fn clear_offline_except(&mut self, fingerprint: &str) -> usize {
        let mut cleared = 0;
        for g in self.guards.iter_mut() {
            if g.fingerprint != fingerprint && g.offline_since.take().is_some() {
                cleared += 1;
            }
        }
        cleared
    }

    /// All records in store order.
    pub fn all(&self) -> &[GuardRecord] {
        &self.guards
    }

    /// Mutable access to all records, in order. Fingerprints must not change.
    pub(crate) fn records_mut(&mut self) -> impl Iterator<Item = &mut GuardRecord> {
        self.guards.iter_mut()
    }

    /// Keeps only records matching `keep`, preserving order.
    pub fn retain<F: FnMut(&GuardRecord) -> bool>(&mut self, keep: F) {
        self.guards.retain(keep);
    }

    /// Number of records.
    pub fn size(&self) -> usize {
        self.guards.len()
    }

    /// Looks up a record.
    pub fn get(&self, fingerprint: &str) -> Option<&GuardRecord> {
        self.guards.iter().find(|g| g.fingerprint == fingerprint)
    }

    /// Returns true if the fingerprint is stored.
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.position(fingerprint).is_some()
    }

    /// Stored fingerprints.
    pub fn fingerprints(&self) -> HashSet<String> {
        self.guards.iter().map(|g| g.fingerprint.clone()).collect()
    }

    /// Logs an attempt on a never-contacted guard.
    pub fn record_new_guard_try(&mut self, fingerprint: &str, at: i64) {
        self.new_guard_tries.push(NewGuardTry {
            fingerprint: fingerprint.to_string(),
            at,
        });
    }

    /// Distinct never-contacted guards tried after `since`.
    pub fn new_guards_tried_since(&self, since: i64) -> usize {
        self.new_guard_tries
            .iter()
            .filter(|t| t.at > since)
            .map(|t| t.fingerprint.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Drops log entries at or before `before`. Returns how many were dropped.
    pub fn prune_new_guard_tries(&mut self, before: i64) -> usize {
        let len = self.new_guard_tries.len();
        self.new_guard_tries.retain(|t| t.at > before);
        len - self.new_guard_tries.len()
    }

    /// The new-guard try log, oldest first.
    pub fn new_guard_tries(&self) -> &[NewGuardTry] {
        &self.new_guard_tries
    }

    fn position(&self, fingerprint: &str) -> Option<usize> {
        self.guards.iter().position(|g| g.fingerprint == fingerprint)
    }

    fn update<F: FnOnce(&mut GuardRecord)>(&mut self, fingerprint: &str, f: F) -> bool {
        match self.guards.iter_mut().find(|g| g.fingerprint == fingerprint) {
            Some(g) => {
                f(g);
                true
            }
            None => false,
        }
    }

    /// Loads a store from a pickle file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreCorrupt`] if the file does not parse, carries a
    /// newer `pickle_revision`, or fails [`validate`](Self::validate).
    /// Returns [`Error::Io`] if an existing file cannot be opened.
    pub fn load(path: &Path, now: i64) -> Result<Self> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(Error::Io(e)),
        };
        let state: PersistedState =
            serde_pickle::from_reader(BufReader::new(file), Default::default())
                .map_err(|e| Error::StoreCorrupt(format!("cannot parse state file: {}", e)))?;

        if state.pickle_revision > PICKLE_REVISION {
            return Err(Error::StoreCorrupt(format!(
                "state file revision {} is newer than supported revision {}",
                state.pickle_revision, PICKLE_REVISION
            )));
        }

        let mut store = Self {
            guards: state.guards,
            new_guard_tries: state.new_guard_tries,
        };
        let clamped = store.clamp_future_timestamps(now);
        if clamped > 0 {
            warn!(
                clamped,
                path = %path.display(),
                "state file has timestamps ahead of the clock; using current time"
            );
        }
        store.validate(now)?;
        Ok(store)
    }

    /// Pulls timestamps more than the tolerated skew past `now` back to `now`.
    ///
    /// Returns the number of timestamps changed.
    pub fn clamp_future_timestamps(&mut self, now: i64) -> usize {
        let max_timestamp = now + MAX_CLOCK_SKEW_SECS;
        let mut clamped = 0;
        let mut clamp = |t: &mut i64| {
            if *t > max_timestamp {
                *t = now;
                clamped += 1;
            }
        };

        for g in self.guards.iter_mut() {
            clamp(&mut g.added_at);
            for t in [
                &mut g.last_tried_at,
                &mut g.offline_since,
                &mut g.unlisted_since,
            ]
            .into_iter()
            .flatten()
            {
                clamp(t);
            }
        }
        for t in self.new_guard_tries.iter_mut() {
            clamp(&mut t.at);
        }
        clamped
    }

    /// Checks fingerprints, uniqueness and timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreCorrupt`] naming the first bad record.
    pub fn validate(&self, now: i64) -> Result<()> {
        let max_timestamp = now + MAX_CLOCK_SKEW_SECS;
        let mut seen = HashSet::new();

        for g in &self.guards {
            if !is_valid_fingerprint(&g.fingerprint) || g.fingerprint != g.fingerprint.to_uppercase()
            {
                return Err(Error::StoreCorrupt(format!(
                    "invalid fingerprint: {}",
                    g.fingerprint
                )));
            }
            if !seen.insert(g.fingerprint.as_str()) {
                return Err(Error::StoreCorrupt(format!(
                    "duplicate guard {}",
                    g.fingerprint
                )));
            }
            let stamps = [
                Some(g.added_at),
                g.last_tried_at,
                g.offline_since,
                g.unlisted_since,
            ];
            if stamps.iter().flatten().any(|&t| t < 0 || t > max_timestamp) {
                return Err(Error::StoreCorrupt(format!(
                    "implausible timestamp on guard {}",
                    g.fingerprint
                )));
            }
        }
        if self
            .new_guard_tries
            .iter()
            .any(|t| t.at < 0 || t.at > max_timestamp)
        {
            return Err(Error::StoreCorrupt(
                "implausible timestamp in new-guard try log".to_string(),
            ));
        }
        Ok(())
    }

    /// Writes the store atomically with owner-only permissions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if any step of the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        #[cfg(unix)]
        let file = {
            use std::os::unix::fs::OpenOptionsExt;
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&temp_path)?
        };

        #[cfg(not(unix))]
        let file = File::create(&temp_path)?;

        let state = PersistedState {
            guards: self.guards.clone(),
            new_guard_tries: self.new_guard_tries.clone(),
            pickle_revision: PICKLE_REVISION,
        };

        let mut writer = BufWriter::new(file);
        serde_pickle::to_writer(&mut writer, &state, Default::default())
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(n: u8) -> GuardRecord {
        let entry = ConsensusEntry::guard(
            &format!("{:02X}", n).repeat(20),
            "192.0.2.1".parse().unwrap(),
            9001,
            100,
        );
        GuardRecord::from_entry(&entry, 1_000)
    }

    #[test]
    fn test_add_rejects_duplicate() {
        let mut store = GuardStore::new();
        store.add(record(1)).unwrap();
        let err = store.add(record(1)).unwrap_err();
        assert!(matches!(err, Error::DuplicateGuard(fp) if fp == "01".repeat(20)));
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn test_remove_preserves_order() {
        let mut store = GuardStore::new();
        for n in 1..=3 {
            store.add(record(n)).unwrap();
        }
        assert!(store.remove(&"02".repeat(20)).is_some());
        assert!(store.remove(&"02".repeat(20)).is_none());
        let fps: Vec<_> = store.all().iter().map(|g| g.fingerprint.clone()).collect();
        assert_eq!(fps, vec!["01".repeat(20), "03".repeat(20)]);
    }

    #[test]
    fn test_mark_offline_keeps_first_timestamp() {
        let mut store = GuardStore::new();
        store.add(record(1)).unwrap();
        let fp = "01".repeat(20);
        assert!(store.mark_offline(&fp, 50));
        assert!(store.mark_offline(&fp, 90));
        assert_eq!(store.get(&fp).unwrap().offline_since, Some(50));
        assert!(!store.mark_offline(&"FF".repeat(20), 50));
    }

    #[test]
    fn test_mark_contacted_clears_offline() {
        let mut store = GuardStore::new();
        store.add(record(1)).unwrap();
        let fp = "01".repeat(20);
        store.mark_offline(&fp, 50);
        store.mark_contacted(&fp, 60);
        let g = store.get(&fp).unwrap();
        assert!(g.made_contact);
        assert_eq!(g.offline_since, None);
        assert_eq!(g.last_tried_at, Some(60));

        store.mark_confirmed(&fp);
        assert!(store.get(&fp).unwrap().confirmed);
    }

    #[test]
    fn test_clear_offline_except() {
        let mut store = GuardStore::new();
        for n in 1..=4 {
            store.add(record(n)).unwrap();
            store.mark_offline(&format!("{:02X}", n).repeat(20), 10);
        }
        let keep = "03".repeat(20);
        assert_eq!(store.clear_offline_except(&keep), 3);
        for g in store.all() {
            assert_eq!(g.offline_since.is_some(), g.fingerprint == keep);
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guards.state");

        let mut store = GuardStore::new();
        for n in [5, 1, 9] {
            store.add(record(n)).unwrap();
        }
        store.mark_offline(&"01".repeat(20), 500);
        store.mark_tried(&"01".repeat(20), 500);
        store.record_new_guard_try(&"07".repeat(20), 450);
        store.save(&path).unwrap();

        let loaded = GuardStore::load(&path, 2_000).unwrap();
        assert_eq!(loaded, store);
        assert!(!path.with_extension("tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_save_uses_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("guards.state");
        GuardStore::new().save(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = GuardStore::load(&dir.path().join("absent.state"), 0).unwrap();
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_load_garbage_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guards.state");
        std::fs::write(&path, b"definitely not a pickle").unwrap();
        assert!(matches!(
            GuardStore::load(&path, 0),
            Err(Error::StoreCorrupt(_))
        ));
    }

    #[test]
    fn test_load_duplicate_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guards.state");
        let state = PersistedState {
            guards: vec![record(1), record(1)],
            new_guard_tries: Vec::new(),
            pickle_revision: PICKLE_REVISION,
        };
        let bytes = serde_pickle::to_vec(&state, Default::default()).unwrap();
        std::fs::write(&path, bytes).unwrap();

        let err = GuardStore::load(&path, 2_000).unwrap_err();
        assert!(matches!(err, Error::StoreCorrupt(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn test_validate_rejects_future_timestamp() {
        let mut store = GuardStore::new();
        let mut r = record(1);
        r.added_at = 10_000_000;
        store.add(r).unwrap();
        assert!(matches!(store.validate(1_000), Err(Error::StoreCorrupt(_))));
    }

    #[test]
    fn test_load_newer_revision_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guards.state");
        let state = PersistedState {
            guards: vec![record(1)],
            new_guard_tries: Vec::new(),
            pickle_revision: PICKLE_REVISION + 1,
        };
        let bytes = serde_pickle::to_vec(&state, Default::default()).unwrap();
        std::fs::write(&path, bytes).unwrap();

        let err = GuardStore::load(&path, 2_000).unwrap_err();
        assert!(matches!(err, Error::StoreCorrupt(msg) if msg.contains("revision")));
    }

    #[test]
    fn test_load_accepts_older_revision_without_try_log() {
        #[derive(Serialize)]
        struct FirstRevision {
            guards: Vec<GuardRecord>,
            pickle_revision: u32,
        }

        let dir = tempdir().unwrap();
        let path = dir.path().join("guards.state");
        let state = FirstRevision {
            guards: vec![record(1)],
            pickle_revision: 1,
        };
        let bytes = serde_pickle::to_vec(&state, Default::default()).unwrap();
        std::fs::write(&path, bytes).unwrap();

        let store = GuardStore::load(&path, 2_000).unwrap();
        assert_eq!(store.size(), 1);
        assert!(store.new_guard_tries().is_empty());
    }

    #[test]
    fn test_load_clamps_future_timestamps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guards.state");

        let mut store = GuardStore::new();
        let mut r = record(1);
        r.added_at = 10_000_000;
        r.last_tried_at = Some(10_000_100);
        r.offline_since = Some(1_500);
        store.add(r).unwrap();
        store.record_new_guard_try(&"02".repeat(20), 9_000_000);
        store.save(&path).unwrap();

        let loaded = GuardStore::load(&path, 2_000).unwrap();
        let g = loaded.get(&"01".repeat(20)).unwrap();
        assert_eq!(g.added_at, 2_000);
        assert_eq!(g.last_tried_at, Some(2_000));
        assert_eq!(g.offline_since, Some(1_500));
        assert_eq!(loaded.new_guard_tries()[0].at, 2_000);
    }

    #[test]
    fn test_load_negative_timestamp_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guards.state");
        let mut store = GuardStore::new();
        let mut r = record(1);
        r.added_at = -5;
        store.add(r).unwrap();
        store.save(&path).unwrap();
        assert!(matches!(
            GuardStore::load(&path, 2_000),
            Err(Error::StoreCorrupt(_))
        ));
    }

    #[test]
    fn test_new_guard_tries_count_distinct_in_window() {
        let mut store = GuardStore::new();
        store.record_new_guard_try(&"01".repeat(20), 100);
        store.record_new_guard_try(&"02".repeat(20), 200);
        store.record_new_guard_try(&"02".repeat(20), 250);
        store.record_new_guard_try(&"03".repeat(20), 300);

        assert_eq!(store.new_guards_tried_since(0), 3);
        assert_eq!(store.new_guards_tried_since(150), 2);
        assert_eq!(store.new_guards_tried_since(300), 0);

        assert_eq!(store.prune_new_guard_tries(200), 2);
        assert_eq!(store.new_guard_tries().len(), 2);
        assert_eq!(store.new_guards_tried_since(0), 2);
    }

    #[test]
    fn test_validate_rejects_bad_fingerprint() {
        let mut store = GuardStore::new();
        let mut r = record(1);
        r.fingerprint = "XYZ".to_string();
        store.add(r).unwrap();
        assert!(matches!(store.validate(2_000), Err(Error::StoreCorrupt(_))));
    }

    #[test]
    fn test_socket_addr() {
        let r = record(1);
        assert_eq!(
            r.socket_addr(),
            Some("192.0.2.1:9001".parse().unwrap())
        );
        let mut bad = r.clone();
        bad.address = "nowhere".to_string();
        assert_eq!(bad.socket_addr(), None);
    }
}
