//! Connection outcome handling.
//!
//! Every connection attempt, whatever state it was made from, feeds its
//! result back into the store here. The rules distinguish guards the client
//! has talked to before from guards it has not:
//!
//! | Contacted before | Result | Effect |
//! |------------------|--------|--------|
//! | no | success | `made_contact` set; `offline_since` cleared on *every* record |
//! | no | failure | record removed |
//! | yes | success | own `offline_since` cleared |
//! | yes | failure | `offline_since = now` unless already set |
//!
//! `last_tried_at` is stamped on every attempt. Clearing every other
//! record's `offline_since` on a first contact is the network-down
//! heuristic: if a brand-new guard answers, earlier failures were more
//! likely local than the guards' fault.
//!
//! Either result on a never-contacted guard is also logged in the store's
//! new-guard try log, which bounds how many new guards a client may try in
//! a window.

use tracing::{debug, info};

use crate::store::GuardStore;

/// What applying one outcome did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeEffect {
    /// The fingerprint is no longer stored; nothing changed.
    Ignored,
    /// First-ever success; `cleared` other records came back online.
    FirstContact {
        /// Records whose `offline_since` was cleared.
        cleared: usize,
    },
    /// First-ever failure; the record was removed.
    Removed,
    /// A known guard answered again.
    Reachable,
    /// A known guard failed and is marked offline.
    MarkedOffline,
}

/// Applies one connection result to the store.
///
/// ```rust
/// use entry_guards_rs::consensus::ConsensusEntry;
/// use entry_guards_rs::outcome::{apply_outcome, OutcomeEffect};
/// use entry_guards_rs::store::{GuardRecord, GuardStore};
///
/// let entry = ConsensusEntry::guard(&"AB".repeat(20), "192.0.2.1".parse().unwrap(), 9001, 1);
/// let mut store = GuardStore::new();
/// store.add(GuardRecord::from_entry(&entry, 0)).unwrap();
///
/// assert_eq!(apply_outcome(&mut store, &entry.fingerprint, false, 10), OutcomeEffect::Removed);
/// assert_eq!(store.size(), 0);
/// ```
pub fn apply_outcome(store: &mut GuardStore, fingerprint: &str, success: bool, now: i64) -> OutcomeEffect {
    let made_contact = match store.get(fingerprint) {
        Some(g) => g.made_contact,
        None => {
            debug!(guard = fingerprint, "outcome for guard no longer stored");
            return OutcomeEffect::Ignored;
        }
    };

    if !made_contact {
        store.record_new_guard_try(fingerprint, now);
    }

    match (made_contact, success) {
        (false, true) => {
            store.mark_contacted(fingerprint, now);
            let cleared = store.clear_offline_except(fingerprint);
            if cleared > 0 {
                info!(
                    guard = fingerprint,
                    cleared, "first contact with new guard, marking other guards as up"
                );
            }
            OutcomeEffect::FirstContact { cleared }
        }
        (false, false) => {
            store.remove(fingerprint);
            debug!(guard = fingerprint, "never-contacted guard failed, removed");
            OutcomeEffect::Removed
        }
        (true, true) => {
            store.mark_contacted(fingerprint, now);
            OutcomeEffect::Reachable
        }
        (true, false) => {
            store.mark_tried(fingerprint, now);
            store.mark_offline(fingerprint, now);
            OutcomeEffect::MarkedOffline
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ConsensusEntry;
    use crate::store::GuardRecord;

    fn fp(n: u8) -> String {
        format!("{:02X}", n).repeat(20)
    }

    fn store_of(n: u8) -> GuardStore {
        let mut store = GuardStore::new();
        for i in 1..=n {
            let e = ConsensusEntry::guard(&fp(i), "192.0.2.1".parse().unwrap(), 9001, 1);
            store.add(GuardRecord::from_entry(&e, 0)).unwrap();
        }
        store
    }

    #[test]
    fn test_first_contact_clears_all_offline() {
        let mut store = store_of(6);
        for n in 1..=5 {
            store.mark_contacted(&fp(n), 1);
            store.mark_offline(&fp(n), 2);
        }

        let effect = apply_outcome(&mut store, &fp(6), true, 10);
        assert_eq!(effect, OutcomeEffect::FirstContact { cleared: 5 });

        let six = store.get(&fp(6)).unwrap();
        assert!(six.made_contact);
        assert_eq!(six.last_tried_at, Some(10));
        assert!(store.all().iter().all(|g| g.offline_since.is_none()));
    }

    #[test]
    fn test_first_contact_on_offline_guard_clears_the_other_four() {
        let mut store = store_of(5);
        for n in 1..=5 {
            store.mark_tried(&fp(n), 1);
            store.mark_offline(&fp(n), 1);
        }
        apply_outcome(&mut store, &fp(3), true, 10);
        assert!(store.get(&fp(3)).unwrap().made_contact);
        assert!(store.all().iter().all(|g| g.offline_since.is_none()));
    }

    #[test]
    fn test_first_failure_removes() {
        let mut store = store_of(2);
        assert_eq!(apply_outcome(&mut store, &fp(1), false, 5), OutcomeEffect::Removed);
        assert!(!store.contains(&fp(1)));
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn test_known_guard_failure_keeps_first_offline_stamp() {
        let mut store = store_of(1);
        store.mark_contacted(&fp(1), 1);

        assert_eq!(apply_outcome(&mut store, &fp(1), false, 5), OutcomeEffect::MarkedOffline);
        assert_eq!(apply_outcome(&mut store, &fp(1), false, 9), OutcomeEffect::MarkedOffline);
        let g = store.get(&fp(1)).unwrap();
        assert_eq!(g.offline_since, Some(5));
        assert_eq!(g.last_tried_at, Some(9));
        assert!(store.contains(&fp(1)));

        assert_eq!(apply_outcome(&mut store, &fp(1), true, 12), OutcomeEffect::Reachable);
        assert_eq!(store.get(&fp(1)).unwrap().offline_since, None);
    }

    #[test]
    fn test_new_guard_attempts_are_logged() {
        let mut store = store_of(3);
        store.mark_contacted(&fp(3), 1);

        apply_outcome(&mut store, &fp(1), false, 5);
        apply_outcome(&mut store, &fp(2), true, 6);
        apply_outcome(&mut store, &fp(3), false, 7);
        apply_outcome(&mut store, &fp(2), false, 8);

        let logged: Vec<_> = store
            .new_guard_tries()
            .iter()
            .map(|t| (t.fingerprint.clone(), t.at))
            .collect();
        assert_eq!(logged, vec![(fp(1), 5), (fp(2), 6)]);
        assert_eq!(store.new_guards_tried_since(0), 2);
    }

    #[test]
    fn test_unknown_guard_ignored() {
        let mut store = store_of(1);
        let before = store.clone();
        assert_eq!(apply_outcome(&mut store, &fp(9), true, 5), OutcomeEffect::Ignored);
        assert_eq!(store, before);
    }
}
