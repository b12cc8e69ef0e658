//! Live-set filtering.
//!
//! A stored guard is *live* when it is listed, carries the Guard flag in the
//! current consensus, and is not currently marked down. "Marked down" means it has been
//! tried and carries an `offline_since` stamp; a guard that was never tried
//! is live even if it has never been contacted.
//!
//! Everything here is pure and recomputed on every selection call.

use crate::consensus::ConsensusView;
use crate::node_selection::{Pool, PoolPolicy};
use crate::store::{GuardRecord, GuardStore};

/// Extra restrictions applied on top of liveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveFilter {
    /// Keep only directory caches.
    pub need_dir: bool,
    /// Keep only members of this pool.
    pub pool: Option<Pool>,
}

/// Returns true if the record is usable right now.
pub fn entry_is_live(record: &GuardRecord, view: &ConsensusView) -> bool {
    record.listed && view.is_listed_guard(&record.fingerprint) && !record.is_marked_down()
}

/// Live records passing `filter`, in store order.
pub fn live_guards<'a>(
    store: &'a GuardStore,
    view: &ConsensusView,
    filter: &LiveFilter,
    policy: &PoolPolicy,
) -> Vec<&'a GuardRecord> {
    store
        .all()
        .iter()
        .filter(|g| entry_is_live(g, view))
        .filter(|g| !filter.need_dir || g.is_dir_cache)
        .filter(|g| filter.pool.map_or(true, |p| policy.in_pool(g.or_port, p)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ConsensusEntry;

    fn fp(n: u8) -> String {
        format!("{:02X}", n).repeat(20)
    }

    fn setup(ports: &[u16]) -> (GuardStore, ConsensusView) {
        let mut entries = Vec::new();
        let mut store = GuardStore::new();
        for (i, port) in ports.iter().enumerate() {
            let e = ConsensusEntry::guard(&fp(i as u8 + 1), "192.0.2.1".parse().unwrap(), *port, 10);
            store.add(GuardRecord::from_entry(&e, 0)).unwrap();
            entries.push(e);
        }
        (store, ConsensusView::new(entries).unwrap())
    }

    #[test]
    fn test_never_tried_is_live() {
        let (store, view) = setup(&[9001]);
        let live = live_guards(&store, &view, &LiveFilter::default(), &PoolPolicy::default());
        assert_eq!(live.len(), 1);
    }

    #[test]
    fn test_tried_and_offline_is_not_live() {
        let (mut store, view) = setup(&[9001, 9001]);
        store.mark_tried(&fp(1), 10);
        store.mark_offline(&fp(1), 10);
        // offline without a recorded attempt stays live
        store.mark_offline(&fp(2), 10);

        let live = live_guards(&store, &view, &LiveFilter::default(), &PoolPolicy::default());
        let fps: Vec<_> = live.iter().map(|g| g.fingerprint.clone()).collect();
        assert_eq!(fps, vec![fp(2)]);
    }

    #[test]
    fn test_unlisted_or_absent_is_not_live() {
        let (mut store, view) = setup(&[9001]);
        let e = ConsensusEntry::guard(&fp(9), "192.0.2.9".parse().unwrap(), 9001, 1);
        store.add(GuardRecord::from_entry(&e, 0)).unwrap();
        assert!(!entry_is_live(store.get(&fp(9)).unwrap(), &view));

        store.records_mut().for_each(|g| g.listed = false);
        assert!(live_guards(&store, &view, &LiveFilter::default(), &PoolPolicy::default()).is_empty());
    }

    #[test]
    fn test_relay_without_guard_flag_is_not_live() {
        let (store, _) = setup(&[9001]);
        let mut demoted = ConsensusEntry::guard(&fp(1), "192.0.2.1".parse().unwrap(), 9001, 10);
        demoted.flags.retain(|f| f != "Guard");
        let view = ConsensusView::new(vec![demoted]).unwrap();

        assert!(store.get(&fp(1)).unwrap().listed);
        assert!(!entry_is_live(store.get(&fp(1)).unwrap(), &view));
    }

    #[test]
    fn test_pool_and_dir_filters() {
        let (mut store, view) = setup(&[9001, 443, 80]);
        store
            .records_mut()
            .filter(|g| g.or_port == 80)
            .for_each(|g| g.is_dir_cache = false);

        let dystopic = LiveFilter {
            need_dir: false,
            pool: Some(Pool::Dystopic),
        };
        assert_eq!(live_guards(&store, &view, &dystopic, &PoolPolicy::default()).len(), 2);

        let dystopic_dir = LiveFilter {
            need_dir: true,
            ..dystopic
        };
        let live = live_guards(&store, &view, &dystopic_dir, &PoolPolicy::default());
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].or_port, 443);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::consensus::ConsensusEntry;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn live_set_excludes_contacted_offline_guards(
            states in prop::collection::vec(
                (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()),
                1..16,
            )
        ) {
            let mut store = GuardStore::new();
            let mut entries = Vec::new();
            for (i, (listed, in_view, tried, offline, contacted)) in states.iter().enumerate() {
                let fp = format!("{:040X}", i + 1);
                let e = ConsensusEntry::guard(&fp, "192.0.2.1".parse().unwrap(), 9001, 1);
                let mut r = GuardRecord::from_entry(&e, 0);
                r.listed = *listed;
                r.last_tried_at = tried.then_some(5);
                r.offline_since = offline.then_some(5);
                r.made_contact = *contacted;
                store.add(r).unwrap();
                if *in_view {
                    entries.push(e);
                }
            }
            let view = ConsensusView::new(entries).unwrap();
            let live = live_guards(&store, &view, &LiveFilter::default(), &PoolPolicy::default());

            for g in &live {
                prop_assert!(g.listed);
                prop_assert!(view.contains(&g.fingerprint));
                prop_assert!(!(g.made_contact && g.offline_since.is_some() && g.last_tried_at.is_some()));
            }
            let expected = store.all().iter().filter(|g| entry_is_live(g, &view)).count();
            prop_assert_eq!(live.len(), expected);
        }
    }
}
