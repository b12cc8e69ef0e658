//! Consensus-triggered store maintenance.
//!
//! Every new consensus replaces the [`ConsensusView`] and then runs the
//! store through four steps, in this order:
//!
//! 1. **Listing.** Records listed with the Guard flag are marked listed and
//!    synced (flags, weight, address); all others are marked unlisted, and
//!    `unlisted_since` is stamped if not already set.
//! 2. **Offline purge.** Records offline for `remove_offline_after_days`.
//! 3. **Unlisted purge.** Records unlisted for `remove_unlisted_after_days`.
//! 4. **Lifetime purge.** Records added `guard_lifetime_days` ago,
//!    regardless of status.
//!
//! The new-guard try log is then cut back to the try-threshold window.
//!
//! A refresh is idempotent. Purging can leave fewer primary guards than
//! configured; the next session start tops the store back up.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::GuardsConfig;
use crate::connector::{Clock, Connector};
use crate::consensus::{load_consensus, ConsensusView};
use crate::coordinator::GuardManager;
use crate::error::Result;
use crate::store::GuardStore;

const SECS_PER_DAY: i64 = 86400;

/// Eviction thresholds in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshParams {
    /// Unlisted this long → purged.
    pub remove_unlisted_after: i64,
    /// Offline this long → purged.
    pub remove_offline_after: i64,
    /// Added this long ago → purged.
    pub guard_lifetime: i64,
    /// New-guard tries older than this are dropped from the log.
    pub new_guard_try_window: i64,
}

impl Default for RefreshParams {
    fn default() -> Self {
        Self::from_config(&GuardsConfig::default())
    }
}

impl RefreshParams {
    /// Thresholds from the `[guards]` section.
    pub fn from_config(config: &GuardsConfig) -> Self {
        Self {
            remove_unlisted_after: config.remove_unlisted_after_days as i64 * SECS_PER_DAY,
            remove_offline_after: config.remove_offline_after_days as i64 * SECS_PER_DAY,
            guard_lifetime: config.guard_lifetime_days as i64 * SECS_PER_DAY,
            new_guard_try_window: config.guards_try_threshold_window_secs as i64,
        }
    }
}

/// What one refresh changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Records listed in the new consensus.
    pub listed: usize,
    /// Records not listed in the new consensus.
    pub unlisted: usize,
    /// Purged for being offline too long.
    pub purged_offline: Vec<String>,
    /// Purged for being unlisted too long.
    pub purged_unlisted: Vec<String>,
    /// Purged at the end of their lifetime.
    pub purged_expired: Vec<String>,
    /// New-guard tries that aged out of the window.
    pub pruned_tries: usize,
}

impl RefreshReport {
    /// Total records purged.
    pub fn purged(&self) -> usize {
        self.purged_offline.len() + self.purged_unlisted.len() + self.purged_expired.len()
    }
}

/// Installs `new_view` and brings the store in line with it.
pub fn refresh(
    store: &mut GuardStore,
    view: &mut ConsensusView,
    new_view: ConsensusView,
    now: i64,
    params: &RefreshParams,
) -> RefreshReport {
    let mut report = RefreshReport::default();

    for g in store.records_mut() {
        match new_view.get(&g.fingerprint).filter(|e| e.is_guard()) {
            Some(entry) => {
                g.listed = true;
                g.unlisted_since = None;
                g.sync_from(entry);
                report.listed += 1;
            }
            None => {
                g.listed = false;
                g.unlisted_since.get_or_insert(now);
                report.unlisted += 1;
            }
        }
    }

    report.purged_offline = purge(store, |g| {
        g.offline_since
            .is_some_and(|t| now - t >= params.remove_offline_after)
    });
    report.purged_unlisted = purge(store, |g| {
        g.unlisted_since
            .is_some_and(|t| now - t >= params.remove_unlisted_after)
    });
    report.purged_expired = purge(store, |g| now - g.added_at >= params.guard_lifetime);
    report.pruned_tries = store.prune_new_guard_tries(now - params.new_guard_try_window);

    *view = new_view;

    for fp in &report.purged_offline {
        info!(guard = %fp, "removed guard offline too long");
    }
    for fp in &report.purged_unlisted {
        info!(guard = %fp, "removed guard unlisted too long");
    }
    for fp in &report.purged_expired {
        info!(guard = %fp, "rotated out guard at end of lifetime");
    }

    report
}

fn purge<F>(store: &mut GuardStore, expired: F) -> Vec<String>
where
    F: Fn(&crate::store::GuardRecord) -> bool,
{
    let gone: Vec<String> = store
        .all()
        .iter()
        .filter(|g| expired(g))
        .map(|g| g.fingerprint.clone())
        .collect();
    if !gone.is_empty() {
        store.retain(|g| !expired(g));
    }
    gone
}

/// Where new consensus views come from.
pub trait ConsensusSource: Send + Sync {
    /// Produces the current view.
    fn fetch(&self) -> Result<ConsensusView>;
}

/// Re-reads an `ns/all` file and an optional cached consensus for weights.
#[derive(Debug, Clone)]
pub struct FileConsensusSource {
    /// Relay list in `ns/all` format.
    pub ns_path: PathBuf,
    /// Cached consensus holding `bandwidth-weights`.
    pub weights_path: Option<PathBuf>,
}

impl ConsensusSource for FileConsensusSource {
    fn fetch(&self) -> Result<ConsensusView> {
        load_consensus(&self.ns_path, self.weights_path.as_deref())
    }
}

/// Refreshes the manager from `source` every `interval` until `shutdown` is set.
///
/// A source error is logged and the previous view kept.
pub async fn run_refresh_job<C, K, S>(
    manager: Arc<GuardManager<C, K>>,
    source: S,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) where
    C: Connector,
    K: Clock,
    S: ConsensusSource,
{
    loop {
        if !sleep_unless_shutdown(interval, &shutdown).await {
            break;
        }
        match source.fetch() {
            Ok(view) => {
                if let Err(e) = manager.refresh(view).await {
                    warn!(error = %e, "cannot checkpoint guard state after refresh");
                }
            }
            Err(e) => warn!(error = %e, "consensus refresh failed, keeping previous view"),
        }
    }
}

/// Sleeps for `total` in short slices. Returns false if shutdown was requested.
async fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) -> bool {
    let step = Duration::from_millis(250);
    let mut waited = Duration::ZERO;
    while waited < total {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let nap = step.min(total - waited);
        tokio::time::sleep(nap).await;
        waited += nap;
    }
    !shutdown.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ConnectOutcome, SimClock};
    use crate::consensus::ConsensusEntry;
    use crate::error::Error;
    use crate::store::GuardRecord;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    const DAY: i64 = SECS_PER_DAY;
    const T0: i64 = 1_700_000_000;

    fn fp(n: u8) -> String {
        format!("{:02X}", n).repeat(20)
    }

    fn entry(n: u8) -> ConsensusEntry {
        ConsensusEntry::guard(&fp(n), format!("192.0.2.{}", n).parse().unwrap(), 9001, 10)
    }

    fn view_of(ns: &[u8]) -> ConsensusView {
        ConsensusView::new(ns.iter().map(|n| entry(*n)).collect()).unwrap()
    }

    fn long_lived() -> RefreshParams {
        RefreshParams {
            guard_lifetime: 365 * DAY,
            ..RefreshParams::default()
        }
    }

    fn store_of(ns: &[u8], added_at: i64) -> GuardStore {
        let mut store = GuardStore::new();
        for n in ns {
            store.add(GuardRecord::from_entry(&entry(*n), added_at)).unwrap();
        }
        store
    }

    #[test]
    fn test_unlisted_guard_purged_after_thirty_days() {
        let mut store = store_of(&[1, 2], T0);
        let mut view = view_of(&[1, 2]);
        let params = long_lived();

        refresh(&mut store, &mut view, view_of(&[2]), T0, &params);
        let g = store.get(&fp(1)).unwrap();
        assert!(!g.listed);
        assert_eq!(g.unlisted_since, Some(T0));

        let report = refresh(&mut store, &mut view, view_of(&[2]), T0 + 29 * DAY, &params);
        assert_eq!(report.purged(), 0);
        assert_eq!(store.get(&fp(1)).unwrap().unlisted_since, Some(T0));

        let report = refresh(&mut store, &mut view, view_of(&[2]), T0 + 30 * DAY, &params);
        assert_eq!(report.purged_unlisted, vec![fp(1)]);
        assert!(!store.contains(&fp(1)));

        // Relisting does not resurrect a purged guard.
        refresh(&mut store, &mut view, view_of(&[1, 2]), T0 + 31 * DAY, &params);
        assert!(!store.contains(&fp(1)));
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn test_relisting_resets_unlisted_clock() {
        let mut store = store_of(&[1], T0);
        let mut view = view_of(&[1]);
        let params = long_lived();

        refresh(&mut store, &mut view, view_of(&[]), T0, &params);
        refresh(&mut store, &mut view, view_of(&[1]), T0 + 20 * DAY, &params);
        refresh(&mut store, &mut view, view_of(&[]), T0 + 25 * DAY, &params);
        refresh(&mut store, &mut view, view_of(&[]), T0 + 40 * DAY, &params);
        assert!(store.contains(&fp(1)));
        assert_eq!(store.get(&fp(1)).unwrap().unlisted_since, Some(T0 + 25 * DAY));
    }

    #[test]
    fn test_lost_guard_flag_counts_as_unlisted() {
        let mut store = store_of(&[1], T0);
        let mut view = view_of(&[1]);
        let mut no_flag = entry(1);
        no_flag.flags.retain(|f| f != "Guard");
        let new_view = ConsensusView::new(vec![no_flag]).unwrap();

        let report = refresh(&mut store, &mut view, new_view, T0, &long_lived());
        assert_eq!(report.unlisted, 1);
        assert!(!store.get(&fp(1)).unwrap().listed);
    }

    #[test]
    fn test_offline_guard_purged() {
        let mut store = store_of(&[1, 2], T0);
        store.mark_contacted(&fp(1), T0);
        store.mark_offline(&fp(1), T0 + DAY);
        let mut view = view_of(&[1, 2]);

        let report = refresh(&mut store, &mut view, view_of(&[1, 2]), T0 + 31 * DAY, &long_lived());
        assert_eq!(report.purged_offline, vec![fp(1)]);
        assert!(store.contains(&fp(2)));
    }

    #[test]
    fn test_lifetime_purges_regardless_of_status() {
        let mut store = store_of(&[1], T0);
        store.mark_contacted(&fp(1), T0 + DAY);
        store.mark_confirmed(&fp(1));
        let mut view = view_of(&[1]);

        let report = refresh(&mut store, &mut view, view_of(&[1]), T0 + 30 * DAY, &RefreshParams::default());
        assert_eq!(report.purged_expired, vec![fp(1)]);
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_listed_guard_synced_from_consensus() {
        let mut store = store_of(&[1], T0);
        let mut view = view_of(&[1]);
        let mut moved = entry(1);
        moved.or_port = 443;
        moved.weight = 777;
        moved.flags.retain(|f| f != "V2Dir");

        refresh(&mut store, &mut view, ConsensusView::new(vec![moved]).unwrap(), T0, &long_lived());
        let g = store.get(&fp(1)).unwrap();
        assert_eq!(g.or_port, 443);
        assert_eq!(g.bandwidth, 777);
        assert!(!g.is_dir_cache);
        assert_eq!(view.get(&fp(1)).unwrap().or_port, 443);
    }

    #[test]
    fn test_refresh_is_idempotent() {
        let mut store = store_of(&[1, 2, 3], T0);
        store.mark_contacted(&fp(2), T0);
        store.mark_offline(&fp(2), T0);
        let mut view = view_of(&[1, 2, 3]);
        let params = RefreshParams::default();

        refresh(&mut store, &mut view, view_of(&[1, 2]), T0 + 5 * DAY, &params);
        let once = store.clone();
        let report = refresh(&mut store, &mut view, view_of(&[1, 2]), T0 + 5 * DAY, &params);
        assert_eq!(store, once);
        assert_eq!(report.purged(), 0);
    }

    #[test]
    fn test_refresh_prunes_old_new_guard_tries() {
        let mut store = store_of(&[1], T0);
        store.record_new_guard_try(&fp(7), T0);
        store.record_new_guard_try(&fp(8), T0 + 7000);
        let mut view = view_of(&[1]);

        let report = refresh(&mut store, &mut view, view_of(&[1]), T0 + 7200, &long_lived());
        assert_eq!(report.pruned_tries, 1);
        assert_eq!(store.new_guard_tries().len(), 1);
        assert_eq!(store.new_guard_tries()[0].fingerprint, fp(8));
    }

    /// Never reached by the refresh job.
    struct IdleConnector;

    #[async_trait]
    impl Connector for IdleConnector {
        async fn attempt_connect(&self, _fp: &str, _addr: SocketAddr, _t: Duration) -> ConnectOutcome {
            ConnectOutcome::Failed
        }
    }

    struct CountingSource {
        calls: Arc<AtomicUsize>,
        view: Option<ConsensusView>,
    }

    impl ConsensusSource for CountingSource {
        fn fetch(&self) -> Result<ConsensusView> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.view
                .clone()
                .ok_or_else(|| Error::Consensus("consensus unavailable".to_string()))
        }
    }

    fn job_manager() -> Arc<GuardManager<IdleConnector, SimClock>> {
        Arc::new(GuardManager::new(
            GuardsConfig::default(),
            store_of(&[1, 2], T0),
            view_of(&[1, 2, 3]),
            IdleConnector,
            SimClock::new(T0 + DAY),
        ))
    }

    async fn wait_for_calls(calls: &AtomicUsize, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_refresh_job_keeps_state_when_source_fails() {
        let manager = job_manager();
        let before = manager.snapshot().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            calls: Arc::clone(&calls),
            view: None,
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        let job = tokio::spawn(run_refresh_job(
            Arc::clone(&manager),
            source,
            Duration::from_millis(10),
            Arc::clone(&shutdown),
        ));

        wait_for_calls(&calls, 2).await;
        shutdown.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(1), job)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(manager.snapshot().await, before);
        let ctx = manager.context();
        let ctx = ctx.lock().await;
        let fps: Vec<_> = ctx.view.entries().iter().map(|e| e.fingerprint.clone()).collect();
        assert_eq!(fps, vec![fp(1), fp(2), fp(3)]);
    }

    #[tokio::test]
    async fn test_refresh_job_applies_new_consensus() {
        let manager = job_manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            calls: Arc::clone(&calls),
            view: Some(view_of(&[2])),
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        let job = tokio::spawn(run_refresh_job(
            Arc::clone(&manager),
            source,
            Duration::from_millis(10),
            Arc::clone(&shutdown),
        ));

        wait_for_calls(&calls, 1).await;
        shutdown.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(1), job)
            .await
            .unwrap()
            .unwrap();

        let store = manager.snapshot().await;
        let g = store.get(&fp(1)).unwrap();
        assert!(!g.listed);
        assert_eq!(g.unlisted_since, Some(T0 + DAY));
        assert!(store.get(&fp(2)).unwrap().listed);
    }

    #[tokio::test]
    async fn test_refresh_job_stops_on_shutdown() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            calls: Arc::clone(&calls),
            view: Some(view_of(&[1])),
        };
        let shutdown = Arc::new(AtomicBool::new(true));
        let finished = tokio::time::timeout(
            Duration::from_secs(1),
            run_refresh_job(job_manager(), source, Duration::from_secs(3600), shutdown),
        )
        .await;

        assert!(finished.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sleep_unless_shutdown_stops_early() {
        let shutdown = AtomicBool::new(true);
        assert!(!sleep_unless_shutdown(Duration::from_secs(3600), &shutdown).await);
        let running = AtomicBool::new(false);
        assert!(sleep_unless_shutdown(Duration::from_millis(10), &running).await);
    }
}
