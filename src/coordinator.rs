//! Session coordination.
//!
//! [`GuardManager`] owns the guard store, the current consensus view and the
//! random source, and runs circuit-build sessions against them:
//!
//! ```text
//!   build_circuit(need_dir)
//!        │
//!        ▼
//!   ┌───────────────────┐ lock
//!   │ repair primaries  │──────► checkpoint
//!   └─────────┬─────────┘
//!             ▼
//!   ┌───────────────────┐ lock          ┌──────────────────────┐ no lock
//!   │ next_guard        │──────────────►│ Connector::attempt   │
//!   └─────────▲─────────┘               └──────────┬───────────┘
//!             │ failed                             │
//!             │          ┌──────────────────┐ lock │
//!             └──────────│ apply_outcome    │◄─────┘
//!                        └────────┬─────────┘
//!                                 │ success
//!                                 ▼
//!                          mark confirmed, checkpoint, return Circuit
//! ```
//!
//! The lock is never held across a connection attempt, so refreshes and
//! other sessions proceed while an attempt is in flight. The store is
//! written to the state file after session start and after each outcome.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GuardsConfig;
use crate::connector::{Clock, ConnectOutcome, Connector};
use crate::consensus::ConsensusView;
use crate::error::{Error, Result};
use crate::node_selection::{ExcludeNodes, PoolPolicy, WeightedSampler};
use crate::outcome::{apply_outcome, OutcomeEffect};
use crate::refresh::{refresh, RefreshParams, RefreshReport};
use crate::selection::{repair_primaries, SelectionParams, SelectionSession, SelectionState};
use crate::store::GuardStore;

/// Shared mutable state behind the manager's lock.
#[derive(Debug)]
pub struct GuardContext {
    /// Persistent guard records.
    pub store: GuardStore,
    /// Current consensus.
    pub view: ConsensusView,
    /// Random source for sampling and uniform choice.
    pub rng: StdRng,
}

/// One connection attempt made during a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// Guard tried.
    pub guard: String,
    /// State the guard was offered from.
    pub state: SelectionState,
    /// Clock reading when the attempt started.
    pub started_at: i64,
    /// Clock reading when the outcome was applied.
    pub finished_at: i64,
    /// Connector result.
    pub outcome: ConnectOutcome,
    /// What the result did to the store.
    pub effect: OutcomeEffect,
}

/// A successfully built circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Circuit {
    /// Guard the circuit goes through.
    pub guard: String,
    /// State the guard was chosen from.
    pub state: SelectionState,
    /// Attempts made, including the successful one.
    pub attempts: usize,
}

/// Everything one session did, successful or not.
#[derive(Debug)]
pub struct SessionReport {
    /// The circuit, or why none was built.
    pub result: Result<Circuit>,
    /// Attempts in order.
    pub attempts: Vec<AttemptRecord>,
    /// States entered, in order.
    pub visited: Vec<SelectionState>,
}

impl SessionReport {
    /// Distinct guards attempted.
    pub fn guards_tried(&self) -> usize {
        let mut seen: Vec<&str> = self.attempts.iter().map(|a| a.guard.as_str()).collect();
        seen.sort_unstable();
        seen.dedup();
        seen.len()
    }
}

/// Runs circuit-build sessions over a shared guard store.
pub struct GuardManager<C: Connector, K: Clock> {
    ctx: Arc<Mutex<GuardContext>>,
    connector: C,
    clock: K,
    sampler: WeightedSampler,
    config: GuardsConfig,
    refresh_params: RefreshParams,
    attempt_timeout: Duration,
    state_file: Option<PathBuf>,
}

impl<C: Connector, K: Clock> GuardManager<C, K> {
    /// Creates a manager with an entropy-seeded random source and no state file.
    pub fn new(
        config: GuardsConfig,
        store: GuardStore,
        view: ConsensusView,
        connector: C,
        clock: K,
    ) -> Self {
        let exclude_nodes = ExcludeNodes::parse(&config.exclude_nodes);
        if exclude_nodes.has_exclusions() {
            info!(
                fingerprints = exclude_nodes.idhexes.len(),
                networks = exclude_nodes.networks.len(),
                nicknames = exclude_nodes.nicks.len(),
                "ExcludeNodes in effect for guard sampling"
            );
        }
        let sampler = WeightedSampler::new(
            PoolPolicy {
                dystopic_ports: config.dystopic_ports.clone(),
                disjoint: config.disjoint_pools,
            },
            exclude_nodes,
        )
        .uniform(!config.prioritize_bandwidth);
        Self {
            ctx: Arc::new(Mutex::new(GuardContext {
                store,
                view,
                rng: StdRng::from_entropy(),
            })),
            connector,
            clock,
            sampler,
            refresh_params: RefreshParams::from_config(&config),
            attempt_timeout: Duration::from_secs(config.connect_timeout_secs),
            config,
            state_file: None,
        }
    }

    /// Seeds the random source.
    pub fn with_seed(self, seed: u64) -> Self {
        self.with_rng(StdRng::seed_from_u64(seed))
    }

    /// Replaces the random source.
    pub fn with_rng(self, rng: StdRng) -> Self {
        if let Ok(mut ctx) = self.ctx.try_lock() {
            ctx.rng = rng;
        }
        self
    }

    /// Checkpoints the store to `path`.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    /// Overrides the per-attempt deadline.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Guard parameters in force.
    pub fn config(&self) -> &GuardsConfig {
        &self.config
    }

    /// The sampler used to grow the store.
    pub fn sampler(&self) -> &WeightedSampler {
        &self.sampler
    }

    /// Shared state, for callers that need to inspect or adjust it.
    pub fn context(&self) -> Arc<Mutex<GuardContext>> {
        Arc::clone(&self.ctx)
    }

    /// Copy of the current store.
    pub async fn snapshot(&self) -> GuardStore {
        self.ctx.lock().await.store.clone()
    }

    /// Builds one circuit, trying guards until one answers.
    ///
    /// # Errors
    ///
    /// - [`Error::NoUsableGuard`] when every selection state is exhausted
    /// - [`Error::NoEligibleGuards`] when the store is empty and nothing can be sampled
    /// - [`Error::Cancelled`] when `cancel` is set between attempts
    /// - [`Error::Io`] when a checkpoint cannot be written
    pub async fn build_circuit(&self, need_dir: bool, cancel: &AtomicBool) -> Result<Circuit> {
        self.run_session(need_dir, cancel).await.result
    }

    /// Like [`build_circuit`](Self::build_circuit), also reporting every attempt.
    pub async fn run_session(&self, need_dir: bool, cancel: &AtomicBool) -> SessionReport {
        let params = SelectionParams::from_config(&self.config, need_dir);
        let mut session = SelectionSession::new(params.clone());
        let mut attempts = Vec::new();
        let result = self
            .drive_session(&mut session, &params, cancel, &mut attempts)
            .await;

        match &result {
            Ok(circuit) => info!(
                guard = %circuit.guard,
                state = %circuit.state,
                attempts = circuit.attempts,
                "circuit built"
            ),
            Err(e) => warn!(error = %e, attempts = attempts.len(), "circuit build failed"),
        }

        SessionReport {
            result,
            attempts,
            visited: session.visited().to_vec(),
        }
    }

    async fn drive_session(
        &self,
        session: &mut SelectionSession,
        params: &SelectionParams,
        cancel: &AtomicBool,
        attempts: &mut Vec<AttemptRecord>,
    ) -> Result<Circuit> {
        {
            let mut ctx = self.ctx.lock().await;
            let GuardContext { store, view, rng } = &mut *ctx;
            let added = repair_primaries(store, view, &self.sampler, params, rng, self.clock.now())?;
            if added > 0 {
                debug!(added, "primary guards topped up");
            }
            self.checkpoint(store)?;
        }

        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }

            let (guard, addr) = {
                let mut ctx = self.ctx.lock().await;
                let GuardContext { store, view, rng } = &mut *ctx;
                let guard = session.next_guard(store, view, &self.sampler, rng, self.clock.now())?;
                let addr = store.get(&guard).and_then(|g| g.socket_addr());
                (guard, addr)
            };
            let state = session.state();

            let started_at = self.clock.now();
            let outcome = match addr {
                Some(addr) => tokio::time::timeout(
                    self.attempt_timeout,
                    self.connector
                        .attempt_connect(&guard, addr, self.attempt_timeout),
                )
                .await
                .unwrap_or(ConnectOutcome::TimedOut),
                None => {
                    warn!(guard = %guard, "stored address does not parse");
                    ConnectOutcome::Failed
                }
            };

            let finished_at = self.clock.now();
            let effect = {
                let mut ctx = self.ctx.lock().await;
                let effect = apply_outcome(&mut ctx.store, &guard, outcome.is_success(), finished_at);
                if outcome.is_success() {
                    ctx.store.mark_confirmed(&guard);
                }
                self.checkpoint(&ctx.store)?;
                effect
            };
            debug!(guard = %guard, %state, ?outcome, ?effect, "attempt finished");

            attempts.push(AttemptRecord {
                guard: guard.clone(),
                state,
                started_at,
                finished_at,
                outcome,
                effect,
            });

            if outcome.is_success() {
                return Ok(Circuit {
                    guard,
                    state,
                    attempts: attempts.len(),
                });
            }
        }
    }

    /// Installs a new consensus view and runs store maintenance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the checkpoint cannot be written. The refresh
    /// itself is applied either way.
    pub async fn refresh(&self, new_view: ConsensusView) -> Result<RefreshReport> {
        let mut ctx = self.ctx.lock().await;
        let GuardContext { store, view, .. } = &mut *ctx;
        let report = refresh(store, view, new_view, self.clock.now(), &self.refresh_params);
        info!(
            listed = report.listed,
            unlisted = report.unlisted,
            purged = report.purged(),
            "consensus refreshed"
        );
        self.checkpoint(store)?;
        Ok(report)
    }

    /// Writes the store to the state file, if one is set.
    pub async fn save(&self) -> Result<()> {
        let ctx = self.ctx.lock().await;
        self.checkpoint(&ctx.store)
    }

    fn checkpoint(&self, store: &GuardStore) -> Result<()> {
        match &self.state_file {
            Some(path) => write_checkpoint(store, path),
            None => Ok(()),
        }
    }
}

fn write_checkpoint(store: &GuardStore, path: &Path) -> Result<()> {
    store.save(path).inspect_err(|e| {
        warn!(path = %path.display(), error = %e, "cannot write guard state");
    })
}
