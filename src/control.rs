//! Application entry points.
//!
//! [`run_main`] installs a CTRL+C handler and runs one of two modes:
//!
//! ```text
//!                 ┌──────────────┐
//!                 │   run_main   │
//!                 └──────┬───────┘
//!            simulate    │    live
//!        ┌───────────────┴───────────────┐
//!        ▼                               ▼
//!  ┌───────────────┐              ┌──────────────────┐
//!  │ Simulation    │              │ load guard state │ ◄── StoreCorrupt is fatal
//!  │  ::run        │              └────────┬─────────┘
//!  └──────┬────────┘                       ▼
//!         ▼                       ┌──────────────────┐
//!   print metrics                 │ read consensus,  │
//!                                 │ refresh store    │
//!                                 └────────┬─────────┘
//!                                          ▼
//!                                 ┌──────────────────┐      ┌───────────────┐
//!                                 │ build N circuits │◄─────│ refresh job   │
//!                                 │ (TcpConnector)   │      │ (interval)    │
//!                                 └────────┬─────────┘      └───────────────┘
//!                                          ▼
//!                                   save guard state
//! ```
//!
//! In live mode a circuit is a successful TCP connection to the guard's OR
//! port; the guard state file is checkpointed after every attempt.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, LogLevel};
use crate::connector::{Clock, SystemClock, TcpConnector};
use crate::consensus::ConsensusView;
use crate::coordinator::{Circuit, GuardManager};
use crate::error::{Error, Result};
use crate::logger::plog;
use crate::plog_fmt;
use crate::refresh::{run_refresh_job, ConsensusSource, FileConsensusSource};
use crate::simulation::{Simulation, SimulationReport};
use crate::store::GuardStore;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Runs the configured mode until it finishes or CTRL+C is pressed.
///
/// # Errors
///
/// Returns any error from [`run_simulation`] or [`run_live`].
pub async fn run_main(config: Config) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            plog(LogLevel::Notice, "Got CTRL+C. Exiting.");
            shutdown_clone.store(true, Ordering::SeqCst);
        }
    });

    if config.simulate {
        let report = run_simulation(&config, &shutdown).await?;
        println!("{}", report);
        return Ok(());
    }

    let circuits = run_live(&config, shutdown).await?;
    plog_fmt!(LogLevel::Notice, "Built {} circuit(s)", circuits.len());
    Ok(())
}

/// Runs the network simulation.
///
/// # Errors
///
/// Returns [`Error::Consensus`] if the simulated consensus cannot be built.
pub async fn run_simulation(config: &Config, shutdown: &AtomicBool) -> Result<SimulationReport> {
    let sim = &config.simulation;
    plog_fmt!(
        LogLevel::Notice,
        "Simulating {} relays for {} periods",
        sim.total_relays,
        sim.periods
    );
    if sim.switching_network {
        plog(LogLevel::Notice, "Local network conditions switch at every churn");
    }
    if sim.separate_clients {
        plog(LogLevel::Notice, "Using a fresh client for every sub-period");
    }
    Simulation::new(config)?.run(shutdown).await
}

/// Loads the guard store, starting empty if the file does not exist.
///
/// # Errors
///
/// Returns [`Error::StoreCorrupt`] if the file exists but cannot be
/// trusted. The caller must not fall back to an empty store.
pub fn load_guard_state(path: &Path, now: i64) -> Result<GuardStore> {
    if !path.exists() {
        plog_fmt!(
            LogLevel::Notice,
            "Creating new guard state file at: {}",
            path.display()
        );
        return Ok(GuardStore::new());
    }
    let store = GuardStore::load(path, now)?;
    plog_fmt!(
        LogLevel::Info,
        "Loaded {} guard(s) from {}",
        store.size(),
        path.display()
    );
    Ok(store)
}

/// Builds `config.circuits` circuits over real TCP connections.
///
/// A consensus refresh job runs alongside at `refresh_interval_secs`.
///
/// # Errors
///
/// - [`Error::Config`] if no consensus file is configured
/// - [`Error::StoreCorrupt`] if the state file cannot be trusted
/// - [`Error::NoUsableGuard`] if circuits were requested and none was built
pub async fn run_live(config: &Config, shutdown: Arc<AtomicBool>) -> Result<Vec<Circuit>> {
    let ns_path = config.consensus_file.clone().ok_or_else(|| {
        Error::Config("no consensus file given; use --consensus or --simulate".to_string())
    })?;
    let source = FileConsensusSource {
        ns_path,
        weights_path: config.weights_file.clone(),
    };

    let store = load_guard_state(&config.state_file, SystemClock.now())?;
    let view = source.fetch()?;
    plog_fmt!(LogLevel::Info, "Consensus lists {} relays", view.len());

    let manager = Arc::new(
        GuardManager::new(
            config.guards.clone(),
            store,
            ConsensusView::default(),
            TcpConnector,
            SystemClock,
        )
        .with_state_file(&config.state_file),
    );
    manager.refresh(view).await?;

    let stop_refresh = Arc::new(AtomicBool::new(false));
    let job = tokio::spawn(run_refresh_job(
        Arc::clone(&manager),
        source,
        Duration::from_secs(config.refresh_interval_secs),
        Arc::clone(&stop_refresh),
    ));

    let mut circuits = Vec::new();
    let mut last_error = None;
    for n in 0..config.circuits {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match manager.build_circuit(false, &shutdown).await {
            Ok(circuit) => {
                plog_fmt!(
                    LogLevel::Notice,
                    "Circuit {} through guard {} ({} attempts)",
                    n + 1,
                    circuit.guard,
                    circuit.attempts
                );
                circuits.push(circuit);
            }
            Err(Error::Cancelled) => break,
            Err(e @ Error::Io(_)) => {
                stop_refresh.store(true, Ordering::SeqCst);
                let _ = job.await;
                return Err(e);
            }
            Err(e) => {
                plog_fmt!(LogLevel::Warn, "Circuit {} failed: {}", n + 1, e);
                last_error = Some(e);
            }
        }
    }

    stop_refresh.store(true, Ordering::SeqCst);
    let _ = job.await;
    manager.save().await?;

    if circuits.is_empty() && !shutdown.load(Ordering::SeqCst) {
        if let Some(e) = last_error {
            return Err(e);
        }
    }
    Ok(circuits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::GuardRecord;
    use crate::consensus::ConsensusEntry;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    fn ns_file(dir: &Path, port: u16) -> std::path::PathBuf {
        let path = dir.join("ns-all.txt");
        let mut text = String::new();
        for (nick, id) in [("relay1", 'A'), ("relay2", 'B'), ("relay3", 'C'), ("relay4", 'D')] {
            let id = id.to_string().repeat(27);
            text.push_str(&format!(
                "r {nick} {id} {id} 2024-01-01 00:00:00 127.0.0.1 {port} 0\n\
                 s Fast Guard Running Stable V2Dir Valid\n\
                 w Bandwidth=1000\n"
            ));
        }
        std::fs::write(&path, text).unwrap();
        path
    }

    #[tokio::test]
    async fn test_live_mode_builds_and_persists() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = tempdir().unwrap();

        let config = Config {
            consensus_file: Some(ns_file(dir.path(), port)),
            state_file: dir.path().join("guards.state"),
            circuits: 2,
            ..Config::default()
        };
        let circuits = run_live(&config, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert_eq!(circuits.len(), 2);
        assert_eq!(circuits[0].guard, circuits[1].guard);

        let store = GuardStore::load(&config.state_file, SystemClock.now()).unwrap();
        assert_eq!(store.size(), 3);
        assert!(store.get(&circuits[0].guard).unwrap().confirmed);
    }

    #[tokio::test]
    async fn test_live_mode_requires_consensus() {
        let result = run_live(&Config::default(), Arc::new(AtomicBool::new(false))).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_corrupt_state_is_fatal() {
        let dir = tempdir().unwrap();
        let state = dir.path().join("guards.state");
        std::fs::write(&state, b"not a pickle").unwrap();
        let config = Config {
            consensus_file: Some(ns_file(dir.path(), 9)),
            state_file: state.clone(),
            ..Config::default()
        };

        let result = run_live(&config, Arc::new(AtomicBool::new(false))).await;
        assert!(matches!(result, Err(Error::StoreCorrupt(_))));
        // The file is left for the operator.
        assert_eq!(std::fs::read(&state).unwrap(), b"not a pickle");
    }

    #[test]
    fn test_load_missing_state_starts_empty() {
        let dir = tempdir().unwrap();
        let store = load_guard_state(&dir.path().join("absent"), 0).unwrap();
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_load_existing_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guards.state");
        let mut store = GuardStore::new();
        let e = ConsensusEntry::guard(&"AB".repeat(20), "192.0.2.1".parse().unwrap(), 443, 1);
        store.add(GuardRecord::from_entry(&e, 100)).unwrap();
        store.save(&path).unwrap();

        assert_eq!(load_guard_state(&path, 200).unwrap(), store);
    }

    #[tokio::test]
    async fn test_short_simulation() {
        let mut config = Config::default();
        config.simulation.total_relays = 60;
        config.simulation.periods = 1;
        config.simulation.subperiods = 2;
        config.simulation.attempts_per_subperiod = 1;
        config.simulation.seed = Some(3);

        let report = run_simulation(&config, &AtomicBool::new(false)).await.unwrap();
        assert_eq!(report.sessions, 2);
        assert_eq!(report.relays, 60);
    }
}
