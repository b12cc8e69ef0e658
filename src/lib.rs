//! # entry-guards-rs
//!
//! Entry guard selection for Tor-style anonymity network clients, after
//! Tor proposal 259.
//!
//! # Overview
//!
//! A client keeps a small, persistent, ordered set of first-hop relays
//! ("guards") and builds every circuit through one of them. The algorithm
//! balances three goals:
//!
//! - **Exposure**: use as few distinct guards as possible, and never offer
//!   more than one untried guard to a random choice at a time
//! - **Availability**: still build circuits behind restrictive firewalls and
//!   through relay churn
//! - **Diagnosis**: tell "my network is down" apart from "this guard is bad"
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Configuration management (TOML, CLI, environment) |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`consensus`] | Consensus view and `ns/all` parsing |
//! | [`store`] | Persistent ordered guard records |
//! | [`node_selection`] | Bandwidth-weighted sampling, pools, ExcludeNodes |
//! | [`live`] | Which stored guards are usable right now |
//! | [`selection`] | The selection state machine |
//! | [`outcome`] | Applying connection results to the store |
//! | [`connector`] | Connection attempts and clocks |
//! | [`coordinator`] | Circuit-build sessions over a shared store |
//! | [`refresh`] | Consensus-driven store maintenance |
//! | [`simulation`] | Simulated relay network and scenario driver |
//! | [`control`] | Application entry points |
//! | [`logger`] | Logging infrastructure using tracing |
//!
//! # Selection
//!
//! ```text
//!   PrimaryGuards ──► TryUtopic ──► TryDystopic ──► RetryOnly ──► Exhausted
//! ```
//!
//! Each session walks this sequence until a connection succeeds. See
//! [`selection`] for the rules of each state and [`outcome`] for how results
//! feed back into the store.
//!
//! # What This Library Does NOT Do
//!
//! - **Link or circuit protocol**: a "circuit" here is a successful
//!   connection to the guard; TLS and cells are out of scope
//! - **Consensus download and verification**: consensus input is read from
//!   already-fetched files
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::atomic::AtomicBool;
//! use entry_guards_rs::{
//!     consensus::load_consensus, ConsensusView, GuardManager, GuardStore, GuardsConfig,
//!     SystemClock, TcpConnector,
//! };
//!
//! #[tokio::main]
//! async fn main() -> entry_guards_rs::Result<()> {
//!     let view = load_consensus("ns-all.txt".as_ref(), None)?;
//!     let manager = GuardManager::new(
//!         GuardsConfig::default(),
//!         GuardStore::new(),
//!         ConsensusView::default(),
//!         TcpConnector,
//!         SystemClock,
//!     )
//!     .with_state_file("entry-guards.state");
//!     manager.refresh(view).await?;
//!
//!     let circuit = manager.build_circuit(false, &AtomicBool::new(false)).await?;
//!     println!("using guard {}", circuit.guard);
//!     Ok(())
//! }
//! ```
//!
//! ## As a CLI Application
//!
//! ```bash
//! # Simulate a flaky network
//! entry-guards-rs --simulate --flaky-network
//!
//! # Generate default configuration file
//! entry-guards-rs --generate_config entry-guards.conf
//! ```
//!
//! # State File
//!
//! Guard records are persisted as a Python pickle, written to a 0600
//! temporary file and renamed into place. A state file that fails to parse
//! or validate is fatal at startup: silently starting over would discard
//! the primary-guard ordering.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod connector;
pub mod consensus;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod live;
pub mod logger;
pub mod node_selection;
pub mod outcome;
pub mod refresh;
pub mod selection;
pub mod simulation;
pub mod store;

pub use config::{CliArgs, Config, GuardsConfig, LogLevel, SimulationConfig};
pub use connector::{Clock, ConnectOutcome, Connector, SimClock, SystemClock, TcpConnector};
pub use consensus::{ConsensusEntry, ConsensusView};
pub use coordinator::{AttemptRecord, Circuit, GuardManager, SessionReport};
pub use error::{Error, Result};
pub use live::{entry_is_live, live_guards, LiveFilter};
pub use node_selection::{
    is_valid_fingerprint, ExcludeNodes, FlagsRestriction,
    NodeRestriction, NodeRestrictionList, Pool, PoolPolicy, SampleConstraints, WeightedSampler,
};
pub use outcome::{apply_outcome, OutcomeEffect};
pub use refresh::{refresh, ConsensusSource, FileConsensusSource, RefreshParams, RefreshReport};
pub use selection::{SelectionParams, SelectionSession, SelectionState};
pub use simulation::{SimConnector, SimNetwork, Simulation, SimulationReport};
pub use store::{GuardRecord, GuardStore, NewGuardTry};

pub use control::{run_main, VERSION};
