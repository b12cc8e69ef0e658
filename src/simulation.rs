//! Network simulation.
//!
//! A small model of a relay network, good enough to exercise guard
//! selection under churn and hostile local networks. Every relay is a guard;
//! relays go up and down on their own, leave and join during churn, and the
//! client's local network may filter connections.
//!
//! # Relays
//!
//! | Property | Distribution |
//! |----------|--------------|
//! | OR port | a dystopic port with probability `fascist_friendly_fraction`, otherwise uniform in 1..=65535 |
//! | hostile | probability `evil_fraction` |
//! | bandwidth | exponential, mean 50000 KB/s |
//! | directory cache | probability 0.9 |
//! | up | re-drawn with probability `node_reliability` on each update |
//!
//! A relay that goes down stays down for a random part of the recovery time
//! (60 s, or an hour under `slow_recovery`) before it is re-drawn. The
//! consensus lists exactly the relays that are up.
//!
//! # Local network conditions
//!
//! | Condition | Effect on a connection |
//! |-----------|------------------------|
//! | `network_down` | always fails |
//! | `fascist_firewall` | fails unless the OR port is one of `dystopic_ports` |
//! | `flaky_network` | fails with probability `1 - flaky_reliability` |
//! | `evil_filtering` | fails for non-hostile relays |
//! | `sniper_network` | non-hostile relays are killed after the attempt |
//!
//! With `switching_network`, every churn event replaces the conditions with
//! one drawn uniformly from: firewall, evil filtering, sniper, flaky, down,
//! none, slow recovery.
//!
//! A connection to a relay that is up takes 2 simulated seconds; one to a
//! relay that is down, 4.
//!
//! # Driver
//!
//! ```text
//!   for each period (one consensus, one hour):
//!       for each sub-period (two minutes):
//!           churn every tenth sub-period
//!           update relay up/down state
//!           run `attempts_per_subperiod` sessions, 20 s apart
//!       refresh the guard manager from a new consensus
//! ```
//!
//! With `separate_clients`, each sub-period gets a new manager with an empty
//! store and the current period's consensus, and no refresh runs.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::config::{Config, GuardsConfig, SimulationConfig};
use crate::connector::{Clock, ConnectOutcome, Connector, SimClock};
use crate::consensus::{ConsensusEntry, ConsensusView};
use crate::coordinator::{AttemptRecord, GuardManager};
use crate::error::{Error, Result};
use crate::store::GuardStore;

/// Simulated start time.
pub const SIM_EPOCH: i64 = 1_000_000_000;

/// Seconds a down relay waits, scaled by a uniform draw, before recovering.
const RECOVERY_TIME: i64 = 60;
const SLOW_RECOVERY_TIME: i64 = 3600;

const DIR_CACHE_PROBABILITY: f64 = 0.9;
const MEAN_BANDWIDTH: f64 = 50_000.0;
const UP_CONNECT_SECS: i64 = 2;
const DOWN_CONNECT_SECS: i64 = 4;
const SECS_BETWEEN_SESSIONS: i64 = 20;
const CHURN_EVERY: u32 = 10;

/// One simulated relay.
#[derive(Debug, Clone, PartialEq)]
pub struct SimNode {
    /// Identity fingerprint.
    pub fingerprint: String,
    /// Nickname, `node<N>`.
    pub nickname: String,
    /// OR address.
    pub address: IpAddr,
    /// OR port.
    pub or_port: u16,
    /// Bandwidth in KB/s, used as the consensus weight.
    pub bandwidth: u64,
    /// Serves directory data.
    pub dir_cache: bool,
    /// Hostile relay.
    pub evil: bool,
    /// Currently running.
    pub up: bool,
    /// Permanently gone.
    pub dead: bool,
    /// Start of the current down stretch.
    pub down_since: Option<i64>,
}

impl SimNode {
    fn consensus_entry(&self) -> ConsensusEntry {
        let mut entry = ConsensusEntry::guard(&self.fingerprint, self.address, self.or_port, self.bandwidth);
        entry.nickname = self.nickname.clone();
        if !self.dir_cache {
            entry.flags.retain(|f| f != "V2Dir");
        }
        entry
    }
}

/// Local network conditions in effect.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkConditions {
    /// Nothing connects.
    pub down: bool,
    /// Only ports 80 and 443 connect.
    pub fascist_firewall: bool,
    /// Per-connection success probability, if flaky.
    pub flaky: Option<f64>,
    /// Only hostile relays connect.
    pub evil_filtering: bool,
    /// Non-hostile relays die after each connection.
    pub sniper: bool,
    /// Down relays take up to an hour to recover.
    pub slow_recovery: bool,
}

impl NetworkConditions {
    /// Conditions selected in the `[simulation]` section.
    pub fn from_config(config: &SimulationConfig) -> Self {
        Self {
            down: config.network_down,
            fascist_firewall: config.fascist_firewall,
            flaky: config.flaky_network.then_some(config.flaky_reliability),
            evil_filtering: config.evil_filtering,
            sniper: config.sniper_network,
            slow_recovery: config.slow_recovery,
        }
    }

    fn recovery_time(&self) -> i64 {
        if self.slow_recovery {
            SLOW_RECOVERY_TIME
        } else {
            RECOVERY_TIME
        }
    }
}

/// The simulated relay network.
#[derive(Debug)]
pub struct SimNetwork {
    nodes: Vec<SimNode>,
    clock: SimClock,
    rng: StdRng,
    conditions: NetworkConditions,
    switching: bool,
    flaky_reliability: f64,
    dystopic_ports: Vec<u16>,
    reliability: f64,
    fascist_friendly_fraction: f64,
    evil_fraction: f64,
    avg_new_per_churn: f64,
    avg_del_per_churn: f64,
    total: usize,
}

impl SimNetwork {
    /// Generates `config.total_relays` relays and draws their initial state.
    ///
    /// `dystopic_ports` are the ports firewall-friendly relays listen on and
    /// the only ports a restrictive firewall lets through.
    pub fn new(
        config: &SimulationConfig,
        dystopic_ports: &[u16],
        clock: SimClock,
        rng: StdRng,
    ) -> Self {
        let mut net = Self {
            nodes: Vec::with_capacity(config.total_relays),
            clock,
            rng,
            conditions: NetworkConditions::from_config(config),
            switching: config.switching_network,
            flaky_reliability: config.flaky_reliability,
            dystopic_ports: dystopic_ports.to_vec(),
            reliability: config.node_reliability,
            fascist_friendly_fraction: config.fascist_friendly_fraction,
            evil_fraction: config.evil_fraction,
            avg_new_per_churn: config.avg_new_per_churn,
            avg_del_per_churn: config.avg_del_per_churn,
            total: 0,
        };
        for _ in 0..config.total_relays {
            let node = net.spawn_node();
            net.nodes.push(node);
        }
        net.update_running();
        net
    }

    fn spawn_node(&mut self) -> SimNode {
        let rng = &mut self.rng;
        let or_port = if rng.gen::<f64>() < self.fascist_friendly_fraction {
            self.dystopic_ports.choose(rng).copied().unwrap_or(443)
        } else {
            rng.gen_range(1..=65535)
        };
        let id: [u8; 20] = rng.gen();
        let node = SimNode {
            fingerprint: id.iter().map(|b| format!("{:02X}", b)).collect(),
            nickname: format!("node{}", self.total),
            address: IpAddr::V4(Ipv4Addr::from(0x0A00_0000 | (rng.gen::<u32>() & 0x00FF_FFFF))),
            or_port,
            bandwidth: (exponential(rng, MEAN_BANDWIDTH)).floor() as u64,
            dir_cache: rng.gen::<f64>() < DIR_CACHE_PROBABILITY,
            evil: rng.gen::<f64>() < self.evil_fraction,
            up: true,
            dead: false,
            down_since: None,
        };
        self.total += 1;
        node
    }

    /// All relays, dead ones included.
    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    /// Looks up a relay.
    pub fn node(&self, fingerprint: &str) -> Option<&SimNode> {
        self.nodes.iter().find(|n| n.fingerprint == fingerprint)
    }

    /// Conditions in effect.
    pub fn conditions(&self) -> NetworkConditions {
        self.conditions
    }

    /// Replaces the local network conditions.
    pub fn set_conditions(&mut self, conditions: NetworkConditions) {
        self.conditions = conditions;
    }

    /// Draws new local network conditions uniformly from the scenario set.
    pub fn switch_conditions(&mut self) {
        let choices = [
            NetworkConditions {
                fascist_firewall: true,
                ..NetworkConditions::default()
            },
            NetworkConditions {
                evil_filtering: true,
                ..NetworkConditions::default()
            },
            NetworkConditions {
                sniper: true,
                ..NetworkConditions::default()
            },
            NetworkConditions {
                flaky: Some(self.flaky_reliability),
                ..NetworkConditions::default()
            },
            NetworkConditions {
                down: true,
                ..NetworkConditions::default()
            },
            NetworkConditions::default(),
            NetworkConditions {
                slow_recovery: true,
                ..NetworkConditions::default()
            },
        ];
        self.conditions = choices[self.rng.gen_range(0..choices.len())];
        debug!(conditions = ?self.conditions, "local network switched");
    }

    /// Consensus listing the relays that are up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Consensus`] if two relays drew the same fingerprint.
    pub fn consensus(&self) -> Result<ConsensusView> {
        ConsensusView::new(
            self.nodes
                .iter()
                .filter(|n| n.up && !n.dead)
                .map(SimNode::consensus_entry)
                .collect(),
        )
    }

    /// Kills and adds relays. The network keeps its size: after additions a
    /// random subset of the old size survives. A switching network also
    /// draws new conditions here.
    pub fn churn(&mut self) {
        if self.switching {
            self.switch_conditions();
        }
        let n_add = (exponential(&mut self.rng, self.avg_new_per_churn) + 0.5) as usize;
        let n_del = (exponential(&mut self.rng, self.avg_del_per_churn) + 0.5) as usize;
        let size = self.nodes.len();

        self.nodes.shuffle(&mut self.rng);
        for node in self.nodes.iter_mut().filter(|n| !n.dead).take(n_del) {
            node.dead = true;
            node.up = false;
        }

        for _ in 0..n_add {
            let node = self.spawn_node();
            self.nodes.push(node);
        }
        self.nodes.shuffle(&mut self.rng);
        self.nodes.truncate(size);
        debug!(added = n_add, killed = n_del, "network churn");
    }

    /// Re-draws every live relay's running state.
    pub fn update_running(&mut self) {
        let now = self.clock.now();
        let recovery_time = self.conditions.recovery_time() as f64;
        for node in self.nodes.iter_mut().filter(|n| !n.dead) {
            if let Some(since) = node.down_since {
                let recovers_at = since as f64 + recovery_time * self.rng.gen::<f64>();
                if recovers_at >= now as f64 {
                    continue;
                }
            }
            node.up = self.rng.gen::<f64>() < self.reliability;
            if node.up {
                node.down_since = None;
            } else if node.down_since.is_none() {
                node.down_since = Some(now);
            }
        }
    }

    /// Attempts a connection, advancing the clock. Returns true on success.
    pub fn probe(&mut self, fingerprint: &str) -> bool {
        let Some(idx) = self.nodes.iter().position(|n| n.fingerprint == fingerprint) else {
            self.clock.advance(DOWN_CONNECT_SECS);
            return false;
        };
        let c = self.conditions;
        let node = &self.nodes[idx];
        let reachable = node.up
            && !c.down
            && (!c.fascist_firewall || self.dystopic_ports.contains(&node.or_port))
            && (!c.evil_filtering || node.evil)
            && c.flaky.map_or(true, |p| self.rng.gen::<f64>() < p);

        self.clock.advance(if node.up {
            UP_CONNECT_SECS
        } else {
            DOWN_CONNECT_SECS
        });

        if c.sniper && !node.evil {
            let node = &mut self.nodes[idx];
            node.dead = true;
            node.up = false;
        }
        reachable
    }
}

/// Exponential variate with the given mean.
fn exponential<R: Rng + ?Sized>(rng: &mut R, mean: f64) -> f64 {
    -mean * (1.0 - rng.gen::<f64>()).ln()
}

fn lock(network: &Mutex<SimNetwork>) -> MutexGuard<'_, SimNetwork> {
    network.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connector backed by a [`SimNetwork`].
#[derive(Debug, Clone)]
pub struct SimConnector {
    network: Arc<Mutex<SimNetwork>>,
}

impl SimConnector {
    /// Connects into `network`.
    pub fn new(network: Arc<Mutex<SimNetwork>>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn attempt_connect(&self, fingerprint: &str, _addr: SocketAddr, _timeout: Duration) -> ConnectOutcome {
        if lock(&self.network).probe(fingerprint) {
            ConnectOutcome::Connected
        } else {
            ConnectOutcome::Failed
        }
    }
}

/// Results of one simulation run.
#[derive(Debug, Clone, Default)]
pub struct SimulationReport {
    /// Relays at start.
    pub relays: usize,
    /// Sessions run.
    pub sessions: usize,
    /// Sessions that built a circuit.
    pub successes: usize,
    /// Every attempt, in order.
    pub attempts: Vec<AttemptRecord>,
    /// Bandwidth of the guard behind each built circuit.
    pub guard_bandwidths: Vec<u64>,
    /// Simulated start time.
    pub started_at: i64,
    /// Clients that ran sessions.
    pub clients: usize,
}

impl SimulationReport {
    /// Fraction of sessions that built a circuit.
    pub fn success_rate(&self) -> f64 {
        if self.sessions == 0 {
            return 0.0;
        }
        self.successes as f64 / self.sessions as f64
    }

    /// Distinct guards tried in the whole run.
    pub fn exposure(&self) -> usize {
        self.exposure_after_attempts(self.attempts.len())
    }

    /// Distinct guards tried within the first `depth` attempts.
    pub fn exposure_after_attempts(&self, depth: usize) -> usize {
        self.attempts
            .iter()
            .take(depth)
            .map(|a| a.guard.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    fn first_success(&self) -> Option<usize> {
        self.attempts.iter().position(|a| a.outcome.is_success())
    }

    /// Simulated seconds from start until the first circuit.
    pub fn time_to_first_circuit(&self) -> Option<i64> {
        self.first_success()
            .map(|i| self.attempts[i].finished_at - self.started_at)
    }

    /// Distinct guards tried up to and including the first circuit.
    pub fn guards_to_first_circuit(&self) -> Option<usize> {
        self.first_success()
            .map(|i| self.exposure_after_attempts(i + 1))
    }

    /// Mean bandwidth of the guards circuits were built through.
    pub fn average_guard_bandwidth(&self) -> f64 {
        if self.guard_bandwidths.is_empty() {
            return 0.0;
        }
        self.guard_bandwidths.iter().sum::<u64>() as f64 / self.guard_bandwidths.len() as f64
    }

    /// Mean simulated seconds per attempt.
    pub fn average_attempt_secs(&self) -> f64 {
        if self.attempts.is_empty() {
            return 0.0;
        }
        let total: i64 = self.attempts.iter().map(|a| a.finished_at - a.started_at).sum();
        total as f64 / self.attempts.len() as f64
    }
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Number of nodes in simulated network: {}", self.relays)?;
        writeln!(f, "Clients simulated:                   {}", self.clients)?;
        writeln!(
            f,
            "Successful client circuits (total):  {} ({})",
            self.successes, self.sessions
        )?;
        writeln!(
            f,
            "Percentage of successful circuits:   {:.2}%",
            self.success_rate() * 100.0
        )?;
        writeln!(
            f,
            "Average guard bandwidth capacity:    {:.0} KB/s",
            self.average_guard_bandwidth()
        )?;
        writeln!(f, "Connection attempts:                 {}", self.attempts.len())?;
        for depth in [1, 10, 100, 1000] {
            writeln!(
                f,
                "Exposure after {:>4} attempts:        {}",
                depth,
                self.exposure_after_attempts(depth)
            )?;
        }
        writeln!(f, "Exposure (total):                    {}", self.exposure())?;
        match (self.time_to_first_circuit(), self.guards_to_first_circuit()) {
            (Some(secs), Some(guards)) => write!(
                f,
                "First circuit after:                 {} s, {} guards",
                secs, guards
            ),
            _ => write!(f, "First circuit after:                 never"),
        }
    }
}

/// Scenario driver tying a [`SimNetwork`] to a [`GuardManager`].
pub struct Simulation {
    network: Arc<Mutex<SimNetwork>>,
    manager: GuardManager<SimConnector, SimClock>,
    clock: SimClock,
    config: SimulationConfig,
    guards: GuardsConfig,
    client_seed: u64,
}

impl Simulation {
    /// Builds the network and a manager with an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Consensus`] if the initial consensus cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        let sim = &config.simulation;
        let mut seeder = match sim.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let clock = SimClock::new(SIM_EPOCH);
        let network = SimNetwork::new(
            sim,
            &config.guards.dystopic_ports,
            clock.clone(),
            StdRng::seed_from_u64(seeder.gen()),
        );
        let view = network.consensus()?;
        let network = Arc::new(Mutex::new(network));

        let manager = GuardManager::new(
            config.guards.clone(),
            GuardStore::new(),
            view,
            SimConnector::new(Arc::clone(&network)),
            clock.clone(),
        )
        .with_seed(seeder.gen());

        Ok(Self {
            network,
            manager,
            clock,
            config: sim.clone(),
            guards: config.guards.clone(),
            client_seed: seeder.gen(),
        })
    }

    /// A new client with an empty store, for `separate_clients` runs.
    fn fresh_client(&self, view: ConsensusView, n: usize) -> GuardManager<SimConnector, SimClock> {
        GuardManager::new(
            self.guards.clone(),
            GuardStore::new(),
            view,
            SimConnector::new(Arc::clone(&self.network)),
            self.clock.clone(),
        )
        .with_seed(self.client_seed.wrapping_add(n as u64))
    }

    /// The simulated network.
    pub fn network(&self) -> Arc<Mutex<SimNetwork>> {
        Arc::clone(&self.network)
    }

    /// The long-lived guard manager. Unused when clients are separate.
    pub fn manager(&self) -> &GuardManager<SimConnector, SimClock> {
        &self.manager
    }

    /// Runs every period, stopping early if `shutdown` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Consensus`] if a periodic consensus cannot be built.
    pub async fn run(&self, shutdown: &AtomicBool) -> Result<SimulationReport> {
        let separate = self.config.separate_clients;
        let mut report = SimulationReport {
            relays: self.config.total_relays,
            started_at: self.clock.now(),
            clients: usize::from(!separate),
            ..SimulationReport::default()
        };
        let mut consensus = lock(&self.network).consensus()?;

        'periods: for period in 0..self.config.periods {
            for subperiod in 0..self.config.subperiods {
                {
                    let mut net = lock(&self.network);
                    if subperiod % CHURN_EVERY == 0 {
                        net.churn();
                    }
                    net.update_running();
                }

                let client = if separate {
                    report.clients += 1;
                    Some(self.fresh_client(consensus.clone(), report.clients))
                } else {
                    None
                };
                let manager = client.as_ref().unwrap_or(&self.manager);

                for _ in 0..self.config.attempts_per_subperiod {
                    if shutdown.load(Ordering::SeqCst) {
                        break 'periods;
                    }
                    let session = manager.run_session(false, shutdown).await;
                    report.sessions += 1;
                    match &session.result {
                        Ok(circuit) => {
                            report.successes += 1;
                            if let Some(node) = lock(&self.network).node(&circuit.guard) {
                                report.guard_bandwidths.push(node.bandwidth);
                            }
                        }
                        Err(Error::Cancelled) => {
                            report.attempts.extend(session.attempts);
                            break 'periods;
                        }
                        Err(_) => {}
                    }
                    report.attempts.extend(session.attempts);
                    self.clock.advance(SECS_BETWEEN_SESSIONS);
                }
            }

            consensus = lock(&self.network).consensus()?;
            if !separate {
                self.manager.refresh(consensus.clone()).await?;
            }
            debug!(period, "new consensus");
        }

        info!(
            sessions = report.sessions,
            successes = report.successes,
            exposure = report.exposure(),
            "simulation finished"
        );
        Ok(report)
    }
}
