//! Configuration management for entry-guards-rs.
//!
//! Configuration is applied in order: defaults → TOML config file → command-line
//! arguments (which also pick up environment variables), with later sources
//! overriding earlier ones.
//!
//! # Configuration Sources
//!
//! | Source | Priority | Description |
//! |--------|----------|-------------|
//! | Defaults | Lowest | Built-in defaults matching the proposal parameters |
//! | Config File | Medium | TOML file (`--config` or `ENTRY_GUARDS_CONFIG`) |
//! | Environment | High | `ENTRY_GUARDS_STATE`, `ENTRY_GUARDS_CONFIG` |
//! | CLI Arguments | Highest | Command-line flags override all |
//!
//! # Example Configuration File
//!
//! ```toml
//! state_file = "entry-guards.state"
//! loglevel = "notice"
//! # logfile = "/var/log/entry-guards.log"
//! # consensus_file = "/var/lib/tor/ns-all.txt"
//! # weights_file = "/var/lib/tor/cached-microdesc-consensus"
//! circuits = 1
//! refresh_interval_secs = 3600
//!
//! [guards]
//! n_primary_guards = 3
//! num_needed = 1
//! num_dir_needed = 3
//! guards_failover_threshold = 0.02
//! min_bandwidth = 0
//! require_stable = true
//! dystopic_ports = [80, 443]
//! disjoint_pools = false
//! remove_unlisted_after_days = 30
//! remove_offline_after_days = 30
//! guard_lifetime_days = 30
//! connect_timeout_secs = 10
//! primary_guards_retry_interval_secs = 180
//! guards_try_threshold = 0.03
//! guards_try_threshold_window_secs = 7200
//! prioritize_bandwidth = true
//! exclude_nodes = ""
//!
//! [simulation]
//! total_relays = 1000
//! node_reliability = 0.96
//! network_down = false
//! fascist_firewall = false
//! sniper_network = false
//! switching_network = false
//! slow_recovery = false
//! separate_clients = false
//! ```

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Log level for entry-guards-rs output.
///
/// From most to least verbose: [`Debug`](LogLevel::Debug) >
/// [`Info`](LogLevel::Info) > [`Notice`](LogLevel::Notice) >
/// [`Warn`](LogLevel::Warn) > [`Error`](LogLevel::Error).
///
/// ```rust
/// use entry_guards_rs::LogLevel;
///
/// let level: LogLevel = "warning".parse().unwrap();
/// assert_eq!(level, LogLevel::Warn);
/// assert!(LogLevel::Notice < LogLevel::Warn);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Low-level debugging information.
    Debug,
    /// Informational messages about normal operation.
    Info,
    /// Notable events such as guard state changes.
    #[default]
    Notice,
    /// Warning conditions that don't prevent operation.
    Warn,
    /// Error conditions that may impair functionality.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Notice => "NOTICE",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "NOTICE" => Ok(LogLevel::Notice),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" | "ERR" => Ok(LogLevel::Error),
            _ => Err(Error::Config(format!("invalid log level: {}", s))),
        }
    }
}

/// Guard selection parameters.
///
/// # Fields
///
/// | Field | Default | Description |
/// |-------|---------|-------------|
/// | `n_primary_guards` | 3 | Size of the ordered primary guard prefix |
/// | `num_needed` | 1 | Live guards wanted for ordinary circuits |
/// | `num_dir_needed` | 3 | Live guards wanted for directory fetches |
/// | `guards_failover_threshold` | 0.02 | Fraction of a pool tried before failing over |
/// | `min_bandwidth` | 0 | Weight floor on the strictest sampling rung |
/// | `require_stable` | true | Require the Stable flag on the strictest rung |
/// | `dystopic_ports` | 80, 443 | OR ports reachable behind restrictive firewalls |
/// | `disjoint_pools` | false | Keep dystopic relays out of the utopic pool |
/// | `remove_unlisted_after_days` | 30 | Evict guards unlisted this long |
/// | `remove_offline_after_days` | 30 | Evict guards offline this long |
/// | `guard_lifetime_days` | 30 | Evict guards added this long ago |
/// | `connect_timeout_secs` | 10 | Per-attempt connection deadline |
/// | `primary_guards_retry_interval_secs` | 180 | Failed primaries become due again after this |
/// | `guards_try_threshold` | 0.03 | Fraction of guards that may be tried new per window |
/// | `guards_try_threshold_window_secs` | 7200 | Window for `guards_try_threshold` |
/// | `prioritize_bandwidth` | true | Weight sampling by bandwidth rather than uniformly |
/// | `exclude_nodes` | "" | Tor-style ExcludeNodes line |
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardsConfig {
    /// Number of primary guards tried first, in store order.
    #[serde(default = "default_n_primary_guards")]
    pub n_primary_guards: usize,
    /// Number of live guards wanted before a random choice is made.
    #[serde(default = "default_num_needed")]
    pub num_needed: usize,
    /// Same as `num_needed`, for sessions that need directory caches.
    #[serde(default = "default_num_dir_needed")]
    pub num_dir_needed: usize,
    /// Fraction of a pool that may be tried in one state before failing over.
    #[serde(default = "default_guards_failover_threshold")]
    pub guards_failover_threshold: f64,
    /// Minimum consensus weight on the strictest sampling rung.
    #[serde(default)]
    pub min_bandwidth: u64,
    /// Require the Stable flag on the strictest sampling rung.
    #[serde(default = "default_true")]
    pub require_stable: bool,
    /// OR ports considered reachable through restrictive firewalls.
    #[serde(default = "default_dystopic_ports")]
    pub dystopic_ports: Vec<u16>,
    /// Exclude dystopic relays from the utopic pool.
    #[serde(default)]
    pub disjoint_pools: bool,
    /// Days a guard may stay unlisted before eviction.
    #[serde(default = "default_thirty_days")]
    pub remove_unlisted_after_days: u32,
    /// Days a guard may stay offline before eviction.
    #[serde(default = "default_thirty_days")]
    pub remove_offline_after_days: u32,
    /// Days after which a guard is rotated out regardless of status.
    #[serde(default = "default_thirty_days")]
    pub guard_lifetime_days: u32,
    /// Per-attempt connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Seconds after which a failed primary guard is retried ahead of the
    /// current fallback state.
    #[serde(default = "default_primary_guards_retry_interval_secs")]
    pub primary_guards_retry_interval_secs: u64,
    /// Fraction of consensus guards that may be tried as new guards within
    /// the window before sessions fall back to retrying known guards.
    #[serde(default = "default_guards_try_threshold")]
    pub guards_try_threshold: f64,
    /// Length of the `guards_try_threshold` window in seconds.
    #[serde(default = "default_guards_try_threshold_window_secs")]
    pub guards_try_threshold_window_secs: u64,
    /// Draw guards in proportion to bandwidth weight. Uniform when false.
    #[serde(default = "default_true")]
    pub prioritize_bandwidth: bool,
    /// Relays never to use as guards (fingerprints, nicknames, networks).
    #[serde(default)]
    pub exclude_nodes: String,
}

fn default_n_primary_guards() -> usize {
    3
}
fn default_num_needed() -> usize {
    1
}
fn default_num_dir_needed() -> usize {
    3
}
fn default_guards_failover_threshold() -> f64 {
    0.02
}
fn default_true() -> bool {
    true
}
fn default_dystopic_ports() -> Vec<u16> {
    vec![80, 443]
}
fn default_thirty_days() -> u32 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_primary_guards_retry_interval_secs() -> u64 {
    180
}
fn default_guards_try_threshold() -> f64 {
    0.03
}
fn default_guards_try_threshold_window_secs() -> u64 {
    7200
}

impl Default for GuardsConfig {
    fn default() -> Self {
        Self {
            n_primary_guards: default_n_primary_guards(),
            num_needed: default_num_needed(),
            num_dir_needed: default_num_dir_needed(),
            guards_failover_threshold: default_guards_failover_threshold(),
            min_bandwidth: 0,
            require_stable: true,
            dystopic_ports: default_dystopic_ports(),
            disjoint_pools: false,
            remove_unlisted_after_days: default_thirty_days(),
            remove_offline_after_days: default_thirty_days(),
            guard_lifetime_days: default_thirty_days(),
            connect_timeout_secs: default_connect_timeout_secs(),
            primary_guards_retry_interval_secs: default_primary_guards_retry_interval_secs(),
            guards_try_threshold: default_guards_try_threshold(),
            guards_try_threshold_window_secs: default_guards_try_threshold_window_secs(),
            prioritize_bandwidth: true,
            exclude_nodes: String::new(),
        }
    }
}

impl GuardsConfig {
    /// Returns true if `port` is one of the dystopic (firewall-friendly) ports.
    pub fn is_dystopic_port(&self, port: u16) -> bool {
        self.dystopic_ports.contains(&port)
    }
}

/// Scenario parameters for the network simulation.
///
/// Mirrors the knobs of the proposal-259 simulator: how many relays exist,
/// how reliable they are, and which local network condition the client sits
/// behind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationConfig {
    /// Relays in the simulated network at start.
    #[serde(default = "default_total_relays")]
    pub total_relays: usize,
    /// Probability a relay is up after each running-state update.
    #[serde(default = "default_node_reliability")]
    pub node_reliability: f64,
    /// Fraction of relays listening on a dystopic port.
    #[serde(default = "default_fascist_friendly_fraction")]
    pub fascist_friendly_fraction: f64,
    /// Fraction of relays that are hostile.
    #[serde(default = "default_evil_fraction")]
    pub evil_fraction: f64,
    /// All connections fail.
    #[serde(default)]
    pub network_down: bool,
    /// Only dystopic ports are reachable.
    #[serde(default)]
    pub fascist_firewall: bool,
    /// Connections succeed only with `flaky_reliability`.
    #[serde(default)]
    pub flaky_network: bool,
    /// Per-connection success probability of a flaky network.
    #[serde(default = "default_flaky_reliability")]
    pub flaky_reliability: f64,
    /// Connections to non-hostile relays are blocked.
    #[serde(default)]
    pub evil_filtering: bool,
    /// Non-hostile relays are knocked offline after each connection.
    #[serde(default)]
    pub sniper_network: bool,
    /// Pick a new local network condition at every churn event.
    #[serde(default)]
    pub switching_network: bool,
    /// Down relays take an hour rather than a minute before they may come back.
    #[serde(default)]
    pub slow_recovery: bool,
    /// Use a fresh client with an empty guard store for every sub-period.
    #[serde(default)]
    pub separate_clients: bool,
    /// Mean relays added per churn event.
    #[serde(default = "default_avg_new")]
    pub avg_new_per_churn: f64,
    /// Mean relays killed per churn event.
    #[serde(default = "default_avg_del")]
    pub avg_del_per_churn: f64,
    /// Consensus periods (one simulated hour each).
    #[serde(default = "default_periods")]
    pub periods: u32,
    /// Sub-periods per consensus period (two simulated minutes each).
    #[serde(default = "default_periods")]
    pub subperiods: u32,
    /// Circuit build sessions per sub-period.
    #[serde(default = "default_attempts_per_subperiod")]
    pub attempts_per_subperiod: u32,
    /// Seed for reproducible runs. Random when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_total_relays() -> usize {
    1000
}
fn default_node_reliability() -> f64 {
    0.96
}
fn default_fascist_friendly_fraction() -> f64 {
    0.3
}
fn default_evil_fraction() -> f64 {
    0.5
}
fn default_flaky_reliability() -> f64 {
    0.9
}
fn default_avg_new() -> f64 {
    1.5
}
fn default_avg_del() -> f64 {
    0.5
}
fn default_periods() -> u32 {
    30
}
fn default_attempts_per_subperiod() -> u32 {
    6
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            total_relays: default_total_relays(),
            node_reliability: default_node_reliability(),
            fascist_friendly_fraction: default_fascist_friendly_fraction(),
            evil_fraction: default_evil_fraction(),
            network_down: false,
            fascist_firewall: false,
            flaky_network: false,
            flaky_reliability: default_flaky_reliability(),
            evil_filtering: false,
            sniper_network: false,
            switching_network: false,
            slow_recovery: false,
            separate_clients: false,
            avg_new_per_churn: default_avg_new(),
            avg_del_per_churn: default_avg_del(),
            periods: default_periods(),
            subperiods: default_periods(),
            attempts_per_subperiod: default_attempts_per_subperiod(),
            seed: None,
        }
    }
}

/// Main configuration struct for entry-guards-rs.
///
/// # Fields Overview
///
/// | Field | Type | Default | Description |
/// |-------|------|---------|-------------|
/// | `state_file` | `PathBuf` | `"entry-guards.state"` | Guard store persistence file |
/// | `loglevel` | `LogLevel` | `Notice` | Log verbosity level |
/// | `logfile` | `Option<String>` | `None` | Log destination (file, `:syslog:`, or stdout) |
/// | `consensus_file` | `Option<PathBuf>` | `None` | `ns/all` formatted relay list |
/// | `weights_file` | `Option<PathBuf>` | `None` | Consensus holding `bandwidth-weights` |
/// | `circuits` | `u32` | `1` | Circuits to build in live mode |
/// | `refresh_interval_secs` | `u64` | `3600` | Consensus re-read interval |
/// | `simulate` | `bool` | `false` | Run the scenario driver instead |
///
/// ```rust
/// use entry_guards_rs::Config;
///
/// let config = Config::default();
/// assert_eq!(config.guards.n_primary_guards, 3);
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Path to the guard state file.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Log level for output.
    #[serde(default)]
    pub loglevel: LogLevel,
    /// Log file path. None for stdout, ":syslog:" for syslog.
    #[serde(default)]
    pub logfile: Option<String>,
    /// Relay list in control-port `ns/all` format.
    #[serde(default)]
    pub consensus_file: Option<PathBuf>,
    /// Cached consensus holding the `bandwidth-weights` line.
    #[serde(default)]
    pub weights_file: Option<PathBuf>,
    /// Number of circuits to build in live mode.
    #[serde(default = "default_circuits")]
    pub circuits: u32,
    /// Seconds between consensus refreshes.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Run the simulation driver instead of live mode.
    #[serde(default)]
    pub simulate: bool,
    /// Guard selection parameters.
    #[serde(default)]
    pub guards: GuardsConfig,
    /// Simulation scenario parameters.
    #[serde(default)]
    pub simulation: SimulationConfig,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("entry-guards.state")
}
fn default_circuits() -> u32 {
    1
}
fn default_refresh_interval_secs() -> u64 {
    3600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            loglevel: LogLevel::default(),
            logfile: None,
            consensus_file: None,
            weights_file: None,
            circuits: default_circuits(),
            refresh_interval_secs: default_refresh_interval_secs(),
            simulate: false,
            guards: GuardsConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read.
    /// Returns [`Error::Config`] if the TOML is invalid.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Serialize configuration to TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let g = &self.guards;
        if g.n_primary_guards == 0 {
            return Err(Error::Config("n_primary_guards must be at least 1".to_string()));
        }
        if g.num_needed == 0 || g.num_dir_needed == 0 {
            return Err(Error::Config(
                "num_needed and num_dir_needed must be at least 1".to_string(),
            ));
        }
        if !(g.guards_failover_threshold > 0.0 && g.guards_failover_threshold <= 1.0) {
            return Err(Error::Config(
                "guards_failover_threshold must be in (0, 1]".to_string(),
            ));
        }
        if g.dystopic_ports.is_empty() {
            return Err(Error::Config("dystopic_ports must not be empty".to_string()));
        }
        if g.connect_timeout_secs == 0 {
            return Err(Error::Config("connect_timeout_secs must be positive".to_string()));
        }
        if !(g.guards_try_threshold > 0.0 && g.guards_try_threshold <= 1.0) {
            return Err(Error::Config(
                "guards_try_threshold must be in (0, 1]".to_string(),
            ));
        }
        if g.guards_try_threshold_window_secs == 0 {
            return Err(Error::Config(
                "guards_try_threshold_window_secs must be positive".to_string(),
            ));
        }
        let s = &self.simulation;
        for (name, p) in [
            ("node_reliability", s.node_reliability),
            ("fascist_friendly_fraction", s.fascist_friendly_fraction),
            ("evil_fraction", s.evil_fraction),
            ("flaky_reliability", s.flaky_reliability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(Error::Config(format!("{} must be in [0, 1]", name)));
            }
        }
        if s.avg_new_per_churn <= 0.0 || s.avg_del_per_churn <= 0.0 {
            return Err(Error::Config("churn averages must be positive".to_string()));
        }
        if self.refresh_interval_secs == 0 {
            return Err(Error::Config("refresh_interval_secs must be positive".to_string()));
        }
        Ok(())
    }
}

/// Command-line arguments for entry-guards-rs.
///
/// Arguments override configuration file values.
///
/// # Examples
///
/// Build three circuits from a relay list, persisting guard state:
/// ```bash
/// entry-guards-rs --consensus ns-all.txt --weights cached-consensus --circuits 3
/// ```
///
/// Simulate a client behind a port 80/443 firewall:
/// ```bash
/// entry-guards-rs --simulate --fascist-firewall --disjoint-sets --seed 7
/// ```
#[derive(Parser, Debug)]
#[command(name = "entry-guards-rs")]
#[command(about = "Entry guard selection for anonymity network clients")]
#[command(version)]
#[command(
    long_about = "entry-guards-rs chooses, persists, retries and rotates entry guards, \
    falling back from primary guards to utopic, dystopic and retry-only selection, \
    and ships a network simulator to measure exposure and availability."
)]
pub struct CliArgs {
    /// Path to the guard state file.
    #[arg(long = "state", env = "ENTRY_GUARDS_STATE")]
    pub state_file: Option<PathBuf>,

    /// Write default config to file and exit.
    #[arg(long = "generate_config")]
    pub generate_config: Option<PathBuf>,

    /// Log verbosity (DEBUG, INFO, NOTICE, WARN, ERROR).
    #[arg(long)]
    pub loglevel: Option<String>,

    /// Log to file instead of stdout (use ":syslog:" for syslog).
    #[arg(long)]
    pub logfile: Option<String>,

    /// Path to configuration file.
    #[arg(
        long = "config",
        env = "ENTRY_GUARDS_CONFIG",
        default_value = "entry-guards.conf"
    )]
    pub config_file: PathBuf,

    /// Relay list in control-port `ns/all` format.
    #[arg(long = "consensus")]
    pub consensus_file: Option<PathBuf>,

    /// Cached consensus file holding the `bandwidth-weights` line.
    #[arg(long = "weights")]
    pub weights_file: Option<PathBuf>,

    /// Number of circuits to build in live mode.
    #[arg(long)]
    pub circuits: Option<u32>,

    /// Run the network simulation instead of live mode.
    #[arg(long)]
    pub simulate: bool,

    /// Number of relays in the simulated network.
    #[arg(short = 'N', long)]
    pub total_relays: Option<usize>,

    /// Reliability of each simulated relay.
    #[arg(short = 'R', long)]
    pub node_reliability: Option<f64>,

    /// Simulate a network that only allows ports 80 and 443.
    #[arg(short = 'F', long)]
    pub fascist_firewall: bool,

    /// Simulate a flaky local network connection.
    #[arg(short = 'f', long)]
    pub flaky_network: bool,

    /// Simulate a network that blocks connections to non-hostile relays.
    #[arg(short = 'e', long)]
    pub evil_filtering: bool,

    /// Simulate a network that knocks out non-hostile relays after each connection.
    #[arg(short = 's', long)]
    pub sniper_network: bool,

    /// Simulate a network that is completely down.
    #[arg(short = 'd', long)]
    pub network_down: bool,

    /// Simulate a network whose condition changes at every churn.
    #[arg(short = 'S', long)]
    pub switching_network: bool,

    /// Simulate relays that stay down for an hour once they fail.
    #[arg(long)]
    pub slow_recovery: bool,

    /// Use a separate, fresh client for each sub-period.
    #[arg(short = 'C', long)]
    pub separate_clients: bool,

    /// Keep dystopic relays out of the utopic pool.
    #[arg(short = 'D', long)]
    pub disjoint_sets: bool,

    /// Sample guards uniformly instead of by bandwidth.
    #[arg(short = 'r', long)]
    pub no_prioritize_bandwidth: bool,

    /// Seed for reproducible simulation runs.
    #[arg(long)]
    pub seed: Option<u64>,
}

impl CliArgs {
    /// Apply CLI arguments to a configuration, overriding values.
    pub fn apply_to(&self, config: &mut Config) -> Result<()> {
        if let Some(ref state_file) = self.state_file {
            config.state_file = state_file.clone();
        }
        if let Some(ref loglevel) = self.loglevel {
            config.loglevel = loglevel.parse()?;
        }
        if let Some(ref logfile) = self.logfile {
            config.logfile = Some(logfile.clone());
        }
        if let Some(ref consensus) = self.consensus_file {
            config.consensus_file = Some(consensus.clone());
        }
        if let Some(ref weights) = self.weights_file {
            config.weights_file = Some(weights.clone());
        }
        if let Some(circuits) = self.circuits {
            config.circuits = circuits;
        }
        if self.simulate {
            config.simulate = true;
        }
        if self.disjoint_sets {
            config.guards.disjoint_pools = true;
        }
        if self.no_prioritize_bandwidth {
            config.guards.prioritize_bandwidth = false;
        }

        let sim = &mut config.simulation;
        if let Some(n) = self.total_relays {
            sim.total_relays = n;
        }
        if let Some(r) = self.node_reliability {
            sim.node_reliability = r;
        }
        sim.fascist_firewall |= self.fascist_firewall;
        sim.flaky_network |= self.flaky_network;
        sim.evil_filtering |= self.evil_filtering;
        sim.sniper_network |= self.sniper_network;
        sim.network_down |= self.network_down;
        sim.switching_network |= self.switching_network;
        sim.slow_recovery |= self.slow_recovery;
        sim.separate_clients |= self.separate_clients;
        if self.seed.is_some() {
            sim.seed = self.seed;
        }
        Ok(())
    }
}

/// Load configuration from file and CLI arguments.
///
/// # Errors
///
/// Returns [`Error::Config`] if configuration is invalid.
pub fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = Config::default();

    if args.config_file.exists() {
        config = Config::from_file(&args.config_file)?;
    }

    args.apply_to(&mut config)?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.guards.dystopic_ports, vec![80, 443]);
        assert_eq!(config.guards.remove_unlisted_after_days, 30);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("ERR".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Notice.to_string(), "NOTICE");
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = Config::default();
        config.guards.disjoint_pools = true;
        config.simulation.seed = Some(42);
        let text = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "circuits = 4\n[guards]\nn_primary_guards = 5").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.circuits, 4);
        assert_eq!(config.guards.n_primary_guards, 5);
        assert_eq!(config.guards.num_dir_needed, 3);
        assert_eq!(config.simulation.total_relays, 1000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.guards.n_primary_guards = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.guards.guards_failover_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.simulation.node_reliability = -0.1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.guards.dystopic_ports.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.guards.guards_try_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.guards.guards_try_threshold_window_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_simulation_scenarios() {
        let args = CliArgs::parse_from(["entry-guards-rs", "-S", "-C", "-r", "--slow-recovery"]);
        let mut config = Config::default();
        args.apply_to(&mut config).unwrap();

        assert!(config.simulation.switching_network);
        assert!(config.simulation.separate_clients);
        assert!(config.simulation.slow_recovery);
        assert!(!config.guards.prioritize_bandwidth);

        let defaults = Config::default();
        assert!(defaults.guards.prioritize_bandwidth);
        assert_eq!(defaults.guards.primary_guards_retry_interval_secs, 180);
        assert_eq!(defaults.guards.guards_try_threshold_window_secs, 7200);
    }

    #[test]
    fn test_cli_overrides() {
        let args = CliArgs::parse_from([
            "entry-guards-rs",
            "--state",
            "/tmp/g.state",
            "--simulate",
            "--fascist-firewall",
            "-D",
            "--seed",
            "9",
            "--loglevel",
            "debug",
        ]);
        let mut config = Config::default();
        args.apply_to(&mut config).unwrap();

        assert_eq!(config.state_file, PathBuf::from("/tmp/g.state"));
        assert!(config.simulate);
        assert!(config.simulation.fascist_firewall);
        assert!(config.guards.disjoint_pools);
        assert_eq!(config.simulation.seed, Some(9));
        assert_eq!(config.loglevel, LogLevel::Debug);
    }

    #[test]
    fn test_cli_rejects_bad_loglevel() {
        let args = CliArgs::parse_from(["entry-guards-rs", "--loglevel", "shout"]);
        let mut config = Config::default();
        assert!(args.apply_to(&mut config).is_err());
    }
}
