//! entry-guards-rs command-line entry point.
//!
//! ```text
//!   parse CLI ──► --generate_config? ──yes──► write defaults, exit
//!                        │ no
//!                        ▼
//!                  load config  ◄── defaults → file → CLI / env
//!                        │
//!                        ▼
//!                  init logging
//!                        │
//!                        ▼
//!                control::run_main ──► simulation or live mode
//! ```
//!
//! # Usage
//!
//! ```bash
//! # Simulate 1000 relays behind a port 80/443 firewall
//! entry-guards-rs --simulate -F --seed 7
//!
//! # Pick guards from a relay list and try three circuits
//! entry-guards-rs --consensus ns-all.txt --weights cached-consensus --circuits 3
//!
//! # Write the default configuration
//! entry-guards-rs --generate_config entry-guards.conf
//! ```
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | Error (see stderr) |
//!
//! # Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `ENTRY_GUARDS_STATE` | Path to the guard state file (`--state`) |
//! | `ENTRY_GUARDS_CONFIG` | Path to the config file (`--config`) |

use clap::Parser;
use std::process::ExitCode;

use entry_guards_rs::{config, control, logger, plog_fmt, CliArgs, Config, LogLevel};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> entry_guards_rs::Result<()> {
    let args = CliArgs::parse();

    if let Some(ref output_path) = args.generate_config {
        let config = Config::default();
        std::fs::write(output_path, config.to_toml()?)?;
        println!("Wrote default config to {}", output_path.display());
        return Ok(());
    }

    let config = config::load_config(&args)?;

    logger::init(config.loglevel, config.logfile.as_deref())?;

    plog_fmt!(LogLevel::Notice, "entry-guards-rs {} starting", control::VERSION);
    plog_fmt!(LogLevel::Debug, "State file: {}", config.state_file.display());
    plog_fmt!(
        LogLevel::Debug,
        "Primary guards: {}, failover threshold: {}",
        config.guards.n_primary_guards,
        config.guards.guards_failover_threshold
    );
    if config.guards.disjoint_pools {
        logger::plog(LogLevel::Info, "Utopic and dystopic pools are disjoint");
    }

    control::run_main(config).await
}
