//! warmpoold — the warm-pool daemon.
//!
//! One process per replica. Assembles the subsystems described in the
//! config file:
//! - State store (redb locally, PostgreSQL when distributed)
//! - Pool registry + drivers
//! - Pool manager and instance purger
//! - Outbox processor, predictor, and scaler
//! - Scheduler for the periodic jobs
//!
//! # Usage
//!
//! ```text
//! warmpoold run --config /etc/warmpool/warmpool.toml
//! warmpoold check-config --config warmpool.toml
//! ```

mod daemon;
mod wiring;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use warmpool_core::WarmpoolConfig;

#[derive(Parser)]
#[command(name = "warmpoold", about = "Warm pool orchestrator for ephemeral build VMs")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon until interrupted.
    Run {
        /// Path to the TOML config file.
        #[arg(long, default_value = "warmpool.toml")]
        config: PathBuf,
    },
    /// Validate a config file and print its pools.
    CheckConfig {
        #[arg(long, default_value = "warmpool.toml")]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,warmpoold=debug,warmpool=debug"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { config } => {
            let config = WarmpoolConfig::from_file(&config)?;
            daemon::run(config).await
        }
        Command::CheckConfig { config } => {
            let config = WarmpoolConfig::from_file(&config)?;
            print!("{}", daemon::describe(&config));
            Ok(())
        }
    }
}
