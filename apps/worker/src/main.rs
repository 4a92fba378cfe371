//! spotter worker: trigger runtime and administrative consistency scripts.
//!
//! Usage:
//!   spotter-worker run
//!   spotter-worker audit [--apply]
//!   spotter-worker sweep
//!
//! Environment variables:
//!   SPOTTER_DB_PATH - database directory or `.db` file (default: ./data)
//!   SPOTTER_ROUTINE_REQUEST_TTL_HOURS - routine request lifetime (default: 72)
//!   SPOTTER_SWEEP_INTERVAL_SECS - expiry sweep and catch-up period (default: 900)
//!   RUST_LOG - log filter (default: spotter=info)

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use spotter_core::config::{DEFAULT_EXPIRY_SWEEP_INTERVAL_SECS, DEFAULT_ROUTINE_REQUEST_TTL_HOURS};
use spotter_core::RelationshipPolicy;

#[derive(Parser, Debug)]
#[command(name = "spotter-worker")]
#[command(about = "Trigger runtime and consistency scripts for spotter")]
#[command(version)]
struct Args {
    /// Database directory, or a path ending in `.db`
    #[arg(long, env = "SPOTTER_DB_PATH", default_value = "./data", global = true)]
    db_path: String,

    /// Hours before an unanswered routine request expires
    #[arg(long, env = "SPOTTER_ROUTINE_REQUEST_TTL_HOURS", default_value_t = DEFAULT_ROUTINE_REQUEST_TTL_HOURS, global = true)]
    ttl_hours: i64,

    /// Seconds between expiry sweeps in `run`
    #[arg(long, env = "SPOTTER_SWEEP_INTERVAL_SECS", default_value_t = DEFAULT_EXPIRY_SWEEP_INTERVAL_SECS, global = true)]
    sweep_interval_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Follow the change feed and run triggers until interrupted
    Run,
    /// Report relationship inconsistencies; writes fixes only with --apply
    Audit {
        #[arg(long)]
        apply: bool,
    },
    /// Expire lingering routine requests once
    Sweep,
}

impl Args {
    fn policy(&self) -> RelationshipPolicy {
        RelationshipPolicy {
            routine_request_ttl_hours: self.ttl_hours,
            expiry_sweep_interval_secs: self.sweep_interval_secs,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("spotter=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let policy = args.policy();
    let store = commands::open_store(&args.db_path)?;

    match args.command {
        Command::Run => commands::run(store, policy).await,
        Command::Audit { apply } => commands::audit(store, policy, apply).await,
        Command::Sweep => commands::sweep(store, policy).await.map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_is_a_dry_run_unless_asked() {
        let args = Args::try_parse_from(["spotter-worker", "audit"]).unwrap();
        assert_eq!(args.command, Command::Audit { apply: false });

        let args = Args::try_parse_from(["spotter-worker", "audit", "--apply"]).unwrap();
        assert_eq!(args.command, Command::Audit { apply: true });
    }

    #[test]
    fn flags_feed_the_policy() {
        let args = Args::try_parse_from([
            "spotter-worker",
            "--ttl-hours",
            "24",
            "sweep",
            "--sweep-interval-secs",
            "60",
        ])
        .unwrap();
        let policy = args.policy();
        assert_eq!(policy.routine_request_ttl_hours, 24);
        assert_eq!(policy.expiry_sweep_interval_secs, 60);
        assert_eq!(policy.max_partners, 1);
        assert_eq!(args.command, Command::Sweep);
    }
}
