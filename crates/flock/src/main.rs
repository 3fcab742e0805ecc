//! Flock: federation task scheduler
//!
//! Main binary with subcommands:
//! - `run`: Drive the activity graphs over an in-memory store
//! - `graphs`: Print the registered state graphs

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flock_activities::ActivitiesConfig;
use flock_stator::{RetryPolicy, RunnerConfig};

mod daemon;
mod graphs;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "flock")]
#[command(about = "Federation task scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run {
        /// JSON fixture with identities, posts and an inbox of activities
        #[arg(long, env = "FLOCK_FIXTURE")]
        fixture: Option<PathBuf>,

        /// Log deliveries instead of sending them.
        /// Accepts "1", "true", "yes", or "on".
        #[arg(long, env = "FLOCK_DRY_RUN", value_parser = parse_bool_env, default_value = "false")]
        dry_run: bool,

        /// Maximum attempts in flight at once
        #[arg(long, env = "FLOCK_CONCURRENCY", default_value = "50")]
        concurrency: usize,

        /// Maximum instances claimed from one graph per pass
        #[arg(long, env = "FLOCK_CONCURRENCY_PER_GRAPH", default_value = "20")]
        concurrency_per_graph: usize,

        /// Housekeeping interval in seconds
        #[arg(long, env = "FLOCK_SCHEDULE_INTERVAL", default_value = "30")]
        schedule_interval: u64,

        /// Seconds a claim is held before it may be taken over
        #[arg(long, env = "FLOCK_LOCK_EXPIRY", default_value = "300")]
        lock_expiry: u64,

        /// Idle pause between passes in milliseconds
        #[arg(long, env = "FLOCK_LOOP_DELAY_MS", default_value = "500")]
        loop_delay_ms: u64,

        /// Stop after this many seconds
        #[arg(long, env = "FLOCK_RUN_FOR")]
        run_for: Option<u64>,

        /// File touched on every housekeeping pass
        #[arg(long, env = "FLOCK_LIVENESS_FILE")]
        liveness_file: Option<PathBuf>,

        /// Keep running after a fatal attempt error
        #[arg(long, env = "FLOCK_KEEP_GOING", value_parser = parse_bool_env, default_value = "false")]
        keep_going: bool,

        /// Warn once an instance has been attempted this many times in one state
        #[arg(long, env = "FLOCK_ATTEMPT_WARNING")]
        attempt_warning: Option<u32>,

        /// Double retry intervals up to this many times (fixed intervals if unset)
        #[arg(long, env = "FLOCK_BACKOFF_DOUBLINGS")]
        backoff_doublings: Option<u32>,

        /// Longest retry interval in seconds when backing off
        #[arg(long, env = "FLOCK_BACKOFF_CEILING", default_value = "86400")]
        backoff_ceiling: i64,

        /// Seconds before hashtag statistics are recomputed
        #[arg(long, env = "FLOCK_HASHTAG_STATS_MAX_AGE", default_value = "86400")]
        hashtag_stats_max_age: i64,

        /// Seconds a fan-out keeps retrying before it fails
        #[arg(long, env = "FLOCK_FAN_OUT_TIMEOUT", default_value = "259200")]
        fan_out_timeout: i64,
    },

    /// Print every state graph with its states and edges
    Graphs,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "flock=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            fixture,
            dry_run,
            concurrency,
            concurrency_per_graph,
            schedule_interval,
            lock_expiry,
            loop_delay_ms,
            run_for,
            liveness_file,
            keep_going,
            attempt_warning,
            backoff_doublings,
            backoff_ceiling,
            hashtag_stats_max_age,
            fan_out_timeout,
        } => {
            let retry = match backoff_doublings {
                Some(max_doublings) => RetryPolicy::Exponential {
                    max_doublings,
                    ceiling_secs: backoff_ceiling,
                },
                None => RetryPolicy::Fixed,
            };
            let options = daemon::RunOptions {
                fixture,
                dry_run,
                runner: RunnerConfig {
                    concurrency,
                    concurrency_per_graph,
                    schedule_interval_secs: schedule_interval,
                    lock_expiry_secs: lock_expiry,
                    loop_delay_ms,
                    run_for_secs: run_for,
                    liveness_file,
                    halt_on_fatal: !keep_going,
                    attempt_warning,
                },
                activities: ActivitiesConfig {
                    hashtag_stats_max_age_secs: hashtag_stats_max_age,
                    fan_out_timeout_secs: fan_out_timeout,
                },
                retry,
            };
            daemon::run(options).await.map(|_| ())
        }
        Commands::Graphs => {
            print!("{}", graphs::describe_all()?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_env() {
        assert_eq!(parse_bool_env("YES"), Ok(true));
        assert_eq!(parse_bool_env("on"), Ok(true));
        assert_eq!(parse_bool_env(""), Ok(false));
        assert!(parse_bool_env("maybe").is_err());
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "flock",
            "run",
            "--run-for",
            "5",
            "--backoff-doublings",
            "4",
        ])
        .unwrap();
        let Commands::Run {
            run_for,
            backoff_doublings,
            concurrency,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(run_for, Some(5));
        assert_eq!(backoff_doublings, Some(4));
        assert_eq!(concurrency, 50);
    }
}
