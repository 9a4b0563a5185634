use clap::{Parser, Subcommand};

use hubjobs_infra::cleanup::CleanupOptions;

/// Largest `--batch-size` accepted; one page is loaded in a single round trip.
pub const MAX_BATCH_SIZE: u64 = 100_000;

/// Background worker for the issue tracker's recurring GitHub jobs.
///
/// Connection settings come from the environment (`REDIS_URL`, `GITHUB_TOKEN`,
/// `GITHUB_TOKEN_ID`, `GITHUB_API_URL`, `GITHUB_HOOK_URL`, `HUBJOBS_POLL_INTERVAL_MS`,
/// `HUBJOBS_LOG_FORMAT`).
#[derive(Parser, Debug)]
#[command(name = "hubjobs-worker", version)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Cmd {
    /// Run jobs until interrupted.
    Run {
        /// Queues to serve, highest tie-break first. Defaults to every job type.
        #[arg(long = "queue")]
        queues: Vec<String>,
    },
    /// Delete old error-log entries and finished job records.
    Cleanup {
        /// Log progress every N deletions (0 disables).
        #[arg(long, default_value_t = 1000)]
        print_step: usize,
        /// Keep everything from the last N days.
        #[arg(long, default_value_t = 7)]
        keep_days: u32,
        /// Records fetched per page.
        #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u64).range(1..=MAX_BATCH_SIZE))]
        batch_size: u64,
    },
    /// Clear the success and error logs of every priority queue of a job type.
    ResetQueue { name: String },
}

impl Cmd {
    pub fn cleanup_options(&self) -> Option<CleanupOptions> {
        match *self {
            Cmd::Cleanup {
                print_step,
                keep_days,
                batch_size,
            } => Some(CleanupOptions {
                print_step,
                keep_days,
                batch_size: usize::try_from(batch_size).unwrap_or(usize::MAX),
            }),
            _ => None,
        }
    }
}
