mod app;
mod cli;

use anyhow::Context;
use clap::Parser;

use hubjobs_infra::config::WorkerConfig;

use crate::app::Worker;
use crate::cli::{Cli, Cmd};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = WorkerConfig::from_env()?;
    hubjobs_observability::init(config.log_format);

    let worker = Worker::connect(config)?;
    match cli.cmd {
        Cmd::Run { queues } => {
            let handle = worker.spawn(queues)?;
            wait_for_ctrl_c()?;
            tracing::info!("shutting down, waiting for the running job");
            let stats = handle.stats();
            handle.shutdown();
            tracing::info!(
                processed = stats.jobs_processed,
                succeeded = stats.jobs_succeeded,
                failed = stats.jobs_failed,
                uptime_secs = stats.uptime_secs,
                "worker stopped"
            );
        }
        cmd @ Cmd::Cleanup { .. } => {
            if let Some(options) = cmd.cleanup_options() {
                worker.cleanup(&options)?;
            }
        }
        Cmd::ResetQueue { name } => {
            let reset = worker.reset_queue(&name)?;
            if reset == 0 {
                tracing::warn!(queue = %name, "no such queue");
            }
        }
    }
    Ok(())
}

/// Block the main thread until Ctrl-C. The GitHub client is blocking, so
/// the runtime only lives here and never hosts job execution.
fn wait_for_ctrl_c() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for ctrl-c")
}
