//! Wiring of the Redis stores, the GitHub client and the job registry.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use hubjobs_infra::cleanup::{CleanupOptions, CleanupSummary, clean_all};
use hubjobs_infra::config::WorkerConfig;
use hubjobs_infra::github::GithubClient;
use hubjobs_infra::jobs::{JobExecutor, JobExecutorConfig, JobExecutorHandle};
use hubjobs_infra::redis::{RedisErrorLog, RedisJobQueue, RedisRepositoryDirectory, RedisTokenDirectory};
use hubjobs_jobs::JobRegistry;
use hubjobs_jobs::kinds::{CheckRepositoryHook, FetchRepositoryEvents, ResetTokenFlags};

pub struct Worker {
    config: WorkerConfig,
    queue: RedisJobQueue,
    errors: RedisErrorLog,
    registry: JobRegistry,
}

impl Worker {
    pub fn connect(config: WorkerConfig) -> anyhow::Result<Self> {
        let queue = RedisJobQueue::new(&config.redis_url).context("job queue")?;
        let errors = RedisErrorLog::new(&config.redis_url).context("error log")?;
        let repositories = Arc::new(
            RedisRepositoryDirectory::new(&config.redis_url).context("repository directory")?,
        );
        let tokens =
            Arc::new(RedisTokenDirectory::new(&config.redis_url).context("token directory")?);
        let github = Arc::new(GithubClient::from_config(&config).context("github client")?);

        // Rate-limited polls and checks hand the token to `ResetTokenFlags`.
        let registry = JobRegistry::new()
            .register(FetchRepositoryEvents::new(
                github.clone(),
                repositories.clone(),
                tokens.clone(),
            ))
            .register(CheckRepositoryHook::new(github, repositories, tokens.clone()))
            .register(ResetTokenFlags::new(tokens));

        Ok(Self {
            config,
            queue,
            errors,
            registry,
        })
    }

    /// Start the executor on its own thread.
    pub fn spawn(self, queues: Vec<String>) -> anyhow::Result<JobExecutorHandle> {
        let executor_config = JobExecutorConfig::default()
            .with_name("hubjobs-worker")
            .with_poll_interval(self.config.poll_interval)
            .with_queues(queues);
        JobExecutor::new(self.queue, self.errors, self.registry)
            .spawn(executor_config)
            .context("failed to start job executor")
    }

    pub fn cleanup(&self, options: &CleanupOptions) -> anyhow::Result<CleanupSummary> {
        let summary = clean_all(&self.queue, &self.errors, &self.registry, options)?;
        info!(
            error_log_deleted = summary.error_log.deleted,
            error_log_errors = summary.error_log.errors,
            jobs_deleted = summary.jobs.deleted,
            jobs_kept = summary.jobs.kept,
            jobs_errors = summary.jobs.errors,
            "cleanup finished"
        );
        Ok(summary)
    }

    /// Clear the success and error logs of every priority queue of `name`.
    pub fn reset_queue(&self, name: &str) -> anyhow::Result<usize> {
        use hubjobs_jobs::JobQueue;

        let keys = self.queue.queue_keys(name)?;
        for key in &keys {
            self.queue.reset_logs(key)?;
            info!(queue = %key, "queue logs reset");
        }
        Ok(keys.len())
    }
}
