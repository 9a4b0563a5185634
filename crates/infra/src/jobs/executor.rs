//! Job executor: claims records and applies each job's reschedule decision.

use std::io;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use hubjobs_jobs::{
    Completion, JobError, JobQueue, JobRecord, JobRegistry, JobStatus, NextRun, QueueError,
};

use super::error_log::{ErrorEntry, ErrorLogStore};

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often to poll for new jobs
    pub poll_interval: Duration,
    /// Name for logging
    pub name: String,
    /// Queues to serve, in tie-break order; empty means every registered queue.
    pub queue_names: Vec<String>,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "job-executor".to_string(),
            queue_names: Vec::new(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_queues<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queue_names = names.into_iter().map(Into::into).collect();
        self
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Request graceful shutdown. The job in progress, if any, runs to completion.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_rescheduled: u64,
    pub jobs_canceled: u64,
    pub jobs_failed: u64,
    pub jobs_skipped: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    fn record(&mut self, outcome: &Outcome) {
        self.jobs_processed += 1;
        match outcome {
            Outcome::Succeeded { rescheduled } => {
                self.jobs_succeeded += 1;
                if rescheduled.is_some() {
                    self.jobs_rescheduled += 1;
                }
            }
            Outcome::Canceled => self.jobs_canceled += 1,
            Outcome::Failed { .. } => self.jobs_failed += 1,
            Outcome::Skipped => self.jobs_skipped += 1,
        }
    }
}

/// What happened to one claimed record.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Terminated successfully; `rescheduled` is the next run, if one was created.
    Succeeded { rescheduled: Option<JobRecord> },
    /// The job had nothing to do and was canceled.
    Canceled,
    /// `run` or `on_success` failed; the record is in the error log.
    Failed { error: String },
    /// The record was canceled or deleted after being claimed; nothing ran.
    Skipped,
}

/// Background job executor.
///
/// Claims records from a [`JobQueue`], runs the behavior registered for their
/// queue name and applies its [`NextRun`] decision.
pub struct JobExecutor<Q, L> {
    queue: Q,
    errors: L,
    registry: JobRegistry,
}

impl<Q: JobQueue, L: ErrorLogStore> JobExecutor<Q, L> {
    pub fn new(queue: Q, errors: L, registry: JobRegistry) -> Self {
        Self {
            queue,
            errors,
            registry,
        }
    }

    /// Spawn the executor in a background thread.
    pub fn spawn(self, config: JobExecutorConfig) -> io::Result<JobExecutorHandle>
    where
        Q: 'static,
        L: 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || {
                executor_loop(self, config, shutdown_rx, stats_clone);
            })?;

        Ok(JobExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    /// Claim and execute the next due record of `queue_names`, if any.
    pub fn run_next(
        &self,
        queue_names: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<(JobRecord, Outcome)>, QueueError> {
        let Some(mut record) = self.queue.claim_next(queue_names, now)? else {
            return Ok(None);
        };
        debug!(job_id = %record.id, queue = %record.queue_name, identifier = %record.identifier, "claimed job");
        let outcome = self.execute_one(&mut record)?;
        Ok(Some((record, outcome)))
    }

    /// Execute a claimed record (for testing or synchronous use).
    pub fn execute_one(&self, record: &mut JobRecord) -> Result<Outcome, QueueError> {
        match self.queue.get(record.id)? {
            Some(stored) if stored.status != JobStatus::Canceled => {}
            _ => {
                debug!(job_id = %record.id, "job canceled before it ran");
                return Ok(Outcome::Skipped);
            }
        }

        let result = match self.registry.get(&record.queue_name) {
            Some(behavior) => behavior.execute(&self.queue, record),
            None => Err(JobError::Unregistered(record.queue_name.clone())),
        };

        match result {
            Ok(completion) => self.apply(record, completion),
            Err(e) => self.fail(record, &e),
        }
    }

    fn apply(&self, record: &mut JobRecord, completion: Completion) -> Result<Outcome, QueueError> {
        let message = if completion.message_addon.is_empty() {
            "done".to_string()
        } else {
            format!("done {}", completion.message_addon)
        };

        match completion.next {
            NextRun::Done => {
                self.queue.complete(record, &message)?;
                info!(job_id = %record.id, queue = %record.queue_name, identifier = %record.identifier, "{message}");
                Ok(Outcome::Succeeded { rescheduled: None })
            }
            NextRun::After(delay) => {
                self.queue.complete(record, &message)?;
                let next = self.queue.clone_job(record, delay)?;
                match &next {
                    Some(next) => info!(
                        job_id = %record.id,
                        queue = %record.queue_name,
                        identifier = %record.identifier,
                        next_job_id = %next.id,
                        delay_secs = delay.as_secs(),
                        "{message}"
                    ),
                    None => info!(
                        job_id = %record.id,
                        queue = %record.queue_name,
                        identifier = %record.identifier,
                        "{message} (next run already queued)"
                    ),
                }
                Ok(Outcome::Succeeded { rescheduled: next })
            }
            NextRun::Cancel => {
                record.mark_canceled();
                record.message = Some(message.clone());
                self.queue.update(record)?;
                info!(job_id = %record.id, queue = %record.queue_name, identifier = %record.identifier, "{message}, canceled");
                Ok(Outcome::Canceled)
            }
        }
    }

    fn fail(&self, record: &mut JobRecord, error: &JobError) -> Result<Outcome, QueueError> {
        let message = error.to_string();
        warn!(job_id = %record.id, queue = %record.queue_name, identifier = %record.identifier, error = %message, "job failed");
        self.queue.fail(record, &message)?;
        if let Err(e) = self
            .errors
            .append(ErrorEntry::for_record(record, Utc::now(), message.clone()))
        {
            error!(job_id = %record.id, error = %e, "failed to append to error log");
        }
        Ok(Outcome::Failed { error: message })
    }
}

fn executor_loop<Q: JobQueue, L: ErrorLogStore>(
    executor: JobExecutor<Q, L>,
    config: JobExecutorConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    let queue_names: Vec<String> = if config.queue_names.is_empty() {
        executor.registry.queue_names().map(String::from).collect()
    } else {
        config.queue_names.clone()
    };
    info!(executor = %config.name, queues = ?queue_names, "job executor started");
    let start_time = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        {
            let mut s = stats.lock().unwrap();
            s.uptime_secs = start_time.elapsed().as_secs();
            s.current_running = 1;
        }

        let result = executor.run_next(&queue_names, Utc::now());

        {
            let mut s = stats.lock().unwrap();
            s.current_running = 0;
            if let Ok(Some((_, outcome))) = &result {
                s.record(outcome);
            }
        }

        match result {
            Ok(Some(_)) => {}
            Ok(None) => thread::sleep(config.poll_interval),
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to run job");
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(executor = %config.name, "job executor stopped");
}
