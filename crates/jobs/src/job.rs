use std::time::Duration;

use thiserror::Error;

use crate::collaborators::{ApiError, DirectoryError};
use crate::queue::{JobQueue, QueueError};
use crate::record::JobRecord;

/// What happens to a job once `on_success` has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRun {
    /// Terminate; the record stays in the success log.
    Done,
    /// Clone the record, delayed by the given duration.
    After(Duration),
    /// The job had nothing to do; mark it canceled and do not clone it.
    Cancel,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Remote(#[from] ApiError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("no job registered for queue {0}")]
    Unregistered(String),

    #[error("invalid job record: {0}")]
    Invalid(String),
}

/// A background job type.
///
/// Implementations are behavior objects: the persisted state lives in the
/// [`JobRecord`], collaborators are injected into the implementing struct.
pub trait Job: Send + Sync + 'static {
    /// Queue name, unique for the whole application.
    const QUEUE_NAME: &'static str;

    type Output: Send;

    /// Perform the work. Must tolerate at-least-once execution.
    fn run(&self, queue: &dyn JobQueue, record: &JobRecord) -> Result<Self::Output, JobError>;

    /// Called exactly once after a successful [`Job::run`].
    ///
    /// May set derived fields on `record`; the caller persists them.
    fn on_success(
        &self,
        queue: &dyn JobQueue,
        record: &mut JobRecord,
        output: &Self::Output,
    ) -> Result<NextRun, JobError>;

    /// Short description of the result for log lines.
    fn success_message_addon(&self, _record: &JobRecord, _output: &Self::Output) -> String {
        String::new()
    }
}

/// Result of a successful execution, as seen by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub next: NextRun,
    pub message_addon: String,
}

/// Type-erased [`Job`], as stored in a [`crate::JobRegistry`].
pub trait JobBehavior: Send + Sync {
    fn queue_name(&self) -> &'static str;

    /// `run` then `on_success`.
    fn execute(&self, queue: &dyn JobQueue, record: &mut JobRecord)
    -> Result<Completion, JobError>;
}

impl<J: Job> JobBehavior for J {
    fn queue_name(&self) -> &'static str {
        J::QUEUE_NAME
    }

    fn execute(
        &self,
        queue: &dyn JobQueue,
        record: &mut JobRecord,
    ) -> Result<Completion, JobError> {
        let output = self.run(queue, record)?;
        let next = self.on_success(queue, record, &output)?;
        Ok(Completion {
            next,
            message_addon: self.success_message_addon(record, &output),
        })
    }
}
