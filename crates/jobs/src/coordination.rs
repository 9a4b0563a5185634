//! Coordination between job families working on the same entity.
//!
//! A repository is either polled ([`FetchRepositoryEvents`]) or fed by its
//! webhook; [`CheckRepositoryHook`] switches between the two with these helpers.
//! Jobs that hit the API rate limit hand the token over to [`ResetTokenFlags`].
//!
//! [`FetchRepositoryEvents`]: crate::kinds::FetchRepositoryEvents
//! [`CheckRepositoryHook`]: crate::kinds::CheckRepositoryHook
//! [`ResetTokenFlags`]: crate::kinds::ResetTokenFlags

use std::time::Duration;

use tracing::{debug, warn};

use hubjobs_core::Identifier;

use crate::collaborators::TokenDirectory;
use crate::job::{Job, JobError};
use crate::kinds::ResetTokenFlags;
use crate::policy::{RATE_LIMIT_FALLBACK, token_reset_delay};
use crate::queue::{JobQueue, QueueError};
use crate::record::{JobRecord, JobStatus, NewJob};

/// Cancel every queued (waiting or delayed) record of `queue_name` for `identifier`.
///
/// Running and finished records are left alone, including one claimed
/// between the lookup and the cancel. Returns the number canceled.
pub fn cancel_queued(
    queue: &dyn JobQueue,
    queue_name: &str,
    identifier: &Identifier,
) -> Result<usize, QueueError> {
    let mut canceled = 0;
    for record in queue.find(queue_name, identifier, &JobStatus::QUEUED)? {
        if queue.cancel_if_queued(record.id)? {
            canceled += 1;
            debug!(job_id = %record.id, queue = queue_name, identifier = %identifier, "canceled queued job");
        } else {
            debug!(job_id = %record.id, queue = queue_name, identifier = %identifier, "job left the queue before cancel");
        }
    }
    Ok(canceled)
}

/// Enqueue `job` unless a record with the same queue name and identifier is queued.
///
/// The existence check runs first; [`JobQueue::enqueue_unique`] guards
/// against a concurrent caller inserting between the check and the insert.
pub fn ensure_enqueued(queue: &dyn JobQueue, job: NewJob) -> Result<Option<JobRecord>, QueueError> {
    let existing = queue.find(&job.queue_name, &job.identifier, &JobStatus::QUEUED)?;
    if !existing.is_empty() {
        return Ok(None);
    }
    queue.enqueue_unique(job)
}

/// Record that `token` is rate limited for `reset_in` seconds and make sure one
/// [`ResetTokenFlags`] job will restore it.
///
/// Returns how long the rate-limited caller should wait before its next try.
/// Without a token (anonymous requests) nothing is recorded.
pub fn note_rate_limit(
    queue: &dyn JobQueue,
    tokens: &dyn TokenDirectory,
    token: Option<&Identifier>,
    reset_in: Option<u64>,
) -> Result<Duration, JobError> {
    let ttl = reset_in.unwrap_or(RATE_LIMIT_FALLBACK);
    let delay = token_reset_delay(Some(ttl));
    let Some(token) = token else {
        warn!(ttl, "anonymous requests rate limited");
        return Ok(delay);
    };
    tokens.mark_rate_limited(token, ttl)?;
    let reset = NewJob::new(ResetTokenFlags::QUEUE_NAME, token.clone()).delayed(delay);
    if let Some(job) = ensure_enqueued(queue, reset)? {
        debug!(job_id = %job.id, token = %token, "token reset scheduled");
    }
    warn!(token = %token, ttl, "token rate limited");
    Ok(delay)
}
