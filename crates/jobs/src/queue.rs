//! Queues: the data model and the collaborator trait stores implement.
//!
//! A queue is identified by `(name, priority)`. It holds record ids in four
//! indexes:
//!
//! - `waiting`: FIFO of records ready to run
//! - `delayed`: records ordered by due time, promoted to `waiting` once due
//! - `success` / `errors`: bounded logs of finished records
//!
//! Running and canceled records are in no index.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hubjobs_core::{Identifier, JobId};

use crate::record::{Fields, JobRecord, JobStatus, NewJob};

/// Default capacity of the success and error logs of a queue.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Identity of a queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueueKey {
    pub name: String,
    pub priority: i16,
}

impl QueueKey {
    pub fn new(name: impl Into<String>, priority: i16) -> Self {
        Self {
            name: name.into(),
            priority,
        }
    }
}

impl core::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.name, self.priority)
    }
}

/// One of the indexes of a queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueIndex {
    Waiting,
    Delayed,
    Success,
    Errors,
}

impl QueueIndex {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueIndex::Waiting => "waiting",
            QueueIndex::Delayed => "delayed",
            QueueIndex::Success => "success",
            QueueIndex::Errors => "errors",
        }
    }
}

/// In-process representation of a queue's indexes.
#[derive(Debug, Clone)]
pub struct Queue {
    key: QueueKey,
    waiting: VecDeque<JobId>,
    delayed: BTreeSet<(DateTime<Utc>, JobId)>,
    success: VecDeque<JobId>,
    errors: VecDeque<JobId>,
    log_capacity: usize,
}

impl Queue {
    pub fn new(key: QueueKey) -> Self {
        Self::with_log_capacity(key, DEFAULT_LOG_CAPACITY)
    }

    pub fn with_log_capacity(key: QueueKey, log_capacity: usize) -> Self {
        Self {
            key,
            waiting: VecDeque::new(),
            delayed: BTreeSet::new(),
            success: VecDeque::new(),
            errors: VecDeque::new(),
            log_capacity,
        }
    }

    pub fn key(&self) -> &QueueKey {
        &self.key
    }

    pub fn push_waiting(&mut self, id: JobId) {
        self.waiting.push_back(id);
    }

    pub fn push_delayed(&mut self, id: JobId, due: DateTime<Utc>) {
        self.delayed.insert((due, id));
    }

    /// Move every delayed record due at or before `now` to `waiting`, in due order.
    pub fn promote_due(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut promoted = Vec::new();
        while let Some(&(due, id)) = self.delayed.first() {
            if due > now {
                break;
            }
            self.delayed.pop_first();
            self.waiting.push_back(id);
            promoted.push(id);
        }
        promoted
    }

    pub fn pop_waiting(&mut self) -> Option<JobId> {
        self.waiting.pop_front()
    }

    /// Remove `id` from whichever index holds it.
    pub fn remove(&mut self, id: JobId) -> Option<QueueIndex> {
        if let Some(pos) = self.waiting.iter().position(|j| *j == id) {
            self.waiting.remove(pos);
            return Some(QueueIndex::Waiting);
        }
        if let Some(entry) = self.delayed.iter().find(|(_, j)| *j == id).copied() {
            self.delayed.remove(&entry);
            return Some(QueueIndex::Delayed);
        }
        if let Some(pos) = self.success.iter().position(|j| *j == id) {
            self.success.remove(pos);
            return Some(QueueIndex::Success);
        }
        if let Some(pos) = self.errors.iter().position(|j| *j == id) {
            self.errors.remove(pos);
            return Some(QueueIndex::Errors);
        }
        None
    }

    /// Append to the success log, returning the evicted id if the log was full.
    pub fn log_success(&mut self, id: JobId) -> Option<JobId> {
        push_bounded(&mut self.success, id, self.log_capacity)
    }

    /// Append to the error log, returning the evicted id if the log was full.
    pub fn log_error(&mut self, id: JobId) -> Option<JobId> {
        push_bounded(&mut self.errors, id, self.log_capacity)
    }

    pub fn members(&self, index: QueueIndex) -> Vec<JobId> {
        match index {
            QueueIndex::Waiting => self.waiting.iter().copied().collect(),
            QueueIndex::Delayed => self.delayed.iter().map(|(_, id)| *id).collect(),
            QueueIndex::Success => self.success.iter().copied().collect(),
            QueueIndex::Errors => self.errors.iter().copied().collect(),
        }
    }

    /// Clear the success and error logs. Waiting and delayed records are kept.
    pub fn reset_logs(&mut self) {
        self.success.clear();
        self.errors.clear();
    }

    pub fn has_planned(&self) -> bool {
        !self.waiting.is_empty() || !self.delayed.is_empty()
    }
}

fn push_bounded(log: &mut VecDeque<JobId>, id: JobId, capacity: usize) -> Option<JobId> {
    if capacity == 0 {
        return Some(id);
    }
    log.push_back(id);
    if log.len() > capacity {
        log.pop_front()
    } else {
        None
    }
}

/// Queue store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// The job-queue collaborator.
///
/// Every method is atomic with respect to a single record and a single index
/// change; nothing here takes application-level locks.
pub trait JobQueue: Send + Sync {
    /// Create a record and put it in its waiting or delayed index.
    fn enqueue(&self, job: NewJob) -> Result<JobRecord, QueueError>;

    /// Like [`JobQueue::enqueue`], but a no-op returning `None` when a record
    /// of the same queue name and identifier is already waiting or delayed.
    fn enqueue_unique(&self, job: NewJob) -> Result<Option<JobRecord>, QueueError>;

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError>;

    /// Persist `record` (status, fields, message, due time) and move it
    /// between indexes according to its status change.
    fn update(&self, record: &JobRecord) -> Result<(), QueueError>;

    /// Cancel the record only if it is still waiting or delayed, checking and
    /// writing atomically. Returns `false` when it was claimed, finished or
    /// deleted in the meantime.
    fn cancel_if_queued(&self, id: JobId) -> Result<bool, QueueError>;

    /// Records of `queue_name` for `identifier` whose status is in `statuses`.
    fn find(
        &self,
        queue_name: &str,
        identifier: &Identifier,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobRecord>, QueueError>;

    fn members(&self, key: &QueueKey, index: QueueIndex) -> Result<Vec<JobId>, QueueError>;

    /// Promote due delayed records, then pop the oldest waiting record of the
    /// highest-priority queue among `queue_names`, marking it running.
    fn claim_next(
        &self,
        queue_names: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, QueueError>;

    /// All priority queues of `queue_name`.
    fn queue_keys(&self, queue_name: &str) -> Result<Vec<QueueKey>, QueueError>;

    /// Every queue name that has queues or records in the store.
    fn queue_names(&self) -> Result<Vec<String>, QueueError>;

    /// Records of `queue_name` in creation order.
    fn records_page(
        &self,
        queue_name: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<JobRecord>, QueueError>;

    /// Remove a record and its index memberships.
    fn delete(&self, id: JobId) -> Result<(), QueueError>;

    /// Clear the success and error logs of one queue.
    fn reset_logs(&self, key: &QueueKey) -> Result<(), QueueError>;

    fn set_status(&self, id: JobId, status: JobStatus) -> Result<JobRecord, QueueError> {
        let mut record = self.get(id)?.ok_or(QueueError::NotFound(id))?;
        record.status = status;
        self.update(&record)?;
        Ok(record)
    }

    fn set_fields(&self, id: JobId, fields: &Fields) -> Result<JobRecord, QueueError> {
        let mut record = self.get(id)?.ok_or(QueueError::NotFound(id))?;
        record
            .fields
            .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.update(&record)?;
        Ok(record)
    }

    /// Mark a claimed record successful; it moves to the success log.
    fn complete(&self, record: &mut JobRecord, message: &str) -> Result<(), QueueError> {
        record.mark_success(message);
        self.update(record)
    }

    /// Mark a claimed record failed; it moves to the error log.
    fn fail(&self, record: &mut JobRecord, error: &str) -> Result<(), QueueError> {
        record.mark_error(error);
        self.update(record)
    }

    /// Schedule the next run of `record` after `delay`.
    ///
    /// Returns `None` when another run of the same logical job is already
    /// queued, so that at most one is ever pending.
    fn clone_job(
        &self,
        record: &JobRecord,
        delay: Duration,
    ) -> Result<Option<JobRecord>, QueueError> {
        self.enqueue_unique(NewJob::cloned_from(record, delay))
    }

    /// Identifiers waiting or delayed in any priority queue of `queue_name`.
    fn planned_identifiers(&self, queue_name: &str) -> Result<HashSet<Identifier>, QueueError> {
        let mut planned = HashSet::new();
        for key in self.queue_keys(queue_name)? {
            for index in [QueueIndex::Waiting, QueueIndex::Delayed] {
                for id in self.members(&key, index)? {
                    if let Some(record) = self.get(id)? {
                        planned.insert(record.identifier);
                    }
                }
            }
        }
        Ok(planned)
    }
}

impl<Q: JobQueue + ?Sized> JobQueue for Arc<Q> {
    fn enqueue(&self, job: NewJob) -> Result<JobRecord, QueueError> {
        (**self).enqueue(job)
    }

    fn enqueue_unique(&self, job: NewJob) -> Result<Option<JobRecord>, QueueError> {
        (**self).enqueue_unique(job)
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        (**self).get(id)
    }

    fn update(&self, record: &JobRecord) -> Result<(), QueueError> {
        (**self).update(record)
    }

    fn cancel_if_queued(&self, id: JobId) -> Result<bool, QueueError> {
        (**self).cancel_if_queued(id)
    }

    fn find(
        &self,
        queue_name: &str,
        identifier: &Identifier,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobRecord>, QueueError> {
        (**self).find(queue_name, identifier, statuses)
    }

    fn members(&self, key: &QueueKey, index: QueueIndex) -> Result<Vec<JobId>, QueueError> {
        (**self).members(key, index)
    }

    fn claim_next(
        &self,
        queue_names: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, QueueError> {
        (**self).claim_next(queue_names, now)
    }

    fn queue_keys(&self, queue_name: &str) -> Result<Vec<QueueKey>, QueueError> {
        (**self).queue_keys(queue_name)
    }

    fn queue_names(&self) -> Result<Vec<String>, QueueError> {
        (**self).queue_names()
    }

    fn records_page(
        &self,
        queue_name: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<JobRecord>, QueueError> {
        (**self).records_page(queue_name, offset, limit)
    }

    fn delete(&self, id: JobId) -> Result<(), QueueError> {
        (**self).delete(id)
    }

    fn reset_logs(&self, key: &QueueKey) -> Result<(), QueueError> {
        (**self).reset_logs(key)
    }

    fn planned_identifiers(&self, queue_name: &str) -> Result<HashSet<Identifier>, QueueError> {
        (**self).planned_identifiers(queue_name)
    }
}
