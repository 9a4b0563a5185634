//! In-memory job queue.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use hubjobs_core::{Identifier, JobId};
use hubjobs_jobs::{
    DEFAULT_LOG_CAPACITY, JobQueue, JobRecord, JobStatus, NewJob, Queue, QueueError, QueueIndex,
    QueueKey,
};

#[derive(Debug)]
struct StoredRecord {
    /// Creation sequence; pagination follows it.
    seq: u64,
    record: JobRecord,
}

#[derive(Debug, Default)]
struct State {
    records: HashMap<JobId, StoredRecord>,
    queues: BTreeMap<QueueKey, Queue>,
    next_seq: u64,
}

impl State {
    fn queue_mut(&mut self, key: &QueueKey, log_capacity: usize) -> &mut Queue {
        self.queues
            .entry(key.clone())
            .or_insert_with(|| Queue::with_log_capacity(key.clone(), log_capacity))
    }

    fn has_queued(&self, queue_name: &str, identifier: &Identifier) -> bool {
        self.records.values().any(|s| {
            s.record.queue_name == queue_name
                && &s.record.identifier == identifier
                && s.record.status.is_queued()
        })
    }

    fn insert(&mut self, job: NewJob, now: DateTime<Utc>, log_capacity: usize) -> JobRecord {
        let record = job.into_record(now);
        let queue = self.queue_mut(&record.queue_key(), log_capacity);
        match record.delayed_until {
            Some(due) => queue.push_delayed(record.id, due),
            None => queue.push_waiting(record.id),
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.records.insert(
            record.id,
            StoredRecord {
                seq,
                record: record.clone(),
            },
        );
        record
    }
}

/// Whether an update from `previous` to `record` changes index membership.
pub(crate) fn needs_reindex(previous: &JobRecord, record: &JobRecord) -> bool {
    previous.status != record.status
        || previous.priority != record.priority
        || (record.status == JobStatus::Delayed && previous.delayed_until != record.delayed_until)
}

pub(crate) fn check_transition(previous: &JobRecord, record: &JobRecord) -> Result<(), QueueError> {
    if record.status == JobStatus::Delayed && record.delayed_until.is_none() {
        return Err(QueueError::InvalidTransition {
            id: record.id,
            from: previous.status,
            to: record.status,
        });
    }
    Ok(())
}

/// Put `record` in the index of `queue` matching its status.
fn push_index(queue: &mut Queue, record: &JobRecord) {
    match record.status {
        JobStatus::Waiting => queue.push_waiting(record.id),
        JobStatus::Delayed => {
            if let Some(due) = record.delayed_until {
                queue.push_delayed(record.id, due);
            }
        }
        JobStatus::Success => {
            queue.log_success(record.id);
        }
        JobStatus::Error => {
            queue.log_error(record.id);
        }
        JobStatus::Running | JobStatus::Canceled => {}
    }
}

/// In-memory job queue for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    state: RwLock<State>,
    log_capacity: usize,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }

    pub fn with_log_capacity(log_capacity: usize) -> Self {
        Self {
            state: RwLock::new(State::default()),
            log_capacity,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Enqueue with an explicit creation time (imports, tests).
    pub fn enqueue_at(&self, job: NewJob, now: DateTime<Utc>) -> JobRecord {
        let mut state = self.state.write().unwrap();
        state.insert(job, now, self.log_capacity)
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: NewJob) -> Result<JobRecord, QueueError> {
        Ok(self.enqueue_at(job, Utc::now()))
    }

    fn enqueue_unique(&self, job: NewJob) -> Result<Option<JobRecord>, QueueError> {
        let mut state = self.state.write().unwrap();
        if state.has_queued(&job.queue_name, &job.identifier) {
            return Ok(None);
        }
        Ok(Some(state.insert(job, Utc::now(), self.log_capacity)))
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        let state = self.state.read().unwrap();
        Ok(state.records.get(&id).map(|s| s.record.clone()))
    }

    fn update(&self, record: &JobRecord) -> Result<(), QueueError> {
        let mut state = self.state.write().unwrap();
        let previous = state
            .records
            .get(&record.id)
            .map(|s| s.record.clone())
            .ok_or(QueueError::NotFound(record.id))?;
        check_transition(&previous, record)?;

        if needs_reindex(&previous, record) {
            if let Some(queue) = state.queues.get_mut(&previous.queue_key()) {
                while queue.remove(record.id).is_some() {}
            }
            push_index(state.queue_mut(&record.queue_key(), self.log_capacity), record);
        }

        if let Some(stored) = state.records.get_mut(&record.id) {
            stored.record = record.clone();
        }
        Ok(())
    }

    fn cancel_if_queued(&self, id: JobId) -> Result<bool, QueueError> {
        let mut guard = self.state.write().unwrap();
        let state = &mut *guard;
        let Some(stored) = state.records.get_mut(&id) else {
            return Ok(false);
        };
        if !stored.record.status.is_queued() {
            return Ok(false);
        }
        stored.record.mark_canceled();
        if let Some(queue) = state.queues.get_mut(&stored.record.queue_key()) {
            queue.remove(id);
        }
        Ok(true)
    }

    fn find(
        &self,
        queue_name: &str,
        identifier: &Identifier,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobRecord>, QueueError> {
        let state = self.state.read().unwrap();
        let mut result: Vec<_> = state
            .records
            .values()
            .filter(|s| {
                s.record.queue_name == queue_name
                    && &s.record.identifier == identifier
                    && statuses.contains(&s.record.status)
            })
            .collect();
        result.sort_by_key(|s| s.seq);
        Ok(result.into_iter().map(|s| s.record.clone()).collect())
    }

    fn members(&self, key: &QueueKey, index: QueueIndex) -> Result<Vec<JobId>, QueueError> {
        let state = self.state.read().unwrap();
        Ok(state
            .queues
            .get(key)
            .map(|q| q.members(index))
            .unwrap_or_default())
    }

    fn claim_next(
        &self,
        queue_names: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, QueueError> {
        let mut guard = self.state.write().unwrap();
        let state = &mut *guard;

        let mut keys: Vec<QueueKey> = state
            .queues
            .keys()
            .filter(|k| queue_names.iter().any(|n| *n == k.name))
            .cloned()
            .collect();
        // Highest priority first; equal priorities in the caller's name order.
        keys.sort_by_key(|k| {
            let rank = queue_names.iter().position(|n| *n == k.name);
            (std::cmp::Reverse(k.priority), rank)
        });

        for key in &keys {
            let Some(queue) = state.queues.get_mut(key) else {
                continue;
            };
            for id in queue.promote_due(now) {
                if let Some(stored) = state.records.get_mut(&id) {
                    stored.record.status = JobStatus::Waiting;
                }
            }
        }

        for key in &keys {
            let Some(queue) = state.queues.get_mut(key) else {
                continue;
            };
            while let Some(id) = queue.pop_waiting() {
                let Some(stored) = state.records.get_mut(&id) else {
                    continue;
                };
                if stored.record.status != JobStatus::Waiting {
                    continue;
                }
                stored.record.mark_running();
                return Ok(Some(stored.record.clone()));
            }
        }

        Ok(None)
    }

    fn queue_keys(&self, queue_name: &str) -> Result<Vec<QueueKey>, QueueError> {
        let state = self.state.read().unwrap();
        Ok(state
            .queues
            .keys()
            .filter(|k| k.name == queue_name)
            .cloned()
            .collect())
    }

    fn queue_names(&self) -> Result<Vec<String>, QueueError> {
        let state = self.state.read().unwrap();
        let mut names: Vec<String> = state
            .queues
            .keys()
            .map(|k| k.name.clone())
            .chain(state.records.values().map(|s| s.record.queue_name.clone()))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        names.sort();
        Ok(names)
    }

    fn records_page(
        &self,
        queue_name: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<JobRecord>, QueueError> {
        let state = self.state.read().unwrap();
        let mut result: Vec<_> = state
            .records
            .values()
            .filter(|s| s.record.queue_name == queue_name)
            .collect();
        result.sort_by_key(|s| s.seq);
        Ok(result
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|s| s.record.clone())
            .collect())
    }

    fn delete(&self, id: JobId) -> Result<(), QueueError> {
        let mut state = self.state.write().unwrap();
        let stored = state.records.remove(&id).ok_or(QueueError::NotFound(id))?;
        if let Some(queue) = state.queues.get_mut(&stored.record.queue_key()) {
            queue.remove(id);
        }
        Ok(())
    }

    fn reset_logs(&self, key: &QueueKey) -> Result<(), QueueError> {
        let mut state = self.state.write().unwrap();
        if let Some(queue) = state.queues.get_mut(key) {
            queue.reset_logs();
        }
        Ok(())
    }
}
