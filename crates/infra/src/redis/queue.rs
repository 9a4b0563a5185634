//! Redis job queue.

use std::cmp::Reverse;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redis::{Commands, ConnectionLike, Pipeline};
use tracing::{debug, instrument};

use hubjobs_core::{Identifier, JobId};
use hubjobs_jobs::{
    DEFAULT_LOG_CAPACITY, JobQueue, JobRecord, JobStatus, NewJob, QueueError, QueueIndex, QueueKey,
};

use super::{DEFAULT_PREFIX, RedisStoreError, connect, open, range_bounds};
use crate::jobs::store::{check_transition, needs_reindex};

#[derive(Debug, Clone)]
pub struct RedisJobQueue {
    client: Arc<redis::Client>,
    prefix: String,
    log_capacity: usize,
}

impl RedisJobQueue {
    /// Create a queue store on `redis_url` (e.g. "redis://localhost:6379").
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, RedisStoreError> {
        Ok(Self {
            client: Arc::new(open(redis_url.as_ref())?),
            prefix: DEFAULT_PREFIX.to_string(),
            log_capacity: DEFAULT_LOG_CAPACITY,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_log_capacity(mut self, log_capacity: usize) -> Self {
        self.log_capacity = log_capacity;
        self
    }

    fn conn(&self) -> Result<redis::Connection, RedisStoreError> {
        connect(&self.client)
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}:job:{id}", self.prefix)
    }

    fn seq_key(&self) -> String {
        format!("{}:seq", self.prefix)
    }

    fn records_key(&self, queue_name: &str) -> String {
        format!("{}:records:{queue_name}", self.prefix)
    }

    fn ids_key(&self, queue_name: &str, identifier: &Identifier) -> String {
        format!("{}:ids:{queue_name}:{identifier}", self.prefix)
    }

    fn queued_key(&self, queue_name: &str, identifier: &Identifier) -> String {
        format!("{}:queued:{queue_name}:{identifier}", self.prefix)
    }

    fn queues_key(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    fn names_key(&self) -> String {
        format!("{}:queue-names", self.prefix)
    }

    fn index_key(&self, key: &QueueKey, index: QueueIndex) -> String {
        format!("{}:queue:{key}:{}", self.prefix, index.as_str())
    }

    fn load<C: ConnectionLike>(
        &self,
        conn: &mut C,
        id: JobId,
    ) -> Result<Option<JobRecord>, RedisStoreError> {
        let raw: Option<String> = redis::cmd("GET").arg(self.job_key(id)).query(conn)?;
        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| RedisStoreError::Deserialization(e.to_string()))
        })
        .transpose()
    }

    fn load_all<C: ConnectionLike>(
        &self,
        conn: &mut C,
        ids: Vec<String>,
    ) -> Result<Vec<JobRecord>, RedisStoreError> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.load(conn, parse_id(&id)?)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn save(&self, pipe: &mut Pipeline, record: &JobRecord) -> Result<(), RedisStoreError> {
        let json = serde_json::to_string(record)
            .map_err(|e| RedisStoreError::Serialization(e.to_string()))?;
        pipe.cmd("SET").arg(self.job_key(record.id)).arg(json).ignore();
        Ok(())
    }

    fn push_index(&self, pipe: &mut Pipeline, record: &JobRecord) {
        let key = record.queue_key();
        let id = record.id.to_string();
        match record.status {
            JobStatus::Waiting => {
                pipe.cmd("RPUSH")
                    .arg(self.index_key(&key, QueueIndex::Waiting))
                    .arg(&id)
                    .ignore();
            }
            JobStatus::Delayed => {
                if let Some(due) = record.delayed_until {
                    pipe.cmd("ZADD")
                        .arg(self.index_key(&key, QueueIndex::Delayed))
                        .arg(due.timestamp_millis())
                        .arg(&id)
                        .ignore();
                }
            }
            JobStatus::Success | JobStatus::Error if self.log_capacity > 0 => {
                let index = if record.status == JobStatus::Success {
                    QueueIndex::Success
                } else {
                    QueueIndex::Errors
                };
                let log = self.index_key(&key, index);
                pipe.cmd("RPUSH").arg(&log).arg(&id).ignore();
                // Keep the newest `log_capacity` entries.
                pipe.cmd("LTRIM")
                    .arg(&log)
                    .arg(-(self.log_capacity as i64))
                    .arg(-1)
                    .ignore();
            }
            _ => {}
        }
    }

    /// Keep `{p}:queued:{name}:{identifier}` in step with the record's status.
    fn track_queued(&self, pipe: &mut Pipeline, record: &JobRecord) {
        let cmd = if record.status.is_queued() { "SADD" } else { "SREM" };
        pipe.cmd(cmd)
            .arg(self.queued_key(&record.queue_name, &record.identifier))
            .arg(record.id.to_string())
            .ignore();
    }

    /// Run the transaction `pipe`; `false` when a watched key changed and EXEC aborted.
    fn exec<C: ConnectionLike>(
        &self,
        con: &mut C,
        pipe: &mut Pipeline,
        id: JobId,
    ) -> redis::RedisResult<bool> {
        pipe.cmd("EXISTS").arg(self.job_key(id));
        let done: Option<(i64,)> = pipe.query(con)?;
        Ok(done.is_some())
    }

    fn remove_from_indexes(&self, pipe: &mut Pipeline, record: &JobRecord, queued_only: bool) {
        let key = record.queue_key();
        let id = record.id.to_string();
        pipe.cmd("LREM")
            .arg(self.index_key(&key, QueueIndex::Waiting))
            .arg(0)
            .arg(&id)
            .ignore();
        pipe.cmd("ZREM")
            .arg(self.index_key(&key, QueueIndex::Delayed))
            .arg(&id)
            .ignore();
        if !queued_only {
            for index in [QueueIndex::Success, QueueIndex::Errors] {
                pipe.cmd("LREM")
                    .arg(self.index_key(&key, index))
                    .arg(0)
                    .arg(&id)
                    .ignore();
            }
        }
    }

    /// Queue a freshly built record: payload, bookkeeping sets and index.
    fn insert(&self, pipe: &mut Pipeline, record: &JobRecord, seq: i64) -> Result<(), RedisStoreError> {
        let id = record.id.to_string();
        self.save(pipe, record)?;
        pipe.cmd("ZADD")
            .arg(self.records_key(&record.queue_name))
            .arg(seq)
            .arg(&id)
            .ignore()
            .cmd("SADD")
            .arg(self.ids_key(&record.queue_name, &record.identifier))
            .arg(&id)
            .ignore()
            .cmd("SADD")
            .arg(self.names_key())
            .arg(&record.queue_name)
            .ignore()
            .cmd("SADD")
            .arg(self.queues_key())
            .arg(record.queue_key().to_string())
            .ignore();
        self.push_index(pipe, record);
        self.track_queued(pipe, record);
        Ok(())
    }

    fn next_seq(&self, conn: &mut redis::Connection) -> Result<i64, RedisStoreError> {
        Ok(conn.incr(self.seq_key(), 1)?)
    }

    fn sorted_keys(
        &self,
        conn: &mut redis::Connection,
        queue_names: &[String],
    ) -> Result<Vec<QueueKey>, RedisStoreError> {
        let raw: Vec<String> = conn.smembers(self.queues_key())?;
        let mut keys: Vec<QueueKey> = raw
            .iter()
            .filter_map(|k| parse_queue_key(k))
            .filter(|k| queue_names.iter().any(|n| *n == k.name))
            .collect();
        keys.sort_by_key(|k| {
            let rank = queue_names.iter().position(|n| *n == k.name);
            (Reverse(k.priority), rank)
        });
        Ok(keys)
    }

    fn promote_due(
        &self,
        conn: &mut redis::Connection,
        key: &QueueKey,
        now: DateTime<Utc>,
    ) -> Result<(), RedisStoreError> {
        let delayed = self.index_key(key, QueueIndex::Delayed);
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&delayed)
            .arg("-inf")
            .arg(now.timestamp_millis())
            .query(conn)?;
        for id in due {
            // Whoever removes the id from the delayed set promotes it.
            let removed: i64 = conn.zrem(&delayed, &id)?;
            if removed == 0 {
                continue;
            }
            let id = parse_id(&id)?;
            let job_key = self.job_key(id);
            let promoted = redis::transaction(conn, &[&job_key], |con, pipe| {
                let Some(mut record) = self.load(con, id).map_err(|e| redis_error(e.to_string()))?
                else {
                    return Ok(Some(false));
                };
                if record.status != JobStatus::Delayed {
                    return Ok(Some(false));
                }
                if record.delayed_until.is_some_and(|at| at > now) {
                    // Re-timed after the range read; put it back under its new score.
                    self.push_index(pipe, &record);
                    return Ok(self.exec(con, pipe, id)?.then_some(false));
                }
                record.status = JobStatus::Waiting;
                self.save(pipe, &record).map_err(|e| redis_error(e.to_string()))?;
                self.push_index(pipe, &record);
                Ok(self.exec(con, pipe, id)?.then_some(true))
            })?;
            if promoted {
                debug!(job_id = %id, queue = %key, "promoted delayed job");
            }
        }
        Ok(())
    }
}

fn parse_id(raw: &str) -> Result<JobId, RedisStoreError> {
    raw.parse()
        .map_err(|e: hubjobs_core::DomainError| RedisStoreError::Deserialization(e.to_string()))
}

fn parse_queue_key(raw: &str) -> Option<QueueKey> {
    let (name, priority) = raw.rsplit_once(':')?;
    Some(QueueKey::new(name, priority.parse().ok()?))
}

impl JobQueue for RedisJobQueue {
    #[instrument(skip(self, job), fields(queue = %job.queue_name, identifier = %job.identifier), err)]
    fn enqueue(&self, job: NewJob) -> Result<JobRecord, QueueError> {
        let mut conn = self.conn()?;
        let seq = self.next_seq(&mut conn)?;
        let record = job.into_record(Utc::now());
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.insert(&mut pipe, &record, seq)?;
        pipe.query::<()>(&mut conn).map_err(RedisStoreError::from)?;
        Ok(record)
    }

    #[instrument(skip(self, job), fields(queue = %job.queue_name, identifier = %job.identifier), err)]
    fn enqueue_unique(&self, job: NewJob) -> Result<Option<JobRecord>, QueueError> {
        let mut conn = self.conn()?;
        let seq = self.next_seq(&mut conn)?;
        let record = job.into_record(Utc::now());
        let queued_key = self.queued_key(&record.queue_name, &record.identifier);

        // WATCH the logical job's queued set; a concurrent change aborts EXEC and retries.
        let inserted = redis::transaction(&mut conn, &[&queued_key], |con, pipe| {
            let queued: usize = con.scard(&queued_key)?;
            if queued > 0 {
                return Ok(Some(false));
            }
            self.insert(pipe, &record, seq)
                .map_err(|e| redis_error(e.to_string()))?;
            Ok(self.exec(con, pipe, record.id)?.then_some(true))
        })
        .map_err(RedisStoreError::from)?;

        Ok(inserted.then_some(record))
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        let mut conn = self.conn()?;
        Ok(self.load(&mut conn, id)?)
    }

    fn update(&self, record: &JobRecord) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let job_key = self.job_key(record.id);
        let outcome: Result<(), QueueError> =
            redis::transaction(&mut conn, &[&job_key], |con, pipe| {
                let Some(previous) = self
                    .load(con, record.id)
                    .map_err(|e| redis_error(e.to_string()))?
                else {
                    return Ok(Some(Err(QueueError::NotFound(record.id))));
                };
                if let Err(e) = check_transition(&previous, record) {
                    return Ok(Some(Err(e)));
                }
                self.save(pipe, record)
                    .map_err(|e| redis_error(e.to_string()))?;
                if needs_reindex(&previous, record) {
                    self.remove_from_indexes(pipe, &previous, false);
                    self.push_index(pipe, record);
                    self.track_queued(pipe, &previous);
                    self.track_queued(pipe, record);
                }
                Ok(self.exec(con, pipe, record.id)?.then_some(Ok(())))
            })
            .map_err(RedisStoreError::from)?;
        outcome
    }

    #[instrument(skip(self), err)]
    fn cancel_if_queued(&self, id: JobId) -> Result<bool, QueueError> {
        let mut conn = self.conn()?;
        let job_key = self.job_key(id);
        let canceled = redis::transaction(&mut conn, &[&job_key], |con, pipe| {
            let Some(mut record) = self.load(con, id).map_err(|e| redis_error(e.to_string()))?
            else {
                return Ok(Some(false));
            };
            if !record.status.is_queued() {
                return Ok(Some(false));
            }
            self.remove_from_indexes(pipe, &record, true);
            record.mark_canceled();
            self.save(pipe, &record)
                .map_err(|e| redis_error(e.to_string()))?;
            self.track_queued(pipe, &record);
            Ok(self.exec(con, pipe, id)?.then_some(true))
        })
        .map_err(RedisStoreError::from)?;
        Ok(canceled)
    }

    fn find(
        &self,
        queue_name: &str,
        identifier: &Identifier,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobRecord>, QueueError> {
        let mut conn = self.conn()?;
        let ids: Vec<String> = conn
            .smembers(self.ids_key(queue_name, identifier))
            .map_err(RedisStoreError::from)?;
        let mut records: Vec<JobRecord> = self
            .load_all(&mut conn, ids)?
            .into_iter()
            .filter(|r| statuses.contains(&r.status))
            .collect();
        records.sort_by_key(|r| (r.added_at, r.id));
        Ok(records)
    }

    fn members(&self, key: &QueueKey, index: QueueIndex) -> Result<Vec<JobId>, QueueError> {
        let mut conn = self.conn()?;
        let cmd = match index {
            QueueIndex::Delayed => "ZRANGE",
            _ => "LRANGE",
        };
        let raw: Vec<String> = redis::cmd(cmd)
            .arg(self.index_key(key, index))
            .arg(0)
            .arg(-1)
            .query(&mut conn)
            .map_err(RedisStoreError::from)?;
        let ids = raw
            .iter()
            .map(|id| parse_id(id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn claim_next(
        &self,
        queue_names: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, QueueError> {
        let mut conn = self.conn()?;
        let keys = self.sorted_keys(&mut conn, queue_names)?;

        for key in &keys {
            self.promote_due(&mut conn, key, now)?;
        }

        for key in &keys {
            let waiting = self.index_key(key, QueueIndex::Waiting);
            loop {
                let id: Option<String> = conn.lpop(&waiting, None).map_err(RedisStoreError::from)?;
                let Some(id) = id else { break };
                let id = parse_id(&id)?;
                let job_key = self.job_key(id);
                // A cancel racing the pop sees either Waiting or Running, never both.
                let claimed = redis::transaction(&mut conn, &[&job_key], |con, pipe| {
                    let Some(mut record) =
                        self.load(con, id).map_err(|e| redis_error(e.to_string()))?
                    else {
                        return Ok(Some(None));
                    };
                    if record.status != JobStatus::Waiting {
                        return Ok(Some(None));
                    }
                    record.mark_running();
                    self.save(pipe, &record)
                        .map_err(|e| redis_error(e.to_string()))?;
                    self.track_queued(pipe, &record);
                    Ok(self.exec(con, pipe, id)?.then_some(Some(record)))
                })
                .map_err(RedisStoreError::from)?;
                if let Some(record) = claimed {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    fn queue_keys(&self, queue_name: &str) -> Result<Vec<QueueKey>, QueueError> {
        let mut conn = self.conn()?;
        let mut keys = self.sorted_keys(&mut conn, &[queue_name.to_string()])?;
        keys.sort();
        Ok(keys)
    }

    fn queue_names(&self) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn()?;
        let mut names: Vec<String> = conn
            .smembers(self.names_key())
            .map_err(RedisStoreError::from)?;
        names.sort();
        Ok(names)
    }

    fn records_page(
        &self,
        queue_name: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<JobRecord>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn()?;
        let (start, stop) = range_bounds(offset, limit);
        let ids: Vec<String> = conn
            .zrange(self.records_key(queue_name), start, stop)
            .map_err(RedisStoreError::from)?;
        Ok(self.load_all(&mut conn, ids)?)
    }

    fn delete(&self, id: JobId) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let record = self.load(&mut conn, id)?.ok_or(QueueError::NotFound(id))?;
        let raw = id.to_string();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL")
            .arg(self.job_key(id))
            .ignore()
            .cmd("ZREM")
            .arg(self.records_key(&record.queue_name))
            .arg(&raw)
            .ignore()
            .cmd("SREM")
            .arg(self.ids_key(&record.queue_name, &record.identifier))
            .arg(&raw)
            .ignore()
            .cmd("SREM")
            .arg(self.queued_key(&record.queue_name, &record.identifier))
            .arg(&raw)
            .ignore();
        self.remove_from_indexes(&mut pipe, &record, false);
        pipe.query::<()>(&mut conn).map_err(RedisStoreError::from)?;
        Ok(())
    }

    fn reset_logs(&self, key: &QueueKey) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        redis::cmd("DEL")
            .arg(self.index_key(key, QueueIndex::Success))
            .arg(self.index_key(key, QueueIndex::Errors))
            .query::<()>(&mut conn)
            .map_err(RedisStoreError::from)?;
        Ok(())
    }
}

fn redis_error(detail: String) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::ClientError, "job queue", detail))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_keys_round_trip_through_their_display() {
        let key = QueueKey::new("fetch-repository-events", -3);
        assert_eq!(parse_queue_key(&key.to_string()), Some(key));
        assert_eq!(parse_queue_key("no-priority"), None);
        assert_eq!(parse_queue_key("q:high"), None);
    }

    #[test]
    fn keys_are_prefixed() {
        let queue = RedisJobQueue::new("redis://localhost:6379")
            .unwrap()
            .with_prefix("test");
        let key = QueueKey::new("check-repository-hook", 2);
        assert_eq!(
            queue.index_key(&key, QueueIndex::Delayed),
            "test:queue:check-repository-hook:2:delayed"
        );
        assert_eq!(
            queue.ids_key("check-repository-hook", &Identifier::from("42")),
            "test:ids:check-repository-hook:42"
        );
    }

    // The tests below need a live server: `REDIS_URL=redis://localhost:6379
    // cargo test -p hubjobs-infra -- --ignored`. Each one works under its own prefix.

    const QUEUE: &str = "fetch-repository-events";

    fn live_queue() -> Option<RedisJobQueue> {
        let url = std::env::var("REDIS_URL").ok()?;
        let prefix = format!("hubjobs-test-{}", JobId::new());
        Some(RedisJobQueue::new(url).unwrap().with_prefix(prefix))
    }

    fn drop_keys(queue: &RedisJobQueue) {
        let mut conn = queue.conn().unwrap();
        let keys: Vec<String> = conn.keys(format!("{}:*", queue.prefix)).unwrap();
        if !keys.is_empty() {
            let _: () = conn.del(keys).unwrap();
        }
    }

    fn names() -> Vec<String> {
        vec![QUEUE.to_string()]
    }

    #[test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    fn live_enqueue_unique_tracks_queued_records() {
        let Some(queue) = live_queue() else { return };

        let first = queue.enqueue_unique(NewJob::new(QUEUE, "1")).unwrap().unwrap();
        assert!(queue.enqueue_unique(NewJob::new(QUEUE, "1")).unwrap().is_none());
        assert!(queue.enqueue_unique(NewJob::new(QUEUE, "2")).unwrap().is_some());

        let claimed = queue.claim_next(&names(), Utc::now()).unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        // Running no longer blocks a new run of the same logical job.
        assert!(queue.enqueue_unique(NewJob::new(QUEUE, "1")).unwrap().is_some());

        drop_keys(&queue);
    }

    #[test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    fn live_delayed_record_is_promoted_when_due() {
        let Some(queue) = live_queue() else { return };
        let job = queue
            .enqueue(NewJob::new(QUEUE, "1").delayed(std::time::Duration::from_secs(60)))
            .unwrap();

        assert!(queue.claim_next(&names(), Utc::now()).unwrap().is_none());
        let due = Utc::now() + chrono::Duration::seconds(61);
        let claimed = queue.claim_next(&names(), due).unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(queue.get(job.id).unwrap().unwrap().status, JobStatus::Running);
        assert!(queue.members(&job.queue_key(), QueueIndex::Delayed).unwrap().is_empty());

        drop_keys(&queue);
    }

    #[test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    fn live_cancel_spares_running_records() {
        let Some(queue) = live_queue() else { return };
        let queued = queue
            .enqueue(NewJob::new(QUEUE, "1").delayed(std::time::Duration::from_secs(60)))
            .unwrap();
        queue.enqueue(NewJob::new(QUEUE, "2")).unwrap();
        let running = queue.claim_next(&names(), Utc::now()).unwrap().unwrap();

        assert!(queue.cancel_if_queued(queued.id).unwrap());
        assert!(!queue.cancel_if_queued(running.id).unwrap());
        assert_eq!(queue.get(queued.id).unwrap().unwrap().status, JobStatus::Canceled);
        assert_eq!(queue.get(running.id).unwrap().unwrap().status, JobStatus::Running);
        assert!(queue.members(&queued.queue_key(), QueueIndex::Delayed).unwrap().is_empty());
        // Canceled frees the identifier.
        assert!(queue.enqueue_unique(NewJob::new(QUEUE, "1")).unwrap().is_some());

        drop_keys(&queue);
    }

    #[test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    fn live_update_reindexes_status_and_due_time() {
        let Some(queue) = live_queue() else { return };
        let now = Utc::now();
        let job = queue.enqueue(NewJob::new(QUEUE, "1")).unwrap();
        let key = job.queue_key();

        queue.set_status(job.id, JobStatus::Success).unwrap();
        queue.set_status(job.id, JobStatus::Waiting).unwrap();
        assert!(queue.members(&key, QueueIndex::Success).unwrap().is_empty());
        assert_eq!(queue.members(&key, QueueIndex::Waiting).unwrap(), vec![job.id]);

        let mut delayed = queue.get(job.id).unwrap().unwrap();
        delayed.status = JobStatus::Delayed;
        delayed.delayed_until = Some(now + chrono::Duration::seconds(10));
        queue.update(&delayed).unwrap();
        delayed.delayed_until = Some(now + chrono::Duration::seconds(3600));
        queue.update(&delayed).unwrap();

        assert!(queue.members(&key, QueueIndex::Waiting).unwrap().is_empty());
        assert!(queue
            .claim_next(&names(), now + chrono::Duration::seconds(11))
            .unwrap()
            .is_none());
        assert_eq!(queue.members(&key, QueueIndex::Delayed).unwrap(), vec![job.id]);

        drop_keys(&queue);
    }
}
