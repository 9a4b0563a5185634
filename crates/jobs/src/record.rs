//! Persisted job records.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use hubjobs_core::{DomainError, Identifier, JobId};

use crate::queue::QueueKey;

/// Job-type specific scalar fields (`nb_repos`, `updated_count`, ...).
pub type Fields = BTreeMap<String, JsonValue>;

/// Job record status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// In the waiting index, ready to be claimed.
    Waiting,
    /// In the delayed index until `delayed_until`.
    Delayed,
    /// Claimed by a worker.
    Running,
    /// Completed; listed in the queue's success log.
    Success,
    /// Will never run. Not part of any index.
    Canceled,
    /// `run` failed; listed in the queue's error log.
    Error,
}

impl JobStatus {
    /// Statuses of a record that is still planned.
    pub const QUEUED: [JobStatus; 2] = [JobStatus::Waiting, JobStatus::Delayed];

    pub fn is_queued(&self) -> bool {
        matches!(self, JobStatus::Waiting | JobStatus::Delayed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Delayed => "delayed",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Canceled => "canceled",
            JobStatus::Error => "error",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "delayed" => Ok(JobStatus::Delayed),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "canceled" => Ok(JobStatus::Canceled),
            "error" => Ok(JobStatus::Error),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// A unit of background work for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Logical job type; also the queue name.
    pub queue_name: String,
    /// Entity the job works on.
    pub identifier: Identifier,
    pub priority: i16,
    pub status: JobStatus,
    pub added_at: DateTime<Utc>,
    pub delayed_until: Option<DateTime<Utc>>,
    pub fields: Fields,
    /// Last result or error message.
    pub message: Option<String>,
}

impl JobRecord {
    pub fn queue_key(&self) -> QueueKey {
        QueueKey::new(self.queue_name.clone(), self.priority)
    }

    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.fields.get(name)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<JsonValue>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Delay between creation and due time, if the record was delayed.
    pub fn scheduled_delay(&self) -> Option<chrono::Duration> {
        self.delayed_until.map(|due| due - self.added_at)
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
    }

    pub fn mark_success(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Success;
        self.message = Some(message.into());
    }

    pub fn mark_error(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Error;
        self.message = Some(error.into());
    }

    pub fn mark_canceled(&mut self) {
        self.status = JobStatus::Canceled;
    }
}

/// Request to create a job record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub queue_name: String,
    pub identifier: Identifier,
    pub priority: i16,
    pub delay: Option<Duration>,
    pub fields: Fields,
}

impl NewJob {
    pub fn new(queue_name: impl Into<String>, identifier: impl Into<Identifier>) -> Self {
        Self {
            queue_name: queue_name.into(),
            identifier: identifier.into(),
            priority: 0,
            delay: None,
            fields: Fields::new(),
        }
    }

    /// Next run of an existing record: same type, identifier, priority and fields.
    pub fn cloned_from(record: &JobRecord, delay: Duration) -> Self {
        Self {
            queue_name: record.queue_name.clone(),
            identifier: record.identifier.clone(),
            priority: record.priority,
            delay: Some(delay),
            fields: record.fields.clone(),
        }
    }

    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn queue_key(&self) -> QueueKey {
        QueueKey::new(self.queue_name.clone(), self.priority)
    }

    /// Build the record as stored at `now`.
    ///
    /// A zero (or absent) delay yields a waiting record.
    pub fn into_record(self, now: DateTime<Utc>) -> JobRecord {
        let delayed_until = self
            .delay
            .filter(|d| !d.is_zero())
            .map(|d| {
                chrono::Duration::from_std(d)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            });
        JobRecord {
            id: JobId::new(),
            queue_name: self.queue_name,
            identifier: self.identifier,
            priority: self.priority,
            status: if delayed_until.is_some() {
                JobStatus::Delayed
            } else {
                JobStatus::Waiting
            },
            added_at: now,
            delayed_until,
            fields: self.fields,
            message: None,
        }
    }
}
