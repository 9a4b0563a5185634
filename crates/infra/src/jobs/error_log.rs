//! Log of failed job runs.

use std::sync::RwLock;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use hubjobs_core::Identifier;
use hubjobs_jobs::JobRecord;

/// One failed job run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Id of the failed record.
    pub key: String,
    pub queue_name: String,
    pub identifier: Identifier,
    /// ISO-8601 date-time.
    pub date: String,
    pub message: String,
}

impl ErrorEntry {
    pub fn new(
        key: impl Into<String>,
        queue_name: impl Into<String>,
        identifier: impl Into<Identifier>,
        date: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            queue_name: queue_name.into(),
            identifier: identifier.into(),
            date: date.into(),
            message: message.into(),
        }
    }

    pub fn for_record(record: &JobRecord, at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self::new(
            record.id.to_string(),
            record.queue_name.clone(),
            record.identifier.clone(),
            at.to_rfc3339_opts(SecondsFormat::Secs, true),
            message,
        )
    }

    /// `YYYY-MM-DD` part of the date.
    pub fn day(&self) -> &str {
        day_of(&self.date)
    }
}

/// First 10 characters of an ISO-8601 date, i.e. its day.
pub fn day_of(date: &str) -> &str {
    date.get(..10).unwrap_or(date)
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ErrorLogError {
    #[error("error entry not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Storage of [`ErrorEntry`] values, ordered by date.
pub trait ErrorLogStore: Send + Sync {
    fn append(&self, entry: ErrorEntry) -> Result<(), ErrorLogError>;

    /// Entries by ascending date; ties keep insertion order.
    fn page_by_date(&self, offset: usize, limit: usize) -> Result<Vec<ErrorEntry>, ErrorLogError>;

    fn delete(&self, key: &str) -> Result<(), ErrorLogError>;

    fn len(&self) -> Result<usize, ErrorLogError>;

    fn is_empty(&self) -> Result<bool, ErrorLogError> {
        Ok(self.len()? == 0)
    }
}

impl<S: ErrorLogStore + ?Sized> ErrorLogStore for std::sync::Arc<S> {
    fn append(&self, entry: ErrorEntry) -> Result<(), ErrorLogError> {
        (**self).append(entry)
    }

    fn page_by_date(&self, offset: usize, limit: usize) -> Result<Vec<ErrorEntry>, ErrorLogError> {
        (**self).page_by_date(offset, limit)
    }

    fn delete(&self, key: &str) -> Result<(), ErrorLogError> {
        (**self).delete(key)
    }

    fn len(&self) -> Result<usize, ErrorLogError> {
        (**self).len()
    }
}

/// In-memory error log for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryErrorLog {
    entries: RwLock<Vec<ErrorEntry>>,
}

impl InMemoryErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .map(|e| e.key.clone())
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<ErrorEntry> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .find(|e| e.key == key)
            .cloned()
    }
}

impl ErrorLogStore for InMemoryErrorLog {
    fn append(&self, entry: ErrorEntry) -> Result<(), ErrorLogError> {
        let mut entries = self.entries.write().unwrap();
        entries.retain(|e| e.key != entry.key);
        // Stable position: after every entry with a date <= the new one.
        let pos = entries.partition_point(|e| e.date <= entry.date);
        entries.insert(pos, entry);
        Ok(())
    }

    fn page_by_date(&self, offset: usize, limit: usize) -> Result<Vec<ErrorEntry>, ErrorLogError> {
        let entries = self.entries.read().unwrap();
        Ok(entries.iter().skip(offset).take(limit).cloned().collect())
    }

    fn delete(&self, key: &str) -> Result<(), ErrorLogError> {
        let mut entries = self.entries.write().unwrap();
        let pos = entries
            .iter()
            .position(|e| e.key == key)
            .ok_or_else(|| ErrorLogError::NotFound(key.to_string()))?;
        entries.remove(pos);
        Ok(())
    }

    fn len(&self) -> Result<usize, ErrorLogError> {
        Ok(self.entries.read().unwrap().len())
    }
}
