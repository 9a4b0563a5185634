//! Redis error log: a sorted set of keys scored by date, plus a hash of entries.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime};
use redis::Commands;

use crate::jobs::error_log::{ErrorEntry, ErrorLogError, ErrorLogStore, day_of};

use super::{DEFAULT_PREFIX, RedisStoreError, connect, open, range_bounds};

#[derive(Debug, Clone)]
pub struct RedisErrorLog {
    client: Arc<redis::Client>,
    prefix: String,
}

impl RedisErrorLog {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, RedisStoreError> {
        Ok(Self {
            client: Arc::new(open(redis_url.as_ref())?),
            prefix: DEFAULT_PREFIX.to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn index_key(&self) -> String {
        format!("{}:errors", self.prefix)
    }

    fn entries_key(&self) -> String {
        format!("{}:errors:entries", self.prefix)
    }
}

/// Sort score of an entry date, in milliseconds.
///
/// Full RFC 3339 date-times keep their time of day; anything else is scored
/// by its day.
fn date_score(date: &str) -> Result<i64, RedisStoreError> {
    if let Ok(at) = DateTime::parse_from_rfc3339(date) {
        return Ok(at.timestamp_millis());
    }
    NaiveDate::parse_from_str(day_of(date), "%Y-%m-%d")
        .map(|d| d.and_time(NaiveTime::default()).and_utc().timestamp_millis())
        .map_err(|e| RedisStoreError::Serialization(format!("invalid error date {date:?}: {e}")))
}

impl ErrorLogStore for RedisErrorLog {
    fn append(&self, entry: ErrorEntry) -> Result<(), ErrorLogError> {
        let score = date_score(&entry.date)?;
        let json = serde_json::to_string(&entry)
            .map_err(|e| RedisStoreError::Serialization(e.to_string()))?;
        let mut conn = connect(&self.client)?;
        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.entries_key())
            .arg(&entry.key)
            .arg(json)
            .ignore()
            .cmd("ZADD")
            .arg(self.index_key())
            .arg(score)
            .arg(&entry.key)
            .ignore()
            .query::<()>(&mut conn)
            .map_err(RedisStoreError::from)?;
        Ok(())
    }

    fn page_by_date(&self, offset: usize, limit: usize) -> Result<Vec<ErrorEntry>, ErrorLogError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = connect(&self.client)?;
        let (start, stop) = range_bounds(offset, limit);
        let keys: Vec<String> = conn
            .zrange(self.index_key(), start, stop)
            .map_err(RedisStoreError::from)?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.entries_key())
            .arg(&keys)
            .query(&mut conn)
            .map_err(RedisStoreError::from)?;

        let mut entries = Vec::with_capacity(raw.len());
        for json in raw.into_iter().flatten() {
            let entry = serde_json::from_str(&json)
                .map_err(|e| RedisStoreError::Deserialization(e.to_string()))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn delete(&self, key: &str) -> Result<(), ErrorLogError> {
        let mut conn = connect(&self.client)?;
        let (removed, _): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(self.index_key())
            .arg(key)
            .cmd("HDEL")
            .arg(self.entries_key())
            .arg(key)
            .query(&mut conn)
            .map_err(RedisStoreError::from)?;
        if removed == 0 {
            return Err(ErrorLogError::NotFound(key.to_string()));
        }
        Ok(())
    }

    fn len(&self) -> Result<usize, ErrorLogError> {
        let mut conn = connect(&self.client)?;
        let len: usize = conn.zcard(self.index_key()).map_err(RedisStoreError::from)?;
        Ok(len)
    }
}
