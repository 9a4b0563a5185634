//! Redis-backed job queue, error log and directories.
//!
//! Every key lives under a prefix (default `hubjobs`):
//!
//! - `{p}:job:{id}`: JSON job record
//! - `{p}:seq`: creation counter; `{p}:records:{name}` orders records by it
//! - `{p}:ids:{name}:{identifier}`: ids of every record of a logical job
//! - `{p}:queued:{name}:{identifier}`: ids of its waiting or delayed records
//! - `{p}:queue:{name}:{priority}:{waiting|delayed|success|errors}`: indexes
//! - `{p}:queues`, `{p}:queue-names`: known queue keys and names
//! - `{p}:errors` (by date) and `{p}:errors:entries`: the error log
//! - `{p}:repository:{id}`, `{p}:token:{token}`: directory entries
//!
//! Multi-key changes go through `MULTI`/`EXEC` pipelines; changes that
//! depend on a record's stored status `WATCH` its key first.

pub mod directory;
pub mod error_log;
pub mod queue;

pub use directory::{RedisRepositoryDirectory, RedisTokenDirectory};
pub use error_log::RedisErrorLog;
pub use queue::RedisJobQueue;

use hubjobs_jobs::{DirectoryError, QueueError};

use crate::jobs::error_log::ErrorLogError;

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "hubjobs";

#[derive(Debug, thiserror::Error)]
pub enum RedisStoreError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl From<redis::RedisError> for RedisStoreError {
    fn from(e: redis::RedisError) -> Self {
        RedisStoreError::Command(e.to_string())
    }
}

impl From<RedisStoreError> for QueueError {
    fn from(e: RedisStoreError) -> Self {
        QueueError::Storage(e.to_string())
    }
}

impl From<RedisStoreError> for ErrorLogError {
    fn from(e: RedisStoreError) -> Self {
        ErrorLogError::Storage(e.to_string())
    }
}

impl From<RedisStoreError> for DirectoryError {
    fn from(e: RedisStoreError) -> Self {
        DirectoryError::Backend(e.to_string())
    }
}

fn open(redis_url: &str) -> Result<redis::Client, RedisStoreError> {
    redis::Client::open(redis_url).map_err(|e| RedisStoreError::Connection(e.to_string()))
}

fn connect(client: &redis::Client) -> Result<redis::Connection, RedisStoreError> {
    client
        .get_connection()
        .map_err(|e| RedisStoreError::Connection(e.to_string()))
}

/// Inclusive `ZRANGE` bounds for `limit > 0` items from `offset`, clamped to `isize`.
fn range_bounds(offset: usize, limit: usize) -> (isize, isize) {
    let stop = offset.saturating_add(limit.saturating_sub(1));
    (
        isize::try_from(offset).unwrap_or(isize::MAX),
        isize::try_from(stop).unwrap_or(isize::MAX),
    )
}
