//! Repository and token directories backed by the web application's Redis keys.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::sync::Arc;

use redis::{Commands, Pipeline};
use tracing::{info, warn};

use hubjobs_core::{Identifier, MembershipReplaced, MembershipSink, Username, reconcile_members};
use hubjobs_jobs::{DirectoryError, RepositoryDirectory, TokenDirectory};

use super::{DEFAULT_PREFIX, RedisStoreError, connect, open};

#[derive(Debug, Clone)]
pub struct RedisRepositoryDirectory {
    client: Arc<redis::Client>,
    prefix: String,
}

/// Queues subscriber changes on an atomic pipeline.
struct SubscriberPipeline<'a> {
    pipe: &'a mut Pipeline,
    key: String,
}

impl MembershipSink<Username> for SubscriberPipeline<'_> {
    type Error = Infallible;

    fn remove(&mut self, member: &Username) -> Result<(), Infallible> {
        self.pipe.cmd("SREM").arg(&self.key).arg(member.as_str()).ignore();
        Ok(())
    }

    fn add(&mut self, member: &Username) -> Result<(), Infallible> {
        self.pipe.cmd("SADD").arg(&self.key).arg(member.as_str()).ignore();
        Ok(())
    }
}

impl RedisRepositoryDirectory {
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

    fn repository_key(&self, repository: &Identifier) -> String {
        format!("{}:repository:{repository}", self.prefix)
    }

    fn subscribers_key(&self, repository: &Identifier) -> String {
        format!("{}:repository:{repository}:subscribers", self.prefix)
    }

    /// Current subscribers. Stored names that are not valid usernames are skipped.
    pub fn subscribers(&self, repository: &Identifier) -> Result<BTreeSet<Username>, DirectoryError> {
        let mut conn = connect(&self.client)?;
        let raw: Vec<String> = conn
            .smembers(self.subscribers_key(repository))
            .map_err(RedisStoreError::from)?;
        Ok(raw
            .into_iter()
            .filter_map(|name| match Username::parse(name.as_str()) {
                Ok(user) => Some(user),
                Err(e) => {
                    warn!(identifier = %repository, name = %name, error = %e, "ignoring invalid subscriber");
                    None
                }
            })
            .collect())
    }

    /// Replace the subscribers of `repository` with `desired` in one transaction.
    pub fn replace_subscribers(
        &self,
        repository: &Identifier,
        desired: &BTreeSet<Username>,
    ) -> Result<MembershipReplaced<Username>, DirectoryError> {
        let current = self.subscribers(repository)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut sink = SubscriberPipeline {
            pipe: &mut pipe,
            key: self.subscribers_key(repository),
        };
        let Ok(replaced) = reconcile_members(&current, desired, &mut sink);
        if replaced.is_noop() {
            return Ok(replaced);
        }

        let mut conn = connect(&self.client)?;
        pipe.query::<()>(&mut conn).map_err(RedisStoreError::from)?;
        info!(
            identifier = %repository,
            removed = replaced.removed.len(),
            added = replaced.added.len(),
            "subscribers replaced"
        );
        Ok(replaced)
    }
}

impl RepositoryDirectory for RedisRepositoryDirectory {
    fn has_subscriptions(&self, repository: &Identifier) -> Result<bool, DirectoryError> {
        let mut conn = connect(&self.client)?;
        let count: u64 = conn
            .scard(self.subscribers_key(repository))
            .map_err(RedisStoreError::from)?;
        Ok(count > 0)
    }

    fn hook_set(&self, repository: &Identifier) -> Result<bool, DirectoryError> {
        let mut conn = connect(&self.client)?;
        let value: Option<String> = conn
            .hget(self.repository_key(repository), "hook_set")
            .map_err(RedisStoreError::from)?;
        Ok(value.as_deref() == Some("1"))
    }

    fn set_hook(&self, repository: &Identifier, hook_set: bool) -> Result<(), DirectoryError> {
        let mut conn = connect(&self.client)?;
        let _: i64 = conn
            .hset(
                self.repository_key(repository),
                "hook_set",
                if hook_set { "1" } else { "0" },
            )
            .map_err(RedisStoreError::from)?;
        Ok(())
    }
}

/// API tokens: a flags hash per token and a rate-limit counter that expires
/// when the limit window ends.
#[derive(Debug, Clone)]
pub struct RedisTokenDirectory {
    client: Arc<redis::Client>,
    prefix: String,
}

impl RedisTokenDirectory {
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

    fn token_key(&self, token: &Identifier) -> String {
        format!("{}:token:{token}", self.prefix)
    }

    fn rate_limit_key(&self, token: &Identifier) -> String {
        format!("{}:token:{token}:rate-limit", self.prefix)
    }
}

impl TokenDirectory for RedisTokenDirectory {
    fn reset_flags(&self, token: &Identifier) -> Result<bool, DirectoryError> {
        let mut conn = connect(&self.client)?;
        let limited: bool = conn
            .exists(self.rate_limit_key(token))
            .map_err(RedisStoreError::from)?;
        if limited {
            return Ok(false);
        }
        let _: i64 = conn
            .hset(self.token_key(token), "available", "1")
            .map_err(RedisStoreError::from)?;
        Ok(true)
    }

    fn rate_limit_ttl(&self, token: &Identifier) -> Result<Option<u64>, DirectoryError> {
        let mut conn = connect(&self.client)?;
        // -2: no counter, -1: counter without expiry.
        let ttl: i64 = conn
            .ttl(self.rate_limit_key(token))
            .map_err(RedisStoreError::from)?;
        Ok(u64::try_from(ttl).ok())
    }

    fn mark_rate_limited(&self, token: &Identifier, ttl: u64) -> Result<(), DirectoryError> {
        let mut conn = connect(&self.client)?;
        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.token_key(token))
            .arg("available")
            .arg("0")
            .ignore()
            .cmd("SET")
            .arg(self.rate_limit_key(token))
            .arg(1)
            .arg("EX")
            // EX rejects 0.
            .arg(ttl.max(1))
            .ignore()
            .query::<()>(&mut conn)
            .map_err(RedisStoreError::from)?;
        Ok(())
    }
}
