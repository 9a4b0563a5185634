//! External collaborators the jobs depend on.
//!
//! The jobs never talk to GitHub or to the application's database directly;
//! callers inject implementations of these traits.

use hubjobs_core::Identifier;
use thiserror::Error;

/// Outcome of one poll of a repository's event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventsPage {
    /// Number of entities updated from the fetched events.
    pub updated_count: u64,
    /// Polling interval requested by the remote service, in seconds.
    pub suggested_delay: Option<u64>,
}

/// A remote result where an exhausted rate limit is a value, not an error,
/// so the caller can back off precisely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttled<T> {
    Ready(T),
    /// `reset_in`: seconds until the limit window resets, when known.
    RateLimited { reset_in: Option<u64> },
}

impl<T> Throttled<T> {
    /// Lift [`ApiError::RateLimited`] out of the error channel.
    pub fn from_result(result: Result<T, ApiError>) -> Result<Self, ApiError> {
        match result {
            Ok(value) => Ok(Self::Ready(value)),
            Err(ApiError::RateLimited { reset_in }) => Ok(Self::RateLimited { reset_in }),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("remote service unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited (resets in {reset_in:?}s)")]
    RateLimited { reset_in: Option<u64> },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unexpected response: {0}")]
    Unexpected(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("unknown entity: {0}")]
    Unknown(Identifier),

    #[error("directory backend error: {0}")]
    Backend(String),
}

/// GitHub-like remote API.
pub trait RemoteApi: Send + Sync {
    /// Poll the events of a repository and apply them.
    fn fetch_events(&self, repository: &Identifier) -> Result<EventsPage, ApiError>;

    /// Whether a webhook pointing at this application is registered.
    fn hook_is_set(&self, repository: &Identifier) -> Result<bool, ApiError>;

    /// The token requests are made with; rate limits are tracked per token.
    fn token(&self) -> Option<Identifier> {
        None
    }
}

/// Read/write access to the repository entities owned by the web application.
pub trait RepositoryDirectory: Send + Sync {
    fn has_subscriptions(&self, repository: &Identifier) -> Result<bool, DirectoryError>;

    fn hook_set(&self, repository: &Identifier) -> Result<bool, DirectoryError>;

    fn set_hook(&self, repository: &Identifier, hook_set: bool) -> Result<(), DirectoryError>;
}

/// API tokens and their rate-limit counters.
pub trait TokenDirectory: Send + Sync {
    /// Mark the token usable again. Returns `false` while it is still rate limited.
    fn reset_flags(&self, token: &Identifier) -> Result<bool, DirectoryError>;

    /// Remaining time-to-live, in seconds, of the token's rate-limit counter.
    fn rate_limit_ttl(&self, token: &Identifier) -> Result<Option<u64>, DirectoryError>;

    /// Flag the token unusable and start its rate-limit counter with `ttl` seconds to live.
    fn mark_rate_limited(&self, token: &Identifier, ttl: u64) -> Result<(), DirectoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rate_limits_become_values() {
        assert_eq!(Throttled::from_result(Ok::<_, ApiError>(3)), Ok(Throttled::Ready(3)));
        assert_eq!(
            Throttled::<u8>::from_result(Err(ApiError::RateLimited { reset_in: Some(9) })),
            Ok(Throttled::RateLimited { reset_in: Some(9) })
        );
        assert_eq!(
            Throttled::<u8>::from_result(Err(ApiError::NotFound("x".into()))),
            Err(ApiError::NotFound("x".into()))
        );
    }
}
