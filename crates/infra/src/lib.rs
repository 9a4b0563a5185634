//! Infrastructure layer: job stores, executor, cleanup, config, external services.

pub mod cleanup;
pub mod config;
pub mod directory;
pub mod jobs;

/// Redis adapters (job queue, error log, directories).
#[cfg(feature = "redis")]
pub mod redis;

/// GitHub REST client.
#[cfg(feature = "github")]
pub mod github;

#[cfg(test)]
mod integration_tests;
