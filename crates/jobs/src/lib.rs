//! `hubjobs-jobs`
//!
//! **Responsibility:** the recurring job protocol, independent of storage.
//!
//! - Job records and queues (data model + the [`JobQueue`] collaborator trait)
//! - The [`Job`] contract and its type-erased [`JobBehavior`]
//! - Reschedule policies and cross-job coordination
//! - The concrete job types in [`kinds`]
//!
//! Stores, workers and cleanup live in `hubjobs-infra`.

pub mod collaborators;
pub mod coordination;
pub mod job;
pub mod kinds;
pub mod policy;
pub mod queue;
pub mod record;
pub mod registry;

pub use collaborators::{
    ApiError, DirectoryError, EventsPage, RemoteApi, RepositoryDirectory, Throttled,
    TokenDirectory,
};
pub use job::{Completion, Job, JobBehavior, JobError, NextRun};
pub use queue::{DEFAULT_LOG_CAPACITY, JobQueue, Queue, QueueError, QueueIndex, QueueKey};
pub use record::{Fields, JobRecord, JobStatus, NewJob};
pub use registry::JobRegistry;
