//! Job storage and execution.
//!
//! ## Components
//!
//! - `InMemoryJobQueue`: the [`hubjobs_jobs::JobQueue`] collaborator, in process
//! - `ErrorLogStore`: failed runs, ordered by date, swept by the cleanup
//! - `JobExecutor`: claims records, runs the registered behavior, reschedules

pub mod error_log;
pub mod executor;
pub mod store;

pub use error_log::{ErrorEntry, ErrorLogError, ErrorLogStore, InMemoryErrorLog, day_of};
pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, Outcome};
pub use store::InMemoryJobQueue;
