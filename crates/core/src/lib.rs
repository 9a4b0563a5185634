//! `hubjobs-core`: shared building blocks.
//!
//! This crate contains **pure** primitives (no storage, no network): identifiers,
//! the error model, value objects and membership reconciliation.

pub mod error;
pub mod id;
pub mod reconcile;
pub mod value_object;

pub use error::{DomainError, DomainResult};
pub use id::{Identifier, JobId};
pub use reconcile::{MembershipReplaced, MembershipSink, reconcile_members};
pub use value_object::{Username, ValueObject};
