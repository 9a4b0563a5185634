//! The concrete job types.

pub mod check_hook;
pub mod fetch_events;
pub mod reset_token;

pub use check_hook::CheckRepositoryHook;
pub use fetch_events::FetchRepositoryEvents;
pub use reset_token::ResetTokenFlags;
