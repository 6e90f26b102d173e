//! Shared types for the vidvault transfer manager.
//!
//! Every other crate in the workspace speaks in terms of the
//! [`TransferRecord`] defined here: the store persists it, the scheduler
//! mutates it and the notifier reports on it.

pub mod constants;
pub mod error;
pub mod record;

// Re-export primary types for convenience.
pub use error::ErrorKind;
pub use record::{TransferRecord, TransferState};
