//! Transfer scheduling for vidvault.
//!
//! [`Scheduler`] owns every state transition: it bounds concurrent
//! transfers, queues the rest in FIFO order, consumes transport events
//! through a single lock and reports outcomes to a [`Notifier`].

mod config;
mod error;
mod notifier;
mod reattach;
mod scheduler;
mod sweep;

#[cfg(test)]
mod testing;

pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use notifier::{ChannelNotifier, Notifier, TransferEvent};
pub use reattach::ReattachReport;
pub use scheduler::{Scheduler, StartOutcome};
pub use sweep::SweepReport;
