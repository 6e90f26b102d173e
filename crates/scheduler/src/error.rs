use vidvault_transfer::TransferError;

/// Errors returned by [`Scheduler`](crate::Scheduler) operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] TransferError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid resource key: {0}")]
    InvalidKey(String),

    #[error("insufficient disk space")]
    InsufficientSpace,

    #[error("no transfer for {0}")]
    NotFound(String),

    #[error("transfer not active: {0}")]
    NotActive(String),

    #[error("transport events already taken")]
    EventsUnavailable,
}
