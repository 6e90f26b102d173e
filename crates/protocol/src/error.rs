//! Failure classification reported to the notifier.

/// Why a transfer did not (or could not) make progress.
///
/// Every kind is local to one resource; none of them is fatal to the
/// scheduler as a whole.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("insufficient disk space")]
    InsufficientSpace,

    #[error("cancelled")]
    Cancelled,

    #[error("transfer timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("persisted state unreadable: {0}")]
    PersistenceCorrupt(String),

    #[error("failed to move artifact into place: {0}")]
    MoveFailed(String),
}

impl ErrorKind {
    /// Returns `true` when the caller should be offered an explicit retry.
    pub fn offers_retry(&self) -> bool {
        matches!(self, ErrorKind::Timeout)
    }

    /// Returns `true` for pause/cancel, which are never reported as failures.
    pub fn is_user_initiated(&self) -> bool {
        matches!(self, ErrorKind::Cancelled)
    }
}
