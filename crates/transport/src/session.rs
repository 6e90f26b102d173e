use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::TransportError;

/// Boxed future returned by [`TransportSession`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Identity of one transfer task inside a transport session.
///
/// Handles are never reused, so an event carrying an old handle can be
/// recognised as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(pub u64);

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Why a task stopped without completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// Stopped by [`TransportSession::cancel`].
    Cancelled,
    /// No response or body bytes within the stall window.
    Timeout,
    /// Any other network or local I/O fault.
    Other(String),
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFailure::Cancelled => f.write_str("cancelled"),
            TransportFailure::Timeout => f.write_str("timed out"),
            TransportFailure::Other(msg) => f.write_str(msg),
        }
    }
}

/// Callback delivered by a transport session.
///
/// For one task, progress events arrive in non-decreasing byte order and
/// the terminal event (`Completed` or `Failed`) comes last.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Progress {
        handle: TaskHandle,
        bytes_written: u64,
        bytes_expected: Option<u64>,
    },
    Completed {
        handle: TaskHandle,
        /// Temporary file holding the full body.
        location: PathBuf,
    },
    Failed {
        handle: TaskHandle,
        failure: TransportFailure,
    },
}

impl TransportEvent {
    pub fn handle(&self) -> TaskHandle {
        match self {
            TransportEvent::Progress { handle, .. }
            | TransportEvent::Completed { handle, .. }
            | TransportEvent::Failed { handle, .. } => *handle,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransportEvent::Progress { .. })
    }
}

/// A task the session is still running, with the tag it was created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightTask {
    pub handle: TaskHandle,
    pub tag: String,
}

/// Process-wide transfer session.
///
/// One instance serves every transfer. Tasks carry a caller-chosen tag so
/// that a fresh scheduler can find and re-bind them.
pub trait TransportSession: Send + Sync {
    /// Starts downloading `url` from the beginning.
    fn begin_fresh(&self, url: &str, tag: &str) -> Result<TaskHandle, TransportError>;

    /// Continues a transfer from a token produced by [`cancel`](Self::cancel).
    fn begin_from_token(&self, token: &[u8], tag: &str) -> Result<TaskHandle, TransportError>;

    /// Stops a task. Resolves to a resume token when the transfer can be
    /// continued later.
    fn cancel(&self, handle: TaskHandle) -> BoxFuture<'_, Option<Vec<u8>>>;

    /// Frees transport-side state behind a token that will never be used.
    fn release_token(&self, _token: &[u8]) {}

    /// Lists tasks that have not reached a terminal event.
    fn in_flight(&self) -> Vec<InFlightTask>;

    /// Takes the event receiver. Returns `None` after the first call.
    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;
}
