//! Byte transfer for vidvault.
//!
//! [`TransportSession`] is the seam between the scheduler and the network:
//! it starts transfers, cancels them (optionally yielding a resume token)
//! and reports progress through a single event channel. [`HttpTransport`]
//! is the production implementation on top of one shared `reqwest` client.

mod http;
mod session;

pub use http::{HttpTransport, HttpTransportConfig};
pub use session::{
    BoxFuture, InFlightTask, TaskHandle, TransportEvent, TransportFailure, TransportSession,
};

/// Errors from starting a transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid resume token: {0}")]
    InvalidToken(String),

    #[error("unknown task: {0}")]
    UnknownTask(TaskHandle),
}
