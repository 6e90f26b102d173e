//! Durable transfer state.
//!
//! [`TransferStore`] keeps one record per resource key in a JSON file.
//! [`ResumeTokenCache`] keeps opaque resume blobs as individual files
//! referenced from a small JSON index.

mod resume;
mod store;

pub use resume::ResumeTokenCache;
pub use store::{PersistedRecord, TransferStore};

/// File name of the transfer record store inside the state directory.
pub const RECORDS_FILE_NAME: &str = "transfers.json";

/// File name of the resume token index inside the state directory.
pub const RESUME_INDEX_FILE_NAME: &str = "resume-index.json";

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Writes `data` to `path` through a sibling temp file and a rename.
pub(crate) fn write_atomic(path: &std::path::Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}
