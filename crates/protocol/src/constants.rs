use std::time::Duration;

use chrono::TimeDelta;

/// Maximum number of transfers allowed in the Active state at once.
pub const MAX_CONCURRENT_TRANSFERS: usize = 3;

/// Free space that must remain on the artifact volume before a transfer
/// is admitted (100 MiB).
pub const SPACE_RESERVE_BYTES: u64 = 100 * 1024 * 1024;

/// Number of days a completed artifact stays valid.
pub const ARTIFACT_VALIDITY_DAYS: i64 = 30;

/// How often the host should run the expiry sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// File name prefix for persisted resume tokens.
pub const RESUME_FILE_PREFIX: &str = "resume-";

/// File name extension for persisted resume tokens.
pub const RESUME_FILE_EXTENSION: &str = "dat";

/// Highest progress fraction an unfinished transfer may report.
///
/// 1.0 is reserved for completed records.
pub const MAX_ACTIVE_PROGRESS: f32 = 0.999;

/// Returns the validity window for a given number of days.
///
/// Out-of-range values fall back to [`ARTIFACT_VALIDITY_DAYS`].
pub fn validity_window(days: i64) -> TimeDelta {
    TimeDelta::try_days(days)
        .unwrap_or_else(|| TimeDelta::days(ARTIFACT_VALIDITY_DAYS))
}

/// Returns `true` if `name` looks like a resume token file.
pub fn is_resume_file_name(name: &str) -> bool {
    name.starts_with(RESUME_FILE_PREFIX)
        && name
            .rsplit_once('.')
            .is_some_and(|(_, ext)| ext == RESUME_FILE_EXTENSION)
}
