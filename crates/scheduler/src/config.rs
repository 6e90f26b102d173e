use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use vidvault_protocol::constants::{
    ARTIFACT_VALIDITY_DAYS, MAX_CONCURRENT_TRANSFERS, SPACE_RESERVE_BYTES, SWEEP_INTERVAL,
    validity_window,
};
use vidvault_storage::{ArtifactDir, default_data_dir};

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum transfers in the Active state.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Free bytes required on the artifact volume to admit a transfer.
    #[serde(default = "default_space_reserve")]
    pub space_reserve_bytes: u64,

    /// Days a completed artifact is kept.
    #[serde(default = "default_validity_days")]
    pub validity_days: i64,

    /// Seconds between expiry sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Directory for the record store and resume index.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Directory for completed artifacts and resume files.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
}

fn default_max_concurrent() -> usize {
    MAX_CONCURRENT_TRANSFERS
}

fn default_space_reserve() -> u64 {
    SPACE_RESERVE_BYTES
}

fn default_validity_days() -> i64 {
    ARTIFACT_VALIDITY_DAYS
}

fn default_sweep_interval_secs() -> u64 {
    SWEEP_INTERVAL.as_secs()
}

fn default_state_dir() -> PathBuf {
    default_data_dir()
        .map(|d| d.join("vidvault").join("state"))
        .unwrap_or_else(|| PathBuf::from("vidvault-state"))
}

fn default_artifact_dir() -> PathBuf {
    ArtifactDir::default_root().unwrap_or_else(|| PathBuf::from("vidvault-downloads"))
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            space_reserve_bytes: default_space_reserve(),
            validity_days: default_validity_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
            state_dir: default_state_dir(),
            artifact_dir: default_artifact_dir(),
        }
    }
}

impl SchedulerConfig {
    /// Default settings with both directories under `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            state_dir: root.join("state"),
            artifact_dir: root.join("downloads"),
            ..Self::default()
        }
    }

    /// Concurrency bound, never below one.
    pub fn concurrency(&self) -> usize {
        self.max_concurrent.max(1)
    }

    pub fn validity(&self) -> TimeDelta {
        validity_window(self.validity_days)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
