//! Local storage for vidvault.
//!
//! Provides the free-space probe used by admission control and the
//! directory that holds completed artifacts.

pub mod artifacts;
pub mod probe;

pub use artifacts::{ArtifactDir, default_data_dir, distinct_name_for, name_for};
pub use probe::{DiskProbe, StorageProbe};
