//! Free disk space queries.

use std::path::Path;

use sysinfo::Disks;
use tracing::{debug, warn};

/// Reports available space on the volume holding a path.
pub trait StorageProbe: Send + Sync {
    /// Returns free bytes for the volume containing `path`, if known.
    fn free_space(&self, path: &Path) -> Option<u64>;

    /// Returns `true` if at least `reserve` bytes are free at `path`.
    ///
    /// Unknown free space counts as insufficient.
    fn has_reserve(&self, path: &Path, reserve: u64) -> bool {
        match self.free_space(path) {
            Some(available) => {
                debug!(available, reserve, path = %path.display(), "free space");
                available >= reserve
            }
            None => {
                warn!(path = %path.display(), "could not determine free space");
                false
            }
        }
    }
}

/// [`StorageProbe`] backed by the system disk list.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskProbe;

impl DiskProbe {
    pub fn new() -> Self {
        Self
    }
}

impl StorageProbe for DiskProbe {
    fn free_space(&self, path: &Path) -> Option<u64> {
        let disks = Disks::new_with_refreshed_list();
        let target = existing_ancestor(path);
        closest_mount(
            &target,
            disks
                .list()
                .iter()
                .map(|disk| (disk.mount_point(), disk.available_space())),
        )
    }
}

/// Picks the available space of the deepest mount point containing `target`.
///
/// Mount points are matched by whole path components.
fn closest_mount<'a>(
    target: &Path,
    mounts: impl IntoIterator<Item = (&'a Path, u64)>,
) -> Option<u64> {
    let mut best: Option<(u64, usize)> = None;
    for (mount_point, available) in mounts {
        if target.starts_with(mount_point) {
            let depth = mount_point.components().count();
            if best.is_none_or(|(_, d)| depth > d) {
                best = Some((available, depth));
            }
        }
    }
    best.map(|(available, _)| available)
}

/// Canonicalizes the deepest existing ancestor of `path`.
///
/// The artifact directory may not exist yet on first run.
fn existing_ancestor(path: &Path) -> std::path::PathBuf {
    let mut current = Some(path);
    while let Some(p) = current {
        if let Ok(abs) = std::fs::canonicalize(p) {
            return abs;
        }
        current = p.parent();
    }
    path.to_path_buf()
}
