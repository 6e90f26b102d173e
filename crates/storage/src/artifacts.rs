//! Directory of completed artifacts.
//!
//! Artifacts are stored flat under a root directory and named after the
//! last path segment of their source URL. Transport partial files live
//! in `<root>/.partial/` so that installing an artifact is a rename on
//! the same filesystem.

use std::io;
use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

use vidvault_protocol::constants::is_resume_file_name;

/// Name of the subdirectory that holds in-progress transport output.
pub const PARTIAL_DIR_NAME: &str = ".partial";

/// Suffix of the staging file used when a rename crosses filesystems.
const INCOMING_SUFFIX: &str = ".incoming";

/// Completed artifact storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct ArtifactDir {
    root: PathBuf,
}

impl ArtifactDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the default artifact root (`<data dir>/vidvault/downloads`).
    pub fn default_root() -> Option<PathBuf> {
        default_data_dir().map(|d| d.join("vidvault").join("downloads"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for transport partial files.
    pub fn partial_dir(&self) -> PathBuf {
        self.root.join(PARTIAL_DIR_NAME)
    }

    /// Full path of the artifact with the given name.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Creates the root and partial directories.
    pub fn ensure(&self) -> io::Result<()> {
        std::fs::create_dir_all(self.partial_dir())
    }

    /// Moves finished transport output into place as `name`.
    ///
    /// Any stale file at the destination is replaced. When a plain rename
    /// is not possible the data is copied next to the destination first and
    /// then renamed, so readers never observe a half-written artifact.
    pub fn install(&self, temp: &Path, name: &str) -> io::Result<PathBuf> {
        std::fs::create_dir_all(&self.root)?;
        let dest = self.path_for(name);

        if dest.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is a directory", dest.display()),
            ));
        }

        match std::fs::rename(temp, &dest) {
            Ok(()) => {}
            Err(e) => {
                debug!(error = %e, "rename failed, copying artifact instead");
                let staging = self.root.join(format!("{name}{INCOMING_SUFFIX}"));
                if let Err(e) = std::fs::copy(temp, &staging)
                    .and_then(|_| std::fs::rename(&staging, &dest))
                {
                    let _ = std::fs::remove_file(&staging);
                    return Err(e);
                }
                if let Err(e) = std::fs::remove_file(temp) {
                    warn!(path = %temp.display(), error = %e, "failed to remove transfer output");
                }
            }
        }

        debug!(path = %dest.display(), "artifact installed");
        Ok(dest)
    }

    /// Deletes the named artifact. Returns `false` if it did not exist.
    pub fn remove(&self, name: &str) -> io::Result<bool> {
        match std::fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Lists completed artifact names, sorted.
    pub fn list(&self) -> io::Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut names = Vec::new();
        for entry in entries.flatten() {
            if !entry.file_type().is_ok_and(|t| t.is_file()) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.')
                || is_resume_file_name(&name)
                || name.ends_with(INCOMING_SUFFIX)
            {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }
}

/// Derives the artifact file name for a resource URL.
///
/// Uses the last non-empty path segment, percent-decoded. Falls back to a
/// hash of the URL when no usable segment exists.
pub fn name_for(resource_key: &str) -> String {
    Url::parse(resource_key)
        .ok()
        .and_then(|url| {
            url.path_segments()?
                .rev()
                .find(|s| !s.is_empty())
                .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
        })
        .map(|s| sanitize(&s))
        .filter(|s| !s.is_empty() && s != "." && s != "..")
        .unwrap_or_else(|| hash_url(resource_key))
}

/// [`name_for`] prefixed with a short hash of the URL.
///
/// Used when the plain name already belongs to another resource.
pub fn distinct_name_for(resource_key: &str) -> String {
    let hash = hash_url(resource_key);
    format!("{}-{}", &hash[..8], name_for(resource_key))
}

/// Replaces characters that are not valid in a single file name.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | '\0' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

/// First 16 bytes of the SHA-256 of `url`, hex-encoded.
fn hash_url(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex::encode(&digest[..16])
}

/// Returns the platform-specific data directory.
pub fn default_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_DATA_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".local").join("share"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".local").join("share"))
    }
}
