use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, warn};

use vidvault_protocol::constants::{RESUME_FILE_EXTENSION, RESUME_FILE_PREFIX, is_resume_file_name};

use crate::{TransferError, write_atomic};

/// Durable map from resource key to an opaque resume blob.
///
/// Each blob lives in its own `resume-<id>.dat` file inside `blob_dir`;
/// the key to file name mapping is kept in a JSON index.
pub struct ResumeTokenCache {
    index_path: PathBuf,
    blob_dir: PathBuf,
    files: RwLock<HashMap<String, String>>,
}

impl ResumeTokenCache {
    /// Opens the cache, loading the index from disk.
    ///
    /// An unreadable index is treated as empty.
    pub fn open(index_path: PathBuf, blob_dir: PathBuf) -> Result<Self, TransferError> {
        std::fs::create_dir_all(&blob_dir)?;
        let files = match load_index(&index_path) {
            Ok(files) => files,
            Err(e) => {
                warn!(path = %index_path.display(), error = %e, "resume index unreadable, starting empty");
                HashMap::new()
            }
        };
        Ok(Self {
            index_path,
            blob_dir,
            files: RwLock::new(files),
        })
    }

    /// Stores a blob for `key`, replacing any previous one.
    ///
    /// Returns the generated file name.
    pub fn store(&self, key: &str, blob: &[u8]) -> Result<String, TransferError> {
        let name = format!(
            "{RESUME_FILE_PREFIX}{}.{RESUME_FILE_EXTENSION}",
            uuid::Uuid::new_v4()
        );
        write_atomic(&self.blob_dir.join(&name), blob)?;

        let previous = self
            .files
            .write()
            .unwrap()
            .insert(key.to_string(), name.clone());
        self.persist()?;

        if let Some(old) = previous {
            self.remove_blob(&old);
        }
        debug!(key, file = %name, bytes = blob.len(), "resume token stored");
        Ok(name)
    }

    /// Loads the blob for `key`.
    ///
    /// A mapping whose file has gone missing is dropped and reported as
    /// no token.
    pub fn load(&self, key: &str) -> Result<Option<Vec<u8>>, TransferError> {
        let Some(name) = self.file_name(key) else {
            return Ok(None);
        };
        match std::fs::read(self.blob_dir.join(&name)) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(key, file = %name, "resume token file missing");
                self.files.write().unwrap().remove(key);
                self.persist()?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes the blob and mapping for `key`. Returns `false` if none existed.
    pub fn evict(&self, key: &str) -> Result<bool, TransferError> {
        let removed = self.files.write().unwrap().remove(key);
        let Some(name) = removed else {
            return Ok(false);
        };
        self.persist()?;
        self.remove_blob(&name);
        debug!(key, file = %name, "resume token evicted");
        Ok(true)
    }

    /// Returns the file name mapped to `key`, if any.
    pub fn file_name(&self, key: &str) -> Option<String> {
        self.files.read().unwrap().get(key).cloned()
    }

    /// Returns `true` if `key` has a mapping whose file exists.
    pub fn contains(&self, key: &str) -> bool {
        self.file_name(key)
            .is_some_and(|name| self.blob_dir.join(name).is_file())
    }

    /// Returns all keys with a stored token.
    pub fn keys(&self) -> Vec<String> {
        self.files.read().unwrap().keys().cloned().collect()
    }

    /// Deletes resume files in the blob directory that no key refers to.
    ///
    /// Returns the number of files removed.
    pub fn prune_orphans(&self) -> Result<usize, TransferError> {
        let known: Vec<String> = self.files.read().unwrap().values().cloned().collect();
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.blob_dir)?.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_resume_file_name(&name) && !known.contains(&name) {
                self.remove_blob(&name);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "pruned orphaned resume files");
        }
        Ok(removed)
    }

    /// Rewrites the index file from memory.
    pub fn flush(&self) -> Result<(), TransferError> {
        self.persist()
    }

    fn remove_blob(&self, name: &str) {
        let path = self.blob_dir.join(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove resume file"),
        }
    }

    fn persist(&self) -> Result<(), TransferError> {
        let json = {
            let map = self.files.read().unwrap();
            serde_json::to_vec_pretty(&*map)?
        };
        write_atomic(&self.index_path, &json)?;
        Ok(())
    }
}

fn load_index(path: &Path) -> Result<HashMap<String, String>, TransferError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };
    let files: HashMap<String, String> = serde_json::from_slice(&data)?;
    debug!("loaded {} resume token(s) from {:?}", files.len(), path);
    Ok(files)
}
