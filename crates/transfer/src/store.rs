use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use vidvault_protocol::{TransferRecord, TransferState};

use crate::{TransferError, write_atomic};

/// On-disk shape of one transfer record.
///
/// Only durable facts are stored; the live state is derived on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord {
    pub resource_key: String,
    pub progress: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_artifact_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_file_name: Option<String>,
    #[serde(default)]
    pub downloaded: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&TransferRecord> for PersistedRecord {
    fn from(r: &TransferRecord) -> Self {
        let downloaded = r.state == TransferState::Completed;
        Self {
            resource_key: r.resource_key.clone(),
            progress: r.progress,
            local_artifact_name: r.local_artifact_name.clone(),
            resume_file_name: r.resume_token_ref.clone(),
            downloaded,
            created_at: r.created_at,
            expires_at: r.expires_at,
        }
    }
}

impl PersistedRecord {
    /// Rebuilds a record after a restart.
    ///
    /// `downloaded` means Completed and a resume file means Paused.
    /// Anything else comes back NotStarted with its progress kept, since
    /// no transfer survives the process unless the transport reattaches it.
    pub fn into_record(self) -> TransferRecord {
        let progress = if self.progress.is_finite() {
            self.progress.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let mut record = TransferRecord {
            resource_key: self.resource_key,
            state: TransferState::NotStarted,
            progress,
            local_artifact_name: None,
            resume_token_ref: None,
            created_at: self.created_at,
            expires_at: None,
        };

        match (self.downloaded, self.local_artifact_name) {
            (true, Some(name)) => {
                record.state = TransferState::Completed;
                record.progress = 1.0;
                record.local_artifact_name = Some(name);
                record.expires_at = self.expires_at;
            }
            (true, None) => {
                warn!(key = %record.resource_key, "completed record without artifact name, resetting");
                record.progress = 0.0;
            }
            (false, _) => {
                record.set_progress(progress);
                if let Some(file) = self.resume_file_name {
                    record.mark_paused(file);
                }
            }
        }
        record
    }
}

/// Durable map from resource key to [`TransferRecord`].
///
/// Records are cached in memory and the whole set is rewritten on every
/// change. Unreadable files are treated as empty.
pub struct TransferStore {
    path: PathBuf,
    records: RwLock<HashMap<String, TransferRecord>>,
    recovered: bool,
}

impl TransferStore {
    /// Opens the store at `path`, loading existing records.
    pub fn open(path: PathBuf) -> Result<Self, TransferError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let (records, recovered) = match load_records(&path) {
            Ok(records) => (records, false),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "transfer store unreadable, starting empty");
                set_aside(&path);
                (HashMap::new(), true)
            }
        };
        Ok(Self {
            path,
            records: RwLock::new(records),
            recovered,
        })
    }

    /// Returns `true` if the file on disk was unreadable at open time.
    pub fn recovered_from_corrupt(&self) -> bool {
        self.recovered
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the record for `key`, if any.
    pub fn get(&self, key: &str) -> Option<TransferRecord> {
        self.records.read().unwrap().get(key).cloned()
    }

    /// Returns all records ordered by creation time.
    pub fn all(&self) -> Vec<TransferRecord> {
        let mut all: Vec<_> = self.records.read().unwrap().values().cloned().collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.resource_key.cmp(&b.resource_key))
        });
        all
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts or replaces a record and persists the store.
    pub fn upsert(&self, record: TransferRecord) -> Result<(), TransferError> {
        {
            let mut map = self.records.write().unwrap();
            map.insert(record.resource_key.clone(), record);
        }
        self.persist()
    }

    /// Removes a record. Returns `false` if it did not exist.
    pub fn delete(&self, key: &str) -> Result<bool, TransferError> {
        let removed = self.records.write().unwrap().remove(key).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Rewrites the store file from memory.
    pub fn flush(&self) -> Result<(), TransferError> {
        self.persist()
    }

    fn persist(&self) -> Result<(), TransferError> {
        let rows: Vec<PersistedRecord> = self.all().iter().map(PersistedRecord::from).collect();
        let json = serde_json::to_vec_pretty(&rows)?;
        write_atomic(&self.path, &json)?;
        debug!("persisted {} transfer record(s) to {:?}", rows.len(), self.path);
        Ok(())
    }
}

fn load_records(path: &Path) -> Result<HashMap<String, TransferRecord>, TransferError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };
    let rows: Vec<PersistedRecord> = serde_json::from_slice(&data)?;
    let records: HashMap<_, _> = rows
        .into_iter()
        .map(|row| {
            let record = row.into_record();
            (record.resource_key.clone(), record)
        })
        .collect();
    debug!("loaded {} transfer record(s) from {:?}", records.len(), path);
    Ok(records)
}

/// Moves an unreadable store file out of the way.
fn set_aside(path: &Path) {
    if !path.exists() {
        return;
    }
    let mut aside = path.as_os_str().to_owned();
    aside.push(".corrupt");
    if let Err(e) = std::fs::rename(path, &aside) {
        warn!(path = %path.display(), error = %e, "failed to set aside unreadable store");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn test_store() -> (tempfile::TempDir, TransferStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = TransferStore::open(tmp.path().join("transfers.json")).unwrap();
        (tmp, store)
    }

    fn record(key: &str) -> TransferRecord {
        TransferRecord::new(key, Utc::now())
    }

    #[test]
    fn new_store_empty() {
        let (_tmp, store) = test_store();
        assert!(store.is_empty());
        assert!(!store.recovered_from_corrupt());
        assert!(store.get("https://a/x.mp4").is_none());
    }

    #[test]
    fn upsert_get_delete() {
        let (_tmp, store) = test_store();
        let mut r = record("https://a/x.mp4");
        store.upsert(r.clone()).unwrap();
        r.set_progress(0.5);
        store.upsert(r.clone()).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("https://a/x.mp4").unwrap().progress, 0.5);
        assert!(store.delete("https://a/x.mp4").unwrap());
        assert!(!store.delete("https://a/x.mp4").unwrap());
    }

    #[test]
    fn reload_derives_state() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("transfers.json");

        let mut active = record("https://a/active.mp4");
        active.mark_active(true);
        active.set_progress(0.42);

        let mut paused = record("https://a/paused.mp4");
        paused.set_progress(0.3);
        paused.mark_paused("resume-1.dat".into());

        let mut done = record("https://a/done.mp4");
        done.mark_completed("done.mp4".into(), TimeDelta::days(30));

        let mut failed = record("https://a/failed.mp4");
        failed.mark_failed(true);

        {
            let store = TransferStore::open(path.clone()).unwrap();
            for r in [&active, &paused, &done, &failed] {
                store.upsert(r.clone()).unwrap();
            }
        }

        let store = TransferStore::open(path).unwrap();
        assert_eq!(store.len(), 4);

        let a = store.get(&active.resource_key).unwrap();
        assert_eq!(a.state, TransferState::NotStarted);
        assert_eq!(a.progress, 0.42);

        let p = store.get(&paused.resource_key).unwrap();
        assert_eq!(p.state, TransferState::Paused);
        assert_eq!(p.resume_token_ref.as_deref(), Some("resume-1.dat"));
        assert_eq!(p.progress, 0.3);

        let d = store.get(&done.resource_key).unwrap();
        assert_eq!(d, done);

        let f = store.get(&failed.resource_key).unwrap();
        assert_eq!(f.state, TransferState::NotStarted);

        assert!(store.all().iter().all(TransferRecord::is_consistent));
    }

    #[test]
    fn corrupt_file_fails_open() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("transfers.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let store = TransferStore::open(path.clone()).unwrap();
        assert!(store.is_empty());
        assert!(store.recovered_from_corrupt());
        assert!(tmp.path().join("transfers.json.corrupt").exists());

        store.upsert(record("https://a/x.mp4")).unwrap();
        let reopened = TransferStore::open(path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(!reopened.recovered_from_corrupt());
    }

    #[test]
    fn downloaded_without_name_resets() {
        let row = PersistedRecord {
            resource_key: "https://a/x.mp4".into(),
            progress: 1.0,
            local_artifact_name: None,
            resume_file_name: None,
            downloaded: true,
            created_at: Utc::now(),
            expires_at: None,
        };
        let r = row.into_record();
        assert_eq!(r.state, TransferState::NotStarted);
        assert_eq!(r.progress, 0.0);
        assert!(r.is_consistent());
    }

    #[test]
    fn out_of_range_progress_is_clamped() {
        let row = PersistedRecord {
            resource_key: "https://a/x.mp4".into(),
            progress: 7.5,
            local_artifact_name: None,
            resume_file_name: None,
            downloaded: false,
            created_at: Utc::now(),
            expires_at: None,
        };
        let r = row.into_record();
        assert!(r.progress < 1.0);
        assert!(r.is_consistent());
    }

    #[test]
    fn schema_field_names() {
        let mut r = record("https://a/x.mp4");
        r.mark_paused("resume-1.dat".into());
        let json = serde_json::to_value(PersistedRecord::from(&r)).unwrap();
        assert_eq!(json["resourceKey"], "https://a/x.mp4");
        assert_eq!(json["resumeFileName"], "resume-1.dat");
        assert_eq!(json["downloaded"], false);
        assert!(json.get("createdAt").is_some());
        assert!(json.get("localArtifactName").is_none());
    }
}
