fn main() {
    println!("Run `cargo test -p schema-compat` to execute persisted state compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use chrono::{TimeZone, Utc};
    use vidvault_protocol::TransferState;
    use vidvault_transfer::{PersistedRecord, ResumeTokenCache, TransferStore};

    const INTRO: &str = "https://cdn.example.com/videos/intro.mp4";
    const LESSON_2: &str = "https://cdn.example.com/videos/lesson-2.mp4";
    const LESSON_3: &str = "https://cdn.example.com/videos/lesson-3.mp4";
    const LESSON_2_TOKEN: &str = "resume-6f1c2a9e-3b7d-4e51-9a0f-2d8c4b7e1a35.dat";

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Normalizes numbers so that `1` and `1.0` compare as equal.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => serde_json::json!(f),
                None => v.clone(),
            },
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect(),
            ),
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Copies a fixture into `dir` under `as_name`.
    fn install_fixture(dir: &Path, name: &str, as_name: &str) -> PathBuf {
        let dest = dir.join(as_name);
        fs::copy(fixtures_dir().join(name), &dest).unwrap();
        dest
    }

    #[test]
    fn persisted_records_roundtrip() {
        let fixture = load_fixture("transfers.json");
        let parsed: Vec<PersistedRecord> = serde_json::from_value(fixture.clone()).unwrap();
        // Through text, so f32 progress is printed the way the store writes it.
        let text = serde_json::to_string(&parsed).unwrap();
        let reserialized: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "transfers.json changed shape after a roundtrip"
        );
    }

    #[test]
    fn persisted_records_use_camel_case() {
        let fixture = load_fixture("transfers.json");
        let first = fixture[0].as_object().unwrap();
        for field in ["resourceKey", "localArtifactName", "createdAt", "expiresAt"] {
            assert!(first.contains_key(field), "missing {field}");
        }
        assert!(!first.contains_key("resource_key"));
    }

    #[test]
    fn store_derives_states_from_fixture() {
        let tmp = tempfile::tempdir().unwrap();
        let path = install_fixture(tmp.path(), "transfers.json", "transfers.json");

        let store = TransferStore::open(path).unwrap();
        assert!(!store.recovered_from_corrupt());
        assert_eq!(store.len(), 3);

        let intro = store.get(INTRO).unwrap();
        assert_eq!(intro.state, TransferState::Completed);
        assert_eq!(intro.local_artifact_name.as_deref(), Some("intro.mp4"));
        assert_eq!(
            intro.expires_at,
            Some(Utc.with_ymd_and_hms(2026, 2, 4, 10, 0, 0).unwrap())
        );

        let lesson_2 = store.get(LESSON_2).unwrap();
        assert_eq!(lesson_2.state, TransferState::Paused);
        assert_eq!(lesson_2.resume_token_ref.as_deref(), Some(LESSON_2_TOKEN));
        assert!((lesson_2.progress - 0.42).abs() < 1e-6);

        let lesson_3 = store.get(LESSON_3).unwrap();
        assert_eq!(lesson_3.state, TransferState::NotStarted);
        assert!((lesson_3.progress - 0.1).abs() < 1e-6);

        for record in store.all() {
            assert!(record.is_consistent(), "{record:?}");
        }
    }

    #[test]
    fn store_rewrite_keeps_fixture_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let path = install_fixture(tmp.path(), "transfers.json", "transfers.json");

        let store = TransferStore::open(path.clone()).unwrap();
        store.flush().unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(
            normalize_value(&written),
            normalize_value(&load_fixture("transfers.json"))
        );
    }

    #[test]
    fn minimal_records_get_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = install_fixture(tmp.path(), "transfers_minimal.json", "transfers.json");

        let store = TransferStore::open(path).unwrap();

        let old = store.get("https://cdn.example.com/videos/old.mp4").unwrap();
        assert_eq!(old.state, TransferState::NotStarted);
        assert!((old.progress - 0.5).abs() < 1e-6);

        // Downloaded without a file name cannot be served, so it starts over.
        let broken = store.get("https://cdn.example.com/videos/broken.mp4").unwrap();
        assert_eq!(broken.state, TransferState::NotStarted);
        assert_eq!(broken.progress, 0.0);
        assert!(broken.local_artifact_name.is_none());
    }

    #[test]
    fn resume_index_fixture_loads() {
        let tmp = tempfile::tempdir().unwrap();
        let state_dir = tmp.path().join("state");
        let blob_dir = tmp.path().join("downloads");
        fs::create_dir_all(&state_dir).unwrap();
        fs::create_dir_all(&blob_dir).unwrap();
        let index = install_fixture(&state_dir, "resume-index.json", "resume-index.json");
        fs::write(blob_dir.join(LESSON_2_TOKEN), b"opaque").unwrap();

        let cache = ResumeTokenCache::open(index, blob_dir).unwrap();
        assert_eq!(cache.file_name(LESSON_2).as_deref(), Some(LESSON_2_TOKEN));
        assert_eq!(cache.load(LESSON_2).unwrap().as_deref(), Some(&b"opaque"[..]));
        assert!(cache.load(INTRO).unwrap().is_none());
    }
}
