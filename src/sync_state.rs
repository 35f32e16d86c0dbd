//! Per-root sync manifest — `.minimem/sync-state.json`.
//!
//! Records, for every file a successful push or pull has handled, the exact
//! local and remote content hashes at that moment. The two-way classifier
//! below compares *current* hashes (computed from disk at operation time),
//! not the stored ones; the stored entries exist so `last-write-wins` has a
//! baseline to update.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::files::atomic_write;

/// Current manifest schema. v1 carried a `lastSyncedHash` per file that the
/// two-way design no longer uses; loading a v1 file drops it.
pub const SYNC_STATE_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileSyncState {
    pub local_hash: String,
    pub remote_hash: String,
    /// ISO-8601 timestamp of the last successful transfer for this file.
    pub last_modified: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub version: u32,
    pub central_path: String,
    pub last_sync: Option<String>,
    #[serde(default)]
    pub files: BTreeMap<String, FileSyncState>,
}

impl SyncState {
    pub fn new(central_path: &str) -> SyncState {
        SyncState {
            version: SYNC_STATE_VERSION,
            central_path: central_path.to_string(),
            last_sync: None,
            files: BTreeMap::new(),
        }
    }

    /// Load the manifest, or start a fresh one when the file does not exist.
    /// A v1 document migrates by keeping the fields v2 knows and restamping
    /// the version; unknown per-file fields (`lastSyncedHash`) are dropped by
    /// deserialization.
    pub fn load(path: &Path, central_path: &str) -> Result<SyncState> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SyncState::new(central_path))
            }
            Err(e) => return Err(Error::fs(path, e)),
        };
        let mut state: SyncState = serde_json::from_str(&raw)
            .map_err(|e| Error::Validation(format!("malformed {}: {e}", path.display())))?;
        if state.version < SYNC_STATE_VERSION {
            state.version = SYNC_STATE_VERSION;
        }
        Ok(state)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_string_pretty(self)?;
        atomic_write(path, body.as_bytes())
    }

    pub fn record_transfer(&mut self, rel_path: &str, hash: &str, timestamp: &str) {
        self.files.insert(
            rel_path.to_string(),
            FileSyncState {
                local_hash: hash.to_string(),
                remote_hash: hash.to_string(),
                last_modified: timestamp.to_string(),
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Two-way status classifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Unchanged,
    LocalOnly,
    RemoteOnly,
    LocalModified,
}

/// Classify a file from its current local and remote content hashes.
pub fn classify(local_hash: Option<&str>, remote_hash: Option<&str>) -> SyncStatus {
    match (local_hash, remote_hash) {
        (None, None) => SyncStatus::Unchanged,
        (Some(l), Some(r)) if l == r => SyncStatus::Unchanged,
        (Some(_), None) => SyncStatus::LocalOnly,
        (None, Some(_)) => SyncStatus::RemoteOnly,
        (Some(_), Some(_)) => SyncStatus::LocalModified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn classifier_covers_all_quadrants() {
        assert_eq!(classify(None, None), SyncStatus::Unchanged);
        assert_eq!(classify(Some("a"), Some("a")), SyncStatus::Unchanged);
        assert_eq!(classify(Some("a"), None), SyncStatus::LocalOnly);
        assert_eq!(classify(None, Some("b")), SyncStatus::RemoteOnly);
        assert_eq!(classify(Some("a"), Some("b")), SyncStatus::LocalModified);
    }

    #[test]
    fn missing_file_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let state = SyncState::load(&dir.path().join("sync-state.json"), "proj/").unwrap();
        assert_eq!(state.version, SYNC_STATE_VERSION);
        assert_eq!(state.central_path, "proj/");
        assert!(state.files.is_empty());
        assert!(state.last_sync.is_none());
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync-state.json");
        let mut state = SyncState::new("proj/");
        state.record_transfer("MEMORY.md", "abc123", "2024-01-15T10:30:00Z");
        state.last_sync = Some("2024-01-15T10:30:00Z".to_string());
        state.save(&path).unwrap();

        let loaded = SyncState::load(&path, "proj/").unwrap();
        assert_eq!(loaded.files["MEMORY.md"].local_hash, "abc123");
        assert_eq!(loaded.files["MEMORY.md"].remote_hash, "abc123");
        assert_eq!(loaded.last_sync.as_deref(), Some("2024-01-15T10:30:00Z"));
    }

    #[test]
    fn v1_manifest_migrates_dropping_last_synced_hash() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync-state.json");
        std::fs::write(
            &path,
            r#"{
              "version": 1,
              "centralPath": "proj/",
              "lastSync": "2023-11-02T08:00:00Z",
              "files": {
                "MEMORY.md": {
                  "localHash": "aaa",
                  "remoteHash": "aaa",
                  "lastSyncedHash": "stale-three-way-field",
                  "lastModified": "2023-11-02T08:00:00Z"
                }
              }
            }"#,
        )
        .unwrap();

        let state = SyncState::load(&path, "proj/").unwrap();
        assert_eq!(state.version, SYNC_STATE_VERSION);
        assert_eq!(state.files["MEMORY.md"].local_hash, "aaa");

        state.save(&path).unwrap();
        let rewritten = std::fs::read_to_string(&path).unwrap();
        assert!(!rewritten.contains("lastSyncedHash"));
        assert!(rewritten.contains("\"version\": 2"));
    }

    #[test]
    fn malformed_manifest_is_a_validation_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync-state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = SyncState::load(&path, "proj/").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
