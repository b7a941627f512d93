//! Persisted run-state: "is tracking intended" and the configured interval.
//!
//! This record outlives the process. It is written by the tracking task on
//! every start and stop and read once by every cold entry point (service
//! respawn, device boot). It is deliberately separate from the in-memory
//! liveness flag, which only prevents double starts within one process.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::StoreResult;

/// Durable tracking intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub is_tracking_intended: bool,
    pub interval_ms: Option<i64>,
}

impl RunState {
    pub fn tracking(interval_ms: i64) -> Self {
        Self {
            is_tracking_intended: true,
            interval_ms: Some(interval_ms),
        }
    }

    /// Not tracking, remembering the last interval for the next start.
    pub fn stopped(interval_ms: Option<i64>) -> Self {
        Self {
            is_tracking_intended: false,
            interval_ms,
        }
    }
}

/// Durable key-value record of [`RunState`]. Writable only by the tracking
/// task and the close paths of the cold-entry reactors.
pub trait RunStateStore: Send + Sync {
    fn load(&self) -> StoreResult<RunState>;
    fn save(&self, state: &RunState) -> StoreResult<()>;

    /// Persist "not tracking" while keeping the last known interval.
    fn clear(&self) -> StoreResult<()> {
        let interval_ms = self.load().ok().and_then(|s| s.interval_ms);
        self.save(&RunState::stopped(interval_ms))
    }
}

/// [`RunStateStore`] backed by a small JSON document on disk.
///
/// Writes go to a sibling temp file which is then renamed over the target,
/// so a crash mid-write leaves either the old or the new record.
pub struct FileRunStateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRunStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "run_state".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl RunStateStore for FileRunStateStore {
    fn load(&self) -> StoreResult<RunState> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(RunState::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, state: &RunState) -> StoreResult<()> {
        let _guard = self.write_lock.lock()?;
        let bytes = serde_json::to_vec(state)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.temp_path();
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        debug!(
            "[RunState] Saved intended={} interval={:?}",
            state.is_tracking_intended, state.interval_ms
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreError;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_reads_as_not_intended() {
        let dir = TempDir::new().unwrap();
        let store = FileRunStateStore::new(dir.path().join("run_state.json"));
        assert_eq!(store.load().unwrap(), RunState::default());
    }

    #[test]
    fn test_state_survives_new_store_instance() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("run_state.json");

        FileRunStateStore::new(&path)
            .save(&RunState::tracking(5_000))
            .unwrap();

        let reopened = FileRunStateStore::new(&path);
        assert_eq!(reopened.load().unwrap(), RunState::tracking(5_000));
        assert!(!dir.path().join("nested").join("run_state.json.tmp").exists());
    }

    #[test]
    fn test_clear_keeps_interval() {
        let dir = TempDir::new().unwrap();
        let store = FileRunStateStore::new(dir.path().join("run_state.json"));
        store.save(&RunState::tracking(3_000)).unwrap();

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), RunState::stopped(Some(3_000)));
    }

    #[test]
    fn test_corrupt_file_is_encoding_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run_state.json");
        fs::write(&path, b"{not json").unwrap();

        let store = FileRunStateStore::new(&path);
        assert!(matches!(store.load(), Err(StoreError::Encoding(_))));

        // Clearing still succeeds and repairs the record
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), RunState::stopped(None));
    }

    #[test]
    fn test_json_layout() {
        let json = serde_json::to_string(&RunState::tracking(1_000)).unwrap();
        assert_eq!(json, r#"{"isTrackingIntended":true,"intervalMs":1000}"#);
    }
}
