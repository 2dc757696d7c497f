use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::Builder;
use tracing::warn;

use crate::error::OprError;
use crate::sync_state::{SyncState, SyncStateStore};

#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, OprError> {
        let root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.data_local_dir().join("opr-place-sync")).ok()
            })
            .ok_or_else(|| OprError::Filesystem("unable to resolve data directory".to_string()))?;
        Ok(Self { root })
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn sync_state_path(&self, source_key: &str) -> Utf8PathBuf {
        self.root
            .join("sync-state")
            .join(format!("{}.json", file_stem(source_key)))
    }

    pub fn ledger_snapshot_path(&self) -> Utf8PathBuf {
        self.root.join("ledger.json")
    }

    pub fn merge_report_path(&self, stamp: &str) -> Utf8PathBuf {
        self.root
            .join("reports")
            .join(format!("merge-{}.json", file_stem(stamp)))
    }

    pub fn lock_path(&self) -> Utf8PathBuf {
        self.root.join("sync.lock")
    }

    pub fn ensure_root(&self) -> Result<(), OprError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| OprError::Filesystem(err.to_string()))
    }

    pub fn read_bytes(path: &Utf8Path) -> Result<Option<Vec<u8>>, OprError> {
        match fs::read(path.as_std_path()) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(OprError::Filesystem(format!("{path}: {err}"))),
        }
    }

    pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<Option<T>, OprError> {
        let Some(content) = Self::read_bytes(path)? else {
            return Ok(None);
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|err| OprError::Filesystem(format!("{path}: {err}")))
    }

    /// Writes through a temp file in the same directory, then renames it over
    /// `path`, so readers see either the old or the new content.
    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), OprError> {
        let parent = path
            .parent()
            .ok_or_else(|| OprError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| OprError::Filesystem(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix("opr-sync-file")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| OprError::Filesystem(err.to_string()))?;
        temp.write_all(content)
            .map_err(|err| OprError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| OprError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), OprError> {
        let content =
            serde_json::to_vec_pretty(value).map_err(|err| OprError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    /// Takes the single-cycle lock. Fails while another cycle holds it.
    pub fn acquire_lock(&self) -> Result<CycleLock, OprError> {
        self.ensure_root()?;
        let path = self.lock_path();
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_std_path())
            .map_err(|err| match err.kind() {
                ErrorKind::AlreadyExists => OprError::CycleInProgress(path.to_string()),
                _ => OprError::Filesystem(err.to_string()),
            })?;
        writeln!(file, "{}", std::process::id())
            .map_err(|err| OprError::Filesystem(err.to_string()))?;
        Ok(CycleLock { path })
    }
}

/// Removes the lock file when dropped.
#[derive(Debug)]
pub struct CycleLock {
    path: Utf8PathBuf,
}

impl Drop for CycleLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(self.path.as_std_path()) {
            warn!(path = %self.path, error = %err, "failed to release cycle lock");
        }
    }
}

fn file_stem(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// Durable sync state as one JSON file per source key.
#[derive(Debug, Clone)]
pub struct JsonSyncStateStore {
    store: Store,
}

impl JsonSyncStateStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl SyncStateStore for JsonSyncStateStore {
    fn get(&self, source_key: &str) -> Result<Option<SyncState>, OprError> {
        Store::read_json(&self.store.sync_state_path(source_key))
    }

    fn put(&self, source_key: &str, state: &SyncState) -> Result<(), OprError> {
        Store::write_json_atomic(&self.store.sync_state_path(source_key), state)
    }
}
