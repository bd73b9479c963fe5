//! Persistence store implementations.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::traits::StatusStore;
use crate::types::StoredUpdate;

/// Everything the store keeps, as one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub updates: BTreeMap<String, StoredUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot_pending: Option<String>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// JSON file backed store.
///
/// Changes apply to memory at once and reach the file from a blocking task,
/// so callers holding the controller lock never wait on storage. The whole
/// document is rewritten through a temporary file and a rename, so a crash
/// leaves either an older or the newer state. Outside a tokio runtime the
/// write happens inline.
pub struct JsonFileStore {
    inner: Arc<FileState>,
}

struct FileState {
    path: PathBuf,
    doc: Mutex<Versioned>,
    /// Version on disk. Held for the whole write so writers never interleave.
    written: Mutex<u64>,
}

struct Versioned {
    doc: StoreDocument,
    version: u64,
}

impl JsonFileStore {
    /// Open the store at `path`, starting empty when the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let doc = if path.exists() {
            let content = fs::read_to_string(&path)?;
            let doc: StoreDocument = serde_json::from_str(&content)?;
            info!(
                path = %path.display(),
                updates = doc.updates.len(),
                "Loaded updater state"
            );
            doc
        } else {
            debug!(path = %path.display(), "No updater state yet");
            StoreDocument::default()
        };

        Ok(Self {
            inner: Arc::new(FileState {
                path,
                doc: Mutex::new(Versioned { doc, version: 0 }),
                written: Mutex::new(0),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn modify<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StoreDocument),
    {
        {
            let mut state = lock(&self.inner.doc);
            f(&mut state.doc);
            state.version += 1;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = Arc::clone(&self.inner);
                runtime.spawn_blocking(move || {
                    if let Err(e) = inner.write() {
                        warn!(path = %inner.path.display(), error = %e, "Failed to write updater state");
                    }
                });
                Ok(())
            }
            Err(_) => self.inner.write(),
        }
    }
}

impl FileState {
    /// Write the newest document unless it is already on disk.
    fn write(&self) -> Result<(), StoreError> {
        let mut written = lock(&self.written);
        let (doc, version) = {
            let state = lock(&self.doc);
            if state.version == *written {
                return Ok(());
            }
            (state.doc.clone(), state.version)
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(&doc)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        *written = version;
        Ok(())
    }
}

impl StatusStore for JsonFileStore {
    fn load_updates(&self) -> Result<Vec<StoredUpdate>, StoreError> {
        Ok(lock(&self.inner.doc).doc.updates.values().cloned().collect())
    }

    fn save_update(&self, update: &StoredUpdate) -> Result<(), StoreError> {
        self.modify(|doc| {
            doc.updates
                .insert(update.download_id.clone(), update.clone());
        })
    }

    fn remove_update(&self, download_id: &str) -> Result<(), StoreError> {
        if !lock(&self.inner.doc).doc.updates.contains_key(download_id) {
            return Ok(());
        }
        self.modify(|doc| {
            doc.updates.remove(download_id);
        })
    }

    fn last_check(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(lock(&self.inner.doc).doc.last_check)
    }

    fn set_last_check(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.modify(|doc| doc.last_check = Some(at))
    }

    fn reboot_pending(&self) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.inner.doc).doc.reboot_pending.clone())
    }

    fn set_reboot_pending(&self, download_id: Option<&str>) -> Result<(), StoreError> {
        self.modify(|doc| doc.reboot_pending = download_id.map(str::to_string))
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.inner.write()
    }
}

/// In-process store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    doc: Mutex<StoreDocument>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a prepared document, as if it had been loaded from disk.
    pub fn with_document(doc: StoreDocument) -> Self {
        Self {
            doc: Mutex::new(doc),
        }
    }

    pub fn document(&self) -> StoreDocument {
        lock(&self.doc).clone()
    }
}

impl StatusStore for MemoryStore {
    fn load_updates(&self) -> Result<Vec<StoredUpdate>, StoreError> {
        Ok(lock(&self.doc).updates.values().cloned().collect())
    }

    fn save_update(&self, update: &StoredUpdate) -> Result<(), StoreError> {
        lock(&self.doc)
            .updates
            .insert(update.download_id.clone(), update.clone());
        Ok(())
    }

    fn remove_update(&self, download_id: &str) -> Result<(), StoreError> {
        lock(&self.doc).updates.remove(download_id);
        Ok(())
    }

    fn last_check(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(lock(&self.doc).last_check)
    }

    fn set_last_check(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        lock(&self.doc).last_check = Some(at);
        Ok(())
    }

    fn reboot_pending(&self) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.doc).reboot_pending.clone())
    }

    fn set_reboot_pending(&self, download_id: Option<&str>) -> Result<(), StoreError> {
        lock(&self.doc).reboot_pending = download_id.map(str::to_string);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::PersistentStatus;
    use crate::types::UpdateInfo;
    use tempfile::TempDir;

    fn stored(id: &str, status: PersistentStatus) -> StoredUpdate {
        let mut update = UpdateInfo::new(id, format!("{}.zip", id), "1.0", 100, 1000);
        update.persistent_status = status;
        StoredUpdate::from(&update)
    }

    #[test]
    fn test_json_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("updater.json");

        {
            let store = JsonFileStore::open(&path).unwrap();
            store
                .save_update(&stored("a", PersistentStatus::Incomplete))
                .unwrap();
            store
                .save_update(&stored("b", PersistentStatus::Verified))
                .unwrap();
            store.remove_update("a").unwrap();
            store.set_reboot_pending(Some("b")).unwrap();
            store.set_last_check(Utc::now()).unwrap();
        }

        let store = JsonFileStore::open(&path).unwrap();
        let updates = store.load_updates().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].download_id, "b");
        assert_eq!(updates[0].persistent_status, PersistentStatus::Verified);
        assert_eq!(store.reboot_pending().unwrap().as_deref(), Some("b"));
        assert!(store.last_check().unwrap().is_some());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_json_store_writes_behind_inside_runtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("updater.json");
        let store = Arc::new(JsonFileStore::open(&path).unwrap());

        for id in ["a", "b", "c"] {
            store
                .save_update(&stored(id, PersistentStatus::Verified))
                .unwrap();
        }
        store.remove_update("b").unwrap();
        store.set_reboot_pending(Some("c")).unwrap();

        let flusher = Arc::clone(&store);
        tokio::task::spawn_blocking(move || flusher.flush())
            .await
            .unwrap()
            .unwrap();

        let reopened = JsonFileStore::open(&path).unwrap();
        let mut ids: Vec<String> = reopened
            .load_updates()
            .unwrap()
            .into_iter()
            .map(|u| u.download_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(reopened.reboot_pending().unwrap().as_deref(), Some("c"));
    }

    #[test]
    fn test_json_store_rejects_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("updater.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            JsonFileStore::open(&path),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_memory_store_overwrites_by_id() {
        let store = MemoryStore::new();
        store
            .save_update(&stored("a", PersistentStatus::Incomplete))
            .unwrap();
        store
            .save_update(&stored("a", PersistentStatus::Verified))
            .unwrap();

        let updates = store.load_updates().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].persistent_status, PersistentStatus::Verified);

        store.set_reboot_pending(None).unwrap();
        assert!(store.reboot_pending().unwrap().is_none());
    }
}
