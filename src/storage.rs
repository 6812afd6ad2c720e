//! Durable key-value persistence for script records and cached libraries.
//!
//! The store treats persistence as two keyed collections with load/save
//! operations. [`JsonFileStore`] is the production backend; [`MemoryStore`]
//! keeps everything in process and is used by tests.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{LibraryRecord, ScriptId, ScriptRecord};

/// Storage backend errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Corrupt data in {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to serialize records: {0}")]
    Serialize(serde_json::Error),

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Key-value record store backing the script manager
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load_scripts(&self) -> Result<Vec<ScriptRecord>, StorageError>;

    /// Insert or replace the given records in one durable write
    async fn save_scripts(&self, records: &[ScriptRecord]) -> Result<(), StorageError>;

    async fn remove_script(&self, id: &ScriptId) -> Result<(), StorageError>;

    async fn load_libraries(&self) -> Result<Vec<LibraryRecord>, StorageError>;

    async fn save_library(&self, library: &LibraryRecord) -> Result<(), StorageError>;
}

/// Records kept as pretty-printed JSON objects keyed by id (scripts) and by
/// URL (libraries). Each write replaces the file through a temporary sibling
/// and a rename.
pub struct JsonFileStore {
    scripts_file: PathBuf,
    dependencies_file: PathBuf,
    scripts: tokio::sync::Mutex<Option<BTreeMap<ScriptId, ScriptRecord>>>,
    libraries: tokio::sync::Mutex<Option<BTreeMap<String, LibraryRecord>>>,
}

impl JsonFileStore {
    pub fn new(scripts_file: PathBuf, dependencies_file: PathBuf) -> Self {
        Self {
            scripts_file,
            dependencies_file,
            scripts: tokio::sync::Mutex::new(None),
            libraries: tokio::sync::Mutex::new(None),
        }
    }

    /// Store using the standard file names under `data_dir`
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(
            data_dir.join("scripts.json"),
            data_dir.join("dependencies.json"),
        )
    }
}

async fn read_map<T: DeserializeOwned>(path: &Path) -> Result<BTreeMap<String, T>, StorageError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
        Ok(content) => serde_json::from_str(&content).map_err(|source| StorageError::Corrupt {
            path: path.to_path_buf(),
            source,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} does not exist yet, starting empty", path.display());
            Ok(BTreeMap::new())
        }
        Err(source) => Err(StorageError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn write_map<K: Serialize + Ord, T: Serialize>(
    path: &Path,
    map: &BTreeMap<K, T>,
) -> Result<(), StorageError> {
    let content = serde_json::to_string_pretty(map).map_err(StorageError::Serialize)?;
    let write_err = |source| StorageError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await.map_err(write_err)?;
    if let Err(source) = tokio::fs::rename(&tmp, path).await {
        warn!("Failed to move {} into place: {}", tmp.display(), source);
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(write_err(source));
    }
    Ok(())
}

impl JsonFileStore {
    async fn scripts_cache<'a>(
        &self,
        guard: &'a mut Option<BTreeMap<ScriptId, ScriptRecord>>,
    ) -> Result<&'a mut BTreeMap<ScriptId, ScriptRecord>, StorageError> {
        if guard.is_none() {
            let loaded: BTreeMap<String, ScriptRecord> = read_map(&self.scripts_file).await?;
            *guard = Some(
                loaded
                    .into_values()
                    .map(|record| (record.id.clone(), record))
                    .collect(),
            );
        }
        Ok(guard.get_or_insert_with(BTreeMap::new))
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn load_scripts(&self) -> Result<Vec<ScriptRecord>, StorageError> {
        let mut guard = self.scripts.lock().await;
        let cache = self.scripts_cache(&mut guard).await?;
        Ok(cache.values().cloned().collect())
    }

    async fn save_scripts(&self, records: &[ScriptRecord]) -> Result<(), StorageError> {
        let mut guard = self.scripts.lock().await;
        let cache = self.scripts_cache(&mut guard).await?;

        let mut next = cache.clone();
        for record in records {
            next.insert(record.id.clone(), record.clone());
        }
        write_map(&self.scripts_file, &next).await?;
        *cache = next;
        Ok(())
    }

    async fn remove_script(&self, id: &ScriptId) -> Result<(), StorageError> {
        let mut guard = self.scripts.lock().await;
        let cache = self.scripts_cache(&mut guard).await?;

        let mut next = cache.clone();
        if next.remove(id).is_none() {
            return Ok(());
        }
        write_map(&self.scripts_file, &next).await?;
        *cache = next;
        Ok(())
    }

    async fn load_libraries(&self) -> Result<Vec<LibraryRecord>, StorageError> {
        let mut guard = self.libraries.lock().await;
        if guard.is_none() {
            *guard = Some(read_map(&self.dependencies_file).await?);
        }
        Ok(guard
            .as_ref()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_library(&self, library: &LibraryRecord) -> Result<(), StorageError> {
        let mut guard = self.libraries.lock().await;
        let mut next = match guard.as_ref() {
            Some(map) => map.clone(),
            None => read_map(&self.dependencies_file).await?,
        };
        next.insert(library.url.clone(), library.clone());
        write_map(&self.dependencies_file, &next).await?;
        *guard = Some(next);
        Ok(())
    }
}

/// In-process store. `fail_writes` makes every save fail, for exercising
/// the "commit before returning" paths.
#[derive(Default)]
pub struct MemoryStore {
    scripts: Mutex<BTreeMap<ScriptId, ScriptRecord>>,
    libraries: Mutex<BTreeMap<String, LibraryRecord>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scripts(records: impl IntoIterator<Item = ScriptRecord>) -> Self {
        let store = Self::default();
        if let Ok(mut scripts) = store.scripts.lock() {
            scripts.extend(records.into_iter().map(|r| (r.id.clone(), r)));
        }
        store
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StorageError::Write {
                path: PathBuf::from("memory"),
                source: std::io::Error::other("writes disabled"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load_scripts(&self) -> Result<Vec<ScriptRecord>, StorageError> {
        let scripts = self.scripts.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(scripts.values().cloned().collect())
    }

    async fn save_scripts(&self, records: &[ScriptRecord]) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut scripts = self.scripts.lock().map_err(|_| StorageError::LockPoisoned)?;
        for record in records {
            scripts.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn remove_script(&self, id: &ScriptId) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut scripts = self.scripts.lock().map_err(|_| StorageError::LockPoisoned)?;
        scripts.remove(id);
        Ok(())
    }

    async fn load_libraries(&self) -> Result<Vec<LibraryRecord>, StorageError> {
        let libraries = self
            .libraries
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(libraries.values().cloned().collect())
    }

    async fn save_library(&self, library: &LibraryRecord) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut libraries = self
            .libraries
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        libraries.insert(library.url.clone(), library.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ScriptMetadata;
    use chrono::Utc;

    fn record(order: i64) -> ScriptRecord {
        ScriptRecord::local(
            Some(format!("s{order}")),
            "1;".into(),
            &ScriptMetadata::default(),
            order,
        )
    }

    #[tokio::test]
    async fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path());

        assert!(store.load_scripts().await.unwrap().is_empty());

        let a = record(0);
        let b = ScriptRecord::remote(
            "https://x/b.user.js",
            "2;".into(),
            &ScriptMetadata::default(),
            Utc::now(),
            1,
        );
        store.save_scripts(&[a.clone(), b.clone()]).await.unwrap();

        let reopened = JsonFileStore::in_dir(dir.path());
        let mut loaded = reopened.load_scripts().await.unwrap();
        loaded.sort_by(|x, y| x.position_cmp(y));
        assert_eq!(loaded, vec![a.clone(), b.clone()]);

        reopened.remove_script(&a.id).await.unwrap();
        let again = JsonFileStore::in_dir(dir.path());
        assert_eq!(again.load_scripts().await.unwrap(), vec![b]);
    }

    #[tokio::test]
    async fn test_json_store_is_keyed_by_id_and_omits_absent_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path());
        let a = record(0);
        store.save_scripts(std::slice::from_ref(&a)).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("scripts.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let entry = &json[a.id.as_str()];
        assert_eq!(entry["name"], "s0");
        assert!(entry.get("origin").is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("scripts.json"), "{ not json").unwrap();
        let store = JsonFileStore::in_dir(dir.path());
        assert!(matches!(
            store.load_scripts().await,
            Err(StorageError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_libraries_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path());
        let lib = LibraryRecord {
            url: "https://cdn/lib.js".into(),
            code: "var lib = 1;".into(),
            last_updated: Utc::now(),
        };
        store.save_library(&lib).await.unwrap();

        let reopened = JsonFileStore::in_dir(dir.path());
        assert_eq!(reopened.load_libraries().await.unwrap(), vec![lib]);
    }

    #[tokio::test]
    async fn test_memory_store_failing_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.save_scripts(&[record(0)]).await.is_err());
        assert!(store.load_scripts().await.unwrap().is_empty());
    }
}
