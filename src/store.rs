//! Script Store
//!
//! Owns the in-memory collection of [`ScriptRecord`]s and mirrors every
//! mutation to a [`RecordStore`] backend before it becomes visible.
//! Mutations on the same id are serialized through a per-id async lock;
//! mutations on disjoint ids run concurrently. Record creation is serialized
//! separately so `order = max + 1` is computed against a stable maximum.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::metadata::parse_metadata;
use crate::model::{LibraryRecord, ScriptId, ScriptRecord};
use crate::storage::{RecordStore, StorageError};

/// Held id lock of one record, see [`ScriptStore::lock_record`].
pub struct RecordGuard {
    id: ScriptId,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl RecordGuard {
    pub fn id(&self) -> &ScriptId {
        &self.id
    }
}

pub struct ScriptStore {
    backend: Arc<dyn RecordStore>,
    records: RwLock<HashMap<ScriptId, ScriptRecord>>,
    libraries: RwLock<HashMap<String, LibraryRecord>>,
    locks: Mutex<HashMap<ScriptId, Arc<tokio::sync::Mutex<()>>>>,
    create_lock: tokio::sync::Mutex<()>,
}

impl ScriptStore {
    /// Load every record from `backend`.
    pub async fn open(backend: Arc<dyn RecordStore>) -> AppResult<Self> {
        let records = backend.load_scripts().await?;
        let libraries = backend.load_libraries().await?;
        info!(
            "Loaded {} scripts and {} cached libraries",
            records.len(),
            libraries.len()
        );

        let records = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        let libraries = libraries.into_iter().map(|l| (l.url.clone(), l)).collect();
        Ok(Self {
            backend,
            records: RwLock::new(records),
            libraries: RwLock::new(libraries),
            locks: Mutex::new(HashMap::new()),
            create_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn read_records(
        &self,
    ) -> AppResult<std::sync::RwLockReadGuard<'_, HashMap<ScriptId, ScriptRecord>>> {
        self.records
            .read()
            .map_err(|_| AppError::Storage(StorageError::LockPoisoned))
    }

    fn commit(&self, record: ScriptRecord) -> AppResult<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| AppError::Storage(StorageError::LockPoisoned))?;
        records.insert(record.id.clone(), record);
        Ok(())
    }

    fn id_lock(&self, id: &ScriptId) -> AppResult<Arc<tokio::sync::Mutex<()>>> {
        if !self.read_records()?.contains_key(id) {
            return Err(AppError::not_found(id));
        }
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| AppError::internal("script lock table poisoned"))?;
        Ok(locks.entry(id.clone()).or_default().clone())
    }

    fn drop_id_lock(&self, id: &ScriptId) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(id);
        }
    }

    /// Take the id lock of an existing record. Every mutation of that record
    /// waits until the returned guard is dropped.
    pub async fn lock_record(&self, id: &ScriptId) -> AppResult<RecordGuard> {
        let lock = self.id_lock(id)?;
        let guard = lock.lock_owned().await;

        // Deleted while we were waiting.
        if !self.read_records()?.contains_key(id) {
            self.drop_id_lock(id);
            return Err(AppError::not_found(id));
        }

        Ok(RecordGuard {
            id: id.clone(),
            _guard: guard,
        })
    }

    /// Snapshot of all records sorted by `order`, ties by id.
    pub fn list(&self) -> AppResult<Vec<ScriptRecord>> {
        let mut records: Vec<ScriptRecord> = self.read_records()?.values().cloned().collect();
        records.sort_by(|a, b| a.position_cmp(b));
        Ok(records)
    }

    pub fn get(&self, id: &ScriptId) -> AppResult<ScriptRecord> {
        self.read_records()?
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::not_found(id))
    }

    pub fn find_by_url(&self, url: &str) -> AppResult<Option<ScriptId>> {
        Ok(self
            .read_records()?
            .values()
            .find(|record| record.url() == Some(url))
            .map(|record| record.id.clone()))
    }

    fn next_order(&self) -> AppResult<i64> {
        Ok(self
            .read_records()?
            .values()
            .map(|record| record.order)
            .max()
            .map_or(0, |max| max + 1))
    }

    /// Create a local record at the end of the order.
    pub async fn add_local(&self, name: Option<String>, code: String) -> AppResult<ScriptRecord> {
        let _create = self.create_lock.lock().await;
        let metadata = parse_metadata(&code);
        let record = ScriptRecord::local(name, code, &metadata, self.next_order()?);

        self.backend
            .save_scripts(std::slice::from_ref(&record))
            .await?;
        self.commit(record.clone())?;

        info!(script_id = %record.id, name = %record.name, "Added local script");
        Ok(record)
    }

    /// Create a remote record. `build` receives the order to assign. Fails
    /// with `DuplicateUrl` if another record already owns `url`.
    pub async fn insert_remote<F>(&self, url: &str, build: F) -> AppResult<ScriptRecord>
    where
        F: FnOnce(i64) -> ScriptRecord,
    {
        let _create = self.create_lock.lock().await;
        if let Some(existing) = self.find_by_url(url)? {
            return Err(AppError::DuplicateUrl {
                url: url.to_string(),
                existing,
            });
        }

        let record = build(self.next_order()?);
        self.backend
            .save_scripts(std::slice::from_ref(&record))
            .await?;
        self.commit(record.clone())?;

        info!(script_id = %record.id, url = %url, name = %record.name, "Added remote script");
        Ok(record)
    }

    /// Apply `update` to the record under its id lock and persist the
    /// result. `id` and `order` are preserved whatever `update` does.
    pub async fn update_with<F>(&self, id: &ScriptId, update: F) -> AppResult<ScriptRecord>
    where
        F: FnOnce(&mut ScriptRecord),
    {
        let guard = self.lock_record(id).await?;
        self.update_locked(&guard, update).await
    }

    /// Same as [`update_with`](Self::update_with) for a caller that already
    /// holds the record's lock.
    pub async fn update_locked<F>(
        &self,
        guard: &RecordGuard,
        update: F,
    ) -> AppResult<ScriptRecord>
    where
        F: FnOnce(&mut ScriptRecord),
    {
        let current = self.get(&guard.id)?;
        let mut next = current.clone();
        update(&mut next);
        next.id = current.id.clone();
        next.order = current.order;

        if next == current {
            return Ok(next);
        }

        self.backend
            .save_scripts(std::slice::from_ref(&next))
            .await?;
        self.commit(next.clone())?;
        Ok(next)
    }

    pub async fn toggle(&self, id: &ScriptId, enabled: bool) -> AppResult<ScriptRecord> {
        let record = self
            .update_with(id, |record| record.enabled = enabled)
            .await?;
        debug!(script_id = %id, enabled, "Toggled script");
        Ok(record)
    }

    pub async fn delete(&self, id: &ScriptId) -> AppResult<()> {
        let _guard = self.lock_record(id).await?;

        self.backend.remove_script(id).await?;
        {
            let mut records = self
                .records
                .write()
                .map_err(|_| AppError::Storage(StorageError::LockPoisoned))?;
            records.remove(id);
        }
        self.drop_id_lock(id);

        info!(script_id = %id, "Deleted script");
        Ok(())
    }

    /// Rewrite the `order` of a single record. Other records are untouched.
    pub async fn reorder(&self, id: &ScriptId, new_order: i64) -> AppResult<ScriptRecord> {
        let _guard = self.lock_record(id).await?;

        let mut record = self.get(id)?;
        if record.order == new_order {
            return Ok(record);
        }
        record.order = new_order;

        self.backend
            .save_scripts(std::slice::from_ref(&record))
            .await?;
        self.commit(record.clone())?;

        debug!(script_id = %id, order = new_order, "Reordered script");
        Ok(record)
    }

    /// Exchange the `order` values of two records in one durable write.
    pub async fn swap_order(&self, first: &ScriptId, second: &ScriptId) -> AppResult<()> {
        if first == second {
            self.get(first)?;
            return Ok(());
        }

        // Lock in id order so concurrent swaps of the same pair cannot deadlock.
        let (low, high) = if first < second {
            (first, second)
        } else {
            (second, first)
        };
        let _low = self.lock_record(low).await?;
        let _high = self.lock_record(high).await?;

        let mut a = self.get(first)?;
        let mut b = self.get(second)?;
        let (a_order, b_order) = (a.order, b.order);
        a.order = b_order;
        b.order = a_order;

        self.backend.save_scripts(&[a.clone(), b.clone()]).await?;
        self.commit(a)?;
        self.commit(b)?;

        debug!(first = %first, second = %second, "Swapped script order");
        Ok(())
    }

    pub fn libraries(&self) -> AppResult<HashMap<String, LibraryRecord>> {
        self.libraries
            .read()
            .map(|libraries| libraries.clone())
            .map_err(|_| AppError::Storage(StorageError::LockPoisoned))
    }

    pub fn library_urls(&self) -> AppResult<HashSet<String>> {
        Ok(self.libraries()?.into_keys().collect())
    }

    pub async fn save_libraries(&self, fetched: &[LibraryRecord]) -> AppResult<()> {
        for library in fetched {
            self.backend.save_library(library).await?;
            let mut libraries = self
                .libraries
                .write()
                .map_err(|_| AppError::Storage(StorageError::LockPoisoned))?;
            libraries.insert(library.url.clone(), library.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    async fn store() -> (Arc<MemoryStore>, ScriptStore) {
        let backend = Arc::new(MemoryStore::new());
        let store = ScriptStore::open(backend.clone()).await.unwrap();
        (backend, store)
    }

    #[tokio::test]
    async fn test_add_local_appends_after_max_order() {
        let (_, store) = store().await;
        let a = store
            .add_local(None, "// @name A\n1;".into())
            .await
            .unwrap();
        assert_eq!(a.order, 0);
        assert_eq!(a.name, "A");

        store.reorder(&a.id, 7).await.unwrap();
        let b = store
            .add_local(Some("B".into()), "2;".into())
            .await
            .unwrap();
        assert_eq!(b.order, 8);
        assert!(b.enabled);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_unchanged() {
        let (backend, store) = store().await;
        let a = store.add_local(None, "1;".into()).await.unwrap();

        backend.set_fail_writes(true);
        assert!(matches!(
            store.toggle(&a.id, false).await,
            Err(AppError::Storage(_))
        ));
        assert!(store.get(&a.id).unwrap().enabled);
        assert!(store.add_local(None, "2;".into()).await.is_err());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_with_preserves_identity() {
        let (_, store) = store().await;
        let a = store.add_local(None, "1;".into()).await.unwrap();
        let updated = store
            .update_with(&a.id, |record| {
                record.id = ScriptId::from("hijack");
                record.order = 99;
                record.code = "2;".into();
            })
            .await
            .unwrap();
        assert_eq!(updated.id, a.id);
        assert_eq!(updated.order, a.order);
        assert_eq!(store.get(&a.id).unwrap().code, "2;");
    }

    #[tokio::test]
    async fn test_swap_with_self_is_noop() {
        let (_, store) = store().await;
        let a = store.add_local(None, "1;".into()).await.unwrap();
        store.swap_order(&a.id, &a.id).await.unwrap();
        assert_eq!(store.get(&a.id).unwrap().order, a.order);

        let missing = ScriptId::from("missing");
        assert!(matches!(
            store.swap_order(&a.id, &missing).await,
            Err(AppError::NotFound { .. })
        ));
        assert_eq!(store.get(&a.id).unwrap().order, a.order);
    }

    #[tokio::test]
    async fn test_missing_id_leaves_no_lock_entry() {
        let (_, store) = store().await;
        let a = store.add_local(None, "1;".into()).await.unwrap();
        let missing = ScriptId::from("missing");

        assert!(store.update_with(&missing, |_| {}).await.is_err());
        assert!(store.toggle(&missing, false).await.is_err());
        assert!(store.reorder(&missing, 3).await.is_err());
        assert!(store.delete(&missing).await.is_err());
        assert!(store.swap_order(&a.id, &missing).await.is_err());
        assert!(!store.locks.lock().unwrap().contains_key(&missing));

        store.delete(&a.id).await.unwrap();
        assert!(store.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_record_blocks_updates_until_dropped() {
        let (_, store) = store().await;
        let a = store.add_local(None, "1;".into()).await.unwrap();

        let guard = store.lock_record(&a.id).await.unwrap();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            store.toggle(&a.id, false),
        )
        .await;
        assert!(blocked.is_err());

        store
            .update_locked(&guard, |record| record.code = "2;".into())
            .await
            .unwrap();
        drop(guard);

        let record = store.toggle(&a.id, false).await.unwrap();
        assert_eq!(record.code, "2;");
        assert!(!record.enabled);
    }

    #[tokio::test]
    async fn test_insert_remote_rejects_duplicate_url() {
        let (_, store) = store().await;
        let url = "https://x/y.user.js";
        let meta = crate::metadata::ScriptMetadata::default();
        let first = store
            .insert_remote(url, |order| {
                ScriptRecord::remote(url, "1;".into(), &meta, chrono::Utc::now(), order)
            })
            .await
            .unwrap();

        let err = store
            .insert_remote(url, |order| {
                ScriptRecord::remote(url, "2;".into(), &meta, chrono::Utc::now(), order)
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::DuplicateUrl { existing, .. } if existing == first.id
        ));
    }
}
