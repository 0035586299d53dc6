//! The Index Registry: the exclusive in-memory owner of every ANN index
//! handle. Lazily loads per-diary indices and the global tag index from
//! disk, silently rebuilding from the Store on a missing or corrupt file,
//! and debounces saves so a hot diary isn't fsynced on every single
//! update.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use sha2::Digest;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::RwLock;

use crate::ann::AnnIndex;
use crate::ann::FlatIndex;
use crate::ann::ScoredId;
use crate::error::Result;
use crate::store::SqliteStore;

struct DiaryEntry {
    index: RwLock<FlatIndex>,
    loaded: AtomicBool,
    dirty: AtomicBool,
}

/// In-memory handle registry. Per the engine's ownership rule, the Store
/// never touches these handles and the registry never touches SQLite
/// directly except to rebuild an index from scratch.
pub struct IndexRegistry {
    data_dir: PathBuf,
    dim: usize,
    diaries: RwLock<HashMap<String, Arc<DiaryEntry>>>,
    global_tags: Arc<DiaryEntry>,
    save_lock: AsyncMutex<()>,
}

impl IndexRegistry {
    pub fn new(data_dir: PathBuf, dim: usize) -> Self {
        Self {
            data_dir,
            dim,
            diaries: RwLock::new(HashMap::new()),
            global_tags: Arc::new(DiaryEntry {
                index: RwLock::new(FlatIndex::create(dim)),
                loaded: AtomicBool::new(false),
                dirty: AtomicBool::new(false),
            }),
            save_lock: AsyncMutex::new(()),
        }
    }

    fn diary_index_path(&self, diary: &str) -> PathBuf {
        let digest = sha2::Sha256::digest(diary.as_bytes());
        let hash = hex::encode(&digest[..16]);
        self.data_dir.join(format!("index_diary_{hash}.ann"))
    }

    fn global_tags_path(&self) -> PathBuf {
        self.data_dir.join("index_global_tags.ann")
    }

    /// Get (lazily loading or rebuilding) the ANN index for `diary`.
    pub async fn get_or_load_diary(&self, diary: &str, store: &SqliteStore) -> Arc<DiaryEntry> {
        if let Some(entry) = self.diaries.read().await.get(diary) {
            if entry.loaded.load(Ordering::Acquire) {
                return entry.clone();
            }
        }

        let entry = {
            let mut diaries = self.diaries.write().await;
            diaries
                .entry(diary.to_string())
                .or_insert_with(|| {
                    Arc::new(DiaryEntry {
                        index: RwLock::new(FlatIndex::create(self.dim)),
                        loaded: AtomicBool::new(false),
                        dirty: AtomicBool::new(false),
                    })
                })
                .clone()
        };

        if entry.loaded.load(Ordering::Acquire) {
            return entry;
        }

        let path = self.diary_index_path(diary);
        match load_index_file(&path, self.dim) {
            Ok(Some(loaded)) => {
                *entry.index.write().await = loaded;
                entry.loaded.store(true, Ordering::Release);
            }
            Ok(None) => {
                tracing::info!(diary, "no persisted index, starting empty and recovering from store");
                self.recover_diary_from_store(&entry, diary, store).await;
                entry.loaded.store(true, Ordering::Release);
            }
            Err(e) => {
                tracing::warn!(diary, error = %e, "index file corrupt, rebuilding from store");
                self.recover_diary_from_store(&entry, diary, store).await;
                entry.loaded.store(true, Ordering::Release);
            }
        }

        entry
    }

    async fn recover_diary_from_store(&self, entry: &Arc<DiaryEntry>, diary: &str, store: &SqliteStore) {
        let mut index = FlatIndex::create(self.dim);
        if let Ok(candidates) = store.iter_candidate_chunks(Some(diary.to_string())).await {
            for (chunk, _diary, _path) in candidates {
                if let Some(vector) = chunk.vector {
                    let _ = index.add(chunk.id, &vector);
                }
            }
        }
        *entry.index.write().await = index;
    }

    pub async fn get_or_load_global_tags(&self, store: &SqliteStore) -> Arc<DiaryEntry> {
        if self.global_tags.loaded.load(Ordering::Acquire) {
            return self.global_tags.clone();
        }
        let path = self.global_tags_path();
        match load_index_file(&path, self.dim) {
            Ok(Some(loaded)) => {
                *self.global_tags.index.write().await = loaded;
            }
            Ok(None) => {
                tracing::info!("no persisted global tag index, recovering from store");
                self.recover_global_tags_from_store(store).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "global tag index corrupt, rebuilding from store");
                self.recover_global_tags_from_store(store).await;
            }
        }
        self.global_tags.loaded.store(true, Ordering::Release);
        self.global_tags.clone()
    }

    async fn recover_global_tags_from_store(&self, store: &SqliteStore) {
        let mut index = FlatIndex::create(self.dim);
        if let Ok(tags) = store.iter_tags().await {
            for tag in tags {
                if let Ok(Some(vector)) = store.get_tag_vector(tag.id).await {
                    let _ = index.add(tag.id, &vector);
                }
            }
        }
        *self.global_tags.index.write().await = index;
    }

    /// Apply a batch of upserts to a diary's index. Called strictly after
    /// the owning Store transaction has committed.
    pub async fn apply_updates(&self, diary: &str, store: &SqliteStore, updates: &[(i64, Vec<f32>)], removed: &[i64]) -> Result<()> {
        let entry = self.get_or_load_diary(diary, store).await;
        {
            let mut index = entry.index.write().await;
            for (id, vector) in updates {
                index.add(*id, vector)?;
            }
            for id in removed {
                index.remove(*id);
            }
        }
        entry.dirty.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn apply_global_tag_update(&self, store: &SqliteStore, tag_id: i64, vector: Vec<f32>) -> Result<()> {
        let entry = self.get_or_load_global_tags(store).await;
        entry.index.write().await.add(tag_id, &vector)?;
        entry.dirty.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn search_diary(&self, diary: &str, store: &SqliteStore, query: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        let entry = self.get_or_load_diary(diary, store).await;
        let index = entry.index.read().await;
        index.search(query, k)
    }

    pub async fn list_loaded_diaries(&self) -> Vec<String> {
        self.diaries.read().await.keys().cloned().collect()
    }

    pub async fn search_global_tags(&self, store: &SqliteStore, query: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        let entry = self.get_or_load_global_tags(store).await;
        let index = entry.index.read().await;
        index.search(query, k)
    }

    /// Fetch the stored vector for a chunk id in a diary's index, if any.
    pub async fn get_diary_vector(&self, diary: &str, store: &SqliteStore, id: i64) -> Option<Vec<f32>> {
        let entry = self.get_or_load_diary(diary, store).await;
        let index = entry.index.read().await;
        index.get_vector(id).map(|v| v.to_vec())
    }

    /// Persist a single diary's index if dirty. Debouncing the call site
    /// (coalescing repeated schedule requests within ~60s) is the
    /// ingestion pipeline's responsibility; this performs the atomic
    /// write itself.
    pub async fn flush_diary(&self, diary: &str) -> Result<()> {
        let entry = {
            let diaries = self.diaries.read().await;
            diaries.get(diary).cloned()
        };
        let Some(entry) = entry else { return Ok(()) };
        if !entry.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let _guard = self.save_lock.lock().await;
        let path = self.diary_index_path(diary);
        let index = entry.index.read().await;
        index.save(&path)
    }

    pub async fn flush_global_tags(&self) -> Result<()> {
        if !self.global_tags.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let _guard = self.save_lock.lock().await;
        let path = self.global_tags_path();
        let index = self.global_tags.index.read().await;
        index.save(&path)
    }

    /// Flush every loaded diary plus the global tag index. Called on
    /// `KnowledgeBase::shutdown`.
    pub async fn save_all(&self) -> Result<()> {
        let names = self.list_loaded_diaries().await;
        for name in names {
            self.flush_diary(&name).await?;
        }
        self.flush_global_tags().await
    }
}

fn load_index_file(path: &Path, dim: usize) -> Result<Option<FlatIndex>> {
    if !path.exists() {
        return Ok(None);
    }
    let index = FlatIndex::load(path)?;
    if index.stats().dim != dim {
        return Err(crate::error::KbeError::DimensionMismatch {
            expected: dim,
            actual: index.stats().dim,
        });
    }
    Ok(Some(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn new_store(dir: &Path) -> SqliteStore {
        SqliteStore::open(&dir.join("kb.sqlite")).unwrap()
    }

    #[tokio::test]
    async fn missing_index_file_yields_empty_loaded_index() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path()).await;
        let registry = IndexRegistry::new(dir.path().to_path_buf(), 4);

        let results = registry.search_diary("diaryA", &store, &[1.0, 0.0, 0.0, 0.0], 5).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn apply_updates_then_search_finds_vector() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path()).await;
        let registry = IndexRegistry::new(dir.path().to_path_buf(), 2);

        registry
            .apply_updates("diaryA", &store, &[(1, vec![1.0, 0.0])], &[])
            .await
            .unwrap();

        let results = registry.search_diary("diaryA", &store, &[1.0, 0.0], 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 1);
    }

    #[tokio::test]
    async fn flush_then_reload_in_new_registry_round_trips() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path()).await;
        {
            let registry = IndexRegistry::new(dir.path().to_path_buf(), 2);
            registry
                .apply_updates("diaryA", &store, &[(1, vec![1.0, 0.0])], &[])
                .await
                .unwrap();
            registry.save_all().await.unwrap();
        }

        let registry2 = IndexRegistry::new(dir.path().to_path_buf(), 2);
        let results = registry2.search_diary("diaryA", &store, &[1.0, 0.0], 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 1);
    }
}
