//! Batch ingestion: walks or watches a directory tree, computes content
//! hashes, and drives the commit-then-index-mutate write path.
//!
//! State machine per path: unseen -> pending -> processing -> committed.
//! A read error drops that single path from the batch (logged, not
//! fatal). An embedder failure aborts the whole batch, rolls back, and
//! leaves every path in the batch back in `pending` so the next flush
//! retries them.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sha2::Digest;

use crate::chunking::TextChunker;
use crate::config::IngestionConfig;
use crate::embedder::EmbeddingProvider;
use crate::error::KbeError;
use crate::error::Result;
use crate::graph::TagGraph;
use crate::ingestion::filter::FileFilter;
use crate::ingestion::watcher::FileWatcher;
use crate::ingestion::watcher::WatchEvent;
use crate::ingestion::watcher::WatchEventKind;
use crate::registry::IndexRegistry;
use crate::store::SqliteStore;
use crate::tags::TagExtractor;

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestionStats {
    pub files_seen: usize,
    pub files_committed: usize,
    pub files_failed: usize,
    pub batches_aborted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathState {
    Pending,
    Processing,
    Committed,
}

pub struct IngestionPipeline {
    diary: String,
    config: IngestionConfig,
    filter: FileFilter,
    store: Arc<SqliteStore>,
    registry: Arc<IndexRegistry>,
    graph: Arc<TagGraph>,
    chunker: TextChunker,
    tag_extractor: TagExtractor,
    embedder: Arc<dyn EmbeddingProvider>,
    states: HashMap<PathBuf, PathState>,
    stats: IngestionStats,
}

impl IngestionPipeline {
    pub fn new(
        diary: String,
        config: IngestionConfig,
        store: Arc<SqliteStore>,
        registry: Arc<IndexRegistry>,
        graph: Arc<TagGraph>,
        chunker: TextChunker,
        tag_extractor: TagExtractor,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let filter = FileFilter::new(&config);
        Self {
            diary,
            config,
            filter,
            store,
            registry,
            graph,
            chunker,
            tag_extractor,
            embedder,
            states: HashMap::new(),
            stats: IngestionStats::default(),
        }
    }

    pub fn stats(&self) -> IngestionStats {
        self.stats
    }

    /// Walk `root_path` once, marking every non-ignored file pending, then
    /// flush in batches of at most `max_batch_size`.
    pub async fn run_full_scan(&mut self) -> Result<()> {
        let mut paths = Vec::new();
        walk_dir(&self.config.root_path, &self.filter, &mut paths)?;

        self.stats.files_seen += paths.len();
        for chunk in paths.chunks(self.config.max_batch_size) {
            self.flush_batch(chunk.to_vec()).await?;
        }
        Ok(())
    }

    /// Start the watcher and process events in windows of
    /// `batch_window_ms`, each capped at `max_batch_size` paths.
    pub async fn run_watch_loop(&mut self) -> Result<()> {
        let mut watcher = FileWatcher::start(
            &self.config.root_path,
            Duration::from_millis(self.config.batch_window_ms),
            FileFilter::new(&self.config),
        )?;

        loop {
            let mut batch_upserts = Vec::new();
            let mut batch_deletes = Vec::new();
            let deadline = tokio::time::sleep(Duration::from_millis(self.config.batch_window_ms));
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    event = watcher.recv() => {
                        match event {
                            Some(WatchEvent { path, kind: WatchEventKind::Changed }) => batch_upserts.push(path),
                            Some(WatchEvent { path, kind: WatchEventKind::Removed }) => batch_deletes.push(path),
                            None => return Ok(()),
                        }
                        if batch_upserts.len() + batch_deletes.len() >= self.config.max_batch_size {
                            break;
                        }
                    }
                    _ = &mut deadline => break,
                }
            }

            for path in batch_deletes {
                self.handle_delete(&path).await?;
            }
            if !batch_upserts.is_empty() {
                self.flush_batch(batch_upserts).await?;
            }
        }
    }

    pub async fn handle_delete(&mut self, path: &Path) -> Result<()> {
        let rel = self.relative_path(path);

        let chunk_ids = match self.store.get_file(self.diary.clone(), rel.clone()).await? {
            Some(file) => self.store.iter_chunks(file.id).await?.into_iter().map(|c| c.id).collect(),
            None => Vec::new(),
        };

        self.store.delete_file(self.diary.clone(), rel.clone()).await?;
        if !chunk_ids.is_empty() {
            if let Err(e) = self.registry.apply_updates(&self.diary, &self.store, &[], &chunk_ids).await {
                tracing::warn!(error = %e, "failed to remove deleted file's chunks from diary index");
            }
        }
        self.graph.rebuild(&self.store).await?;
        self.states.remove(path);
        Ok(())
    }

    fn relative_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.config.root_path)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }

    /// The nine-step flush: hash, skip-if-unchanged, chunk, extract tags,
    /// embed (outside any transaction), then a single synchronous
    /// transaction writing files/chunks/tags, then index mutation after
    /// commit.
    async fn flush_batch(&mut self, paths: Vec<PathBuf>) -> Result<()> {
        for p in &paths {
            self.states.insert(p.clone(), PathState::Pending);
        }

        let mut to_process = Vec::new();
        for path in &paths {
            self.states.insert(path.clone(), PathState::Processing);
            let rel = self.relative_path(path);

            let content = match std::fs::read_to_string(path) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to read file, dropping from batch");
                    self.stats.files_failed += 1;
                    self.states.remove(path);
                    continue;
                }
            };
            let hash = content_hash(&content);

            if let Ok(Some(existing)) = self.store.get_file(self.diary.clone(), rel.clone()).await {
                if existing.content_hash == hash {
                    // Idempotent: unchanged content means zero chunk
                    // writes and zero embedder calls.
                    self.states.insert(path.clone(), PathState::Committed);
                    continue;
                }
            }

            let chunks = match self.chunker.chunk(&content) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "chunking failed, dropping from batch");
                    self.stats.files_failed += 1;
                    self.states.remove(path);
                    continue;
                }
            };
            let tag_names = self.tag_extractor.extract(&content);

            to_process.push((path.clone(), rel, hash, chunks, tag_names));
        }

        if to_process.is_empty() {
            return Ok(());
        }

        // Embed every chunk across the whole batch before entering the
        // transaction: no suspension point may occur between opening and
        // committing the write below.
        let mut all_texts = Vec::new();
        let mut offsets = Vec::new();
        for (_, _, _, chunks, _) in &to_process {
            offsets.push((all_texts.len(), chunks.len()));
            all_texts.extend(chunks.iter().cloned());
        }

        // Chunks whose content normalized to the empty-content sentinel
        // carry nothing embeddable; exclude them from the embedder call
        // and leave a None in their slot once results come back.
        let embeddable: Vec<(usize, String)> = all_texts
            .iter()
            .enumerate()
            .filter(|(_, t)| t.as_str() != crate::chunking::EMPTY_CONTENT_SENTINEL)
            .map(|(i, t)| (i, t.clone()))
            .collect();
        let embeddable_texts: Vec<String> = embeddable.iter().map(|(_, t)| t.clone()).collect();

        let embeddings = match self.embedder.embed(&embeddable_texts).await {
            Ok(e) => {
                let mut full = vec![None; all_texts.len()];
                for ((idx, _), emb) in embeddable.iter().zip(e.into_iter()) {
                    full[*idx] = emb;
                }
                full
            }
            Err(e) => {
                tracing::warn!(error = %e, "embedder failed, aborting batch, leaving paths pending");
                self.stats.batches_aborted += 1;
                for (path, ..) in &to_process {
                    self.states.insert(path.clone(), PathState::Pending);
                }
                return Err(KbeError::BatchAborted { cause: e.to_string() });
            }
        };

        let mut committed_paths = Vec::new();
        let mut post_commit_updates: Vec<Vec<(i64, Vec<f32>)>> = Vec::new();

        for (idx, (path, rel, hash, chunks, tag_names)) in to_process.into_iter().enumerate() {
            let (start, len) = offsets[idx];
            let chunk_embeddings = &embeddings[start..start + len];

            let diary = self.diary.clone();
            let store = self.store.clone();
            let mtime = file_mtime(&path);

            let chunk_texts: Vec<(i32, String, usize, Option<Vec<f32>>)> = chunks
                .iter()
                .enumerate()
                .map(|(i, t)| (i as i32, t.clone(), t.split_whitespace().count(), chunk_embeddings[i].clone()))
                .collect();

            let tag_names_for_tx = tag_names.clone();
            let commit_result: Result<(i64, Vec<i64>, Vec<i64>)> = store
                .transaction(move |conn| {
                    let now = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(0);
                    conn.execute(
                        "INSERT INTO files (diary, path, content_hash, mtime, indexed_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT(diary, path) DO UPDATE SET
                            content_hash = excluded.content_hash,
                            mtime = excluded.mtime,
                            indexed_at = excluded.indexed_at",
                        rusqlite::params![diary, rel, hash, mtime, now],
                    )?;
                    let file_id: i64 = conn.query_row(
                        "SELECT id FROM files WHERE diary = ?1 AND path = ?2",
                        rusqlite::params![diary, rel],
                        |r| r.get(0),
                    )?;

                    let chunk_ids = SqliteStore::replace_chunks(conn, file_id, &chunk_texts)?;

                    let mut tag_ids = Vec::new();
                    for name in &tag_names_for_tx {
                        tag_ids.push(SqliteStore::get_or_create_tag(conn, name)?);
                    }
                    SqliteStore::replace_file_tags(conn, file_id, &tag_ids)?;

                    Ok((file_id, chunk_ids, tag_ids))
                })
                .await;

            match commit_result {
                Ok((_file_id, chunk_ids, _tag_ids)) => {
                    let updates: Vec<(i64, Vec<f32>)> = chunk_ids
                        .into_iter()
                        .zip(chunk_embeddings.iter())
                        .filter_map(|(id, emb)| emb.clone().map(|v| (id, v)))
                        .collect();
                    post_commit_updates.push(updates);
                    committed_paths.push(path.clone());
                    self.states.insert(path, PathState::Committed);
                    self.stats.files_committed += 1;
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "commit failed, leaving path pending");
                    self.states.insert(path, PathState::Pending);
                    self.stats.files_failed += 1;
                }
            }
        }

        // Index mutation after commit: a failure here is permissible, not
        // required to succeed atomically with the DB write.
        for updates in post_commit_updates {
            if let Err(e) = self.registry.apply_updates(&self.diary, &self.store, &updates, &[]).await {
                tracing::warn!(error = %e, "post-commit index update failed, DB remains authoritative");
            }
        }

        if !committed_paths.is_empty() {
            if let Err(e) = self.graph.rebuild(&self.store).await {
                tracing::warn!(error = %e, "tag graph rebuild failed after batch commit");
            }
        }

        Ok(())
    }
}

fn content_hash(content: &str) -> String {
    let digest = sha2::Sha256::digest(content.as_bytes());
    hex::encode(digest)
}

fn file_mtime(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn walk_dir(root: &Path, filter: &FileFilter, out: &mut Vec<PathBuf>) -> Result<()> {
    if !root.exists() {
        return Ok(());
    }
    let entries = std::fs::read_dir(root).map_err(|e| KbeError::FileRead {
        path: root.to_path_buf(),
        cause: e.to_string(),
    })?;

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read directory entry, skipping");
                continue;
            }
        };
        let path = entry.path();
        if filter.is_ignored(&path) {
            continue;
        }
        if path.is_dir() {
            walk_dir(&path, filter, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::EmbeddingProvider;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct MockEmbedder;

    #[async_trait]
    impl EmbeddingProvider for MockEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Option<crate::types::Vector>>> {
            Ok(texts.iter().map(|_| Some(vec![1.0; 8])).collect())
        }
        fn dim(&self) -> usize {
            8
        }
    }

    async fn build_pipeline(root: &Path) -> (IngestionPipeline, Arc<SqliteStore>, Arc<IndexRegistry>) {
        let store = Arc::new(SqliteStore::open(&root.join("kb.sqlite")).unwrap());
        let registry = Arc::new(IndexRegistry::new(root.to_path_buf(), 8));
        let graph = Arc::new(TagGraph::default());
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(MockEmbedder);
        let mut config = IngestionConfig::default();
        config.root_path = root.join("files");
        std::fs::create_dir_all(&config.root_path).unwrap();

        let pipeline = IngestionPipeline::new(
            "diaryA".to_string(),
            config,
            store.clone(),
            registry.clone(),
            graph,
            TextChunker::new(512),
            TagExtractor::default(),
            embedder,
        );
        (pipeline, store, registry)
    }

    #[tokio::test]
    async fn full_scan_ingests_a_single_file() {
        let dir = tempdir().unwrap();
        let (mut pipeline, store, _registry) = build_pipeline(dir.path()).await;

        std::fs::write(dir.path().join("files/a.md"), "alpha bravo\nTag: foo, bar").unwrap();

        pipeline.run_full_scan().await.unwrap();
        assert_eq!(pipeline.stats().files_committed, 1);

        let chunks = store.iter_candidate_chunks(Some("diaryA".to_string())).await.unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn rescanning_unchanged_file_does_not_recommit() {
        let dir = tempdir().unwrap();
        let (mut pipeline, _store, _registry) = build_pipeline(dir.path()).await;

        std::fs::write(dir.path().join("files/a.md"), "alpha bravo").unwrap();
        pipeline.run_full_scan().await.unwrap();
        assert_eq!(pipeline.stats().files_committed, 1);

        pipeline.run_full_scan().await.unwrap();
        // Second scan sees the same content hash, so no new commit happens.
        assert_eq!(pipeline.stats().files_committed, 1);
    }

    #[tokio::test]
    async fn handle_delete_removes_file_and_chunks() {
        let dir = tempdir().unwrap();
        let (mut pipeline, store, _registry) = build_pipeline(dir.path()).await;

        let path = dir.path().join("files/a.md");
        std::fs::write(&path, "alpha bravo").unwrap();
        pipeline.run_full_scan().await.unwrap();

        pipeline.handle_delete(&path).await.unwrap();
        let chunks = store.iter_candidate_chunks(Some("diaryA".to_string())).await.unwrap();
        assert!(chunks.is_empty());
    }
}
