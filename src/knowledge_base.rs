//! Top-level facade. No CLI surface ships in this crate; callers embed
//! `KnowledgeBase` directly:
//!
//! ```ignore
//! let mut kb = KnowledgeBase::open(config)?;
//! kb.initialize().await?;
//! let hits = kb.search_hybrid(None, "some query", 10, &Default::default()).await?;
//! kb.shutdown().await?;
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::chunking::TextChunker;
use crate::config::RetrievalConfig;
use crate::embedder::EmbeddingProvider;
use crate::embedder::HttpEmbedder;
use crate::error::Result;
use crate::graph::TagGraph;
use crate::ingestion::IngestionPipeline;
use crate::registry::IndexRegistry;
use crate::reranker::Reranker;
use crate::retriever::Retriever;
use crate::store::SqliteStore;
use crate::tags::TagExtractor;
use crate::types::Hit;
use crate::types::HybridSearchOptions;

/// Owns every long-lived component: the Store, the Index Registry, the
/// Tag Graph, the Retriever, and (once `initialize` has run) the
/// background ingestion task. Dropping or calling `shutdown` stops
/// ingestion and flushes every dirty index.
pub struct KnowledgeBase {
    config: RetrievalConfig,
    store: Arc<SqliteStore>,
    registry: Arc<IndexRegistry>,
    graph: Arc<TagGraph>,
    embedder: Arc<dyn EmbeddingProvider>,
    retriever: Retriever,
    ingestion_task: Option<JoinHandle<()>>,
}

impl KnowledgeBase {
    /// Open the store and wire every component together. Only
    /// configuration errors are allowed to surface here; everything else
    /// the engine encounters later is caught, logged, and degrades the
    /// affected operation rather than propagating.
    pub fn open(config: RetrievalConfig) -> Result<Self> {
        config.validate()?;
        for warning in config.warnings() {
            tracing::warn!(%warning, "configuration warning");
        }

        std::fs::create_dir_all(&config.data_dir).map_err(|e| crate::error::KbeError::Configuration {
            field: "data_dir".into(),
            cause: e.to_string(),
        })?;

        let db_path = config.data_dir.join("kbe.sqlite");
        let store = Arc::new(SqliteStore::open(&db_path)?);
        let registry = Arc::new(IndexRegistry::new(config.data_dir.clone(), config.embedding_dim));
        let graph = Arc::new(TagGraph::default());
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HttpEmbedder::new(config.embedder.clone(), config.embedding_dim)?);
        let reranker = Arc::new(Reranker::new(config.reranker.clone())?);

        let retriever = Retriever::new(store.clone(), registry.clone(), graph.clone(), embedder.clone(), reranker, config.clone());

        Ok(Self {
            config,
            store,
            registry,
            graph,
            embedder,
            retriever,
            ingestion_task: None,
        })
    }

    /// Run a full scan if configured, then start the watcher and the
    /// background batch-ingestion loop. Safe to call once; a second call
    /// is a no-op if ingestion is already running.
    pub async fn initialize(&mut self) -> Result<()> {
        if self.ingestion_task.is_some() {
            return Ok(());
        }

        let diary = default_diary_name(&self.config.ingestion.root_path);
        let mut pipeline = IngestionPipeline::new(
            diary,
            self.config.ingestion.clone(),
            self.store.clone(),
            self.registry.clone(),
            self.graph.clone(),
            TextChunker::new(self.config.chunk_max_tokens),
            TagExtractor::default(),
            self.embedder.clone(),
        );

        if self.config.ingestion.full_scan_on_startup {
            pipeline.run_full_scan().await?;
        }

        let handle = tokio::spawn(async move {
            if let Err(e) = pipeline.run_watch_loop().await {
                tracing::error!(error = %e, "ingestion watch loop exited");
            }
        });
        self.ingestion_task = Some(handle);
        Ok(())
    }

    pub async fn search_vector(&self, diary: Option<&str>, query_vec: &[f32], k: usize, tag_boost: f32) -> Result<Vec<Hit>> {
        self.retriever.search_vector(diary, query_vec, k, tag_boost).await
    }

    pub async fn search_hybrid(&self, diary: Option<&str>, query_text: &str, k: usize, opts: &HybridSearchOptions) -> Result<Vec<Hit>> {
        self.retriever.search_hybrid(diary, query_text, k, opts).await
    }

    pub async fn search_tag_text(&self, query_text: &str, k: usize) -> Result<Vec<(String, f32)>> {
        self.retriever.search_tag_text(query_text, k).await
    }

    /// Stop the background ingestion task (if running) and flush every
    /// dirty ANN index to disk.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(handle) = self.ingestion_task.take() {
            handle.abort();
        }
        self.registry.save_all().await
    }
}

fn default_diary_name(root_path: &std::path::Path) -> String {
    root_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "default".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> RetrievalConfig {
        let mut config = RetrievalConfig {
            embedding_dim: 8,
            ..RetrievalConfig::default()
        };
        config.data_dir = dir.join(".kbe");
        config.ingestion.root_path = dir.join("notes");
        config.ingestion.full_scan_on_startup = false;
        config
    }

    #[tokio::test]
    async fn open_creates_data_dir_and_validates_config() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("notes")).unwrap();
        let kb = KnowledgeBase::open(test_config(dir.path())).unwrap();
        assert!(dir.path().join(".kbe").exists());
        drop(kb);
    }

    #[tokio::test]
    async fn shutdown_without_initialize_is_a_no_op() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("notes")).unwrap();
        let mut kb = KnowledgeBase::open(test_config(dir.path())).unwrap();
        kb.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn search_vector_on_empty_store_returns_empty() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("notes")).unwrap();
        let kb = KnowledgeBase::open(test_config(dir.path())).unwrap();
        let hits = kb.search_vector(None, &vec![1.0; 8], 5, 0.0).await.unwrap();
        assert!(hits.is_empty());
    }
}
