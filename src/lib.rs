//! Knowledge-base retrieval engine
//!
//! The engineering core of a personal memory system: a SQLite-backed
//! store, a file-based ANN index, a background ingestion pipeline, and
//! a tag-boosted hybrid retriever sit behind a single `KnowledgeBase`
//! handle. There is no CLI surface here — callers embed the crate.
//!
//! ## Features
//!
//! | Component | Description | Config Key | Default |
//! |-----------|-------------|------------|---------|
//! | **Vector Search** | Exact cosine ANN over a file-backed index | `embedding_dim` | 1536 |
//! | **Hybrid Search** | BM25 + vector score blend | `hybrid_bm25_weight`/`hybrid_vec_weight` | 0.6 / 0.4 |
//! | **Tag-Boost Fusion** | Co-occurrence-weighted query vector fusion | `tag_expand_max_count` | 30 |
//! | **Ingestion** | Debounced filesystem watch + batch commit | `ingestion.batch_window_ms` | 2000 |
//! | **Rerank** | Optional external rerank service | `reranker.rerank_url` | off |
//!
//! ## Quick Start
//!
//! ```toml
//! [ingestion]
//! root_path = "/home/user/notes"
//!
//! [embedder]
//! api_url = "http://localhost:8081"
//! ```

pub mod ann;
pub mod chunking;
pub mod config;
pub mod embedder;
pub mod error;
pub mod fusion;
pub mod graph;
pub mod ingestion;
pub mod knowledge_base;
pub mod registry;
pub mod reranker;
pub mod retriever;
pub mod store;
pub mod tags;
pub mod types;

pub use ann::AnnIndex;
pub use ann::FlatIndex;
pub use ann::ScoredId;
pub use chunking::normalize_text;
pub use chunking::TextChunker;
pub use config::EmbedderConfig;
pub use config::IngestionConfig;
pub use config::RerankerConfig;
pub use config::RetrievalConfig;
pub use embedder::EmbeddingProvider;
pub use embedder::HttpEmbedder;
pub use error::KbeError;
pub use error::Result;
pub use graph::TagGraph;
pub use ingestion::FileWatcher;
pub use ingestion::IngestionPipeline;
pub use ingestion::IngestionStats;
pub use ingestion::WatchEvent;
pub use ingestion::WatchEventKind;
pub use knowledge_base::KnowledgeBase;
pub use registry::IndexRegistry;
pub use reranker::Reranker;
pub use retriever::Retriever;
pub use store::SqliteStore;
pub use tags::TagExtractor;
pub use types::Chunk;
pub use types::FileRecord;
pub use types::FileTag;
pub use types::FusionInfo;
pub use types::Hit;
pub use types::HybridSearchOptions;
pub use types::Tag;
pub use types::Vector;
