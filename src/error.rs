//! Error taxonomy for the knowledge-base engine.
//!
//! Variants map onto the six error kinds the engine distinguishes internally:
//! configuration, transient I/O, permanent I/O, storage, corruption and query
//! errors. Only configuration errors are ever allowed to surface from the
//! public `KnowledgeBase` API; everything else is caught, logged and turned
//! into an empty result or a retry by the caller.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, KbeError>;

#[derive(Debug, thiserror::Error)]
pub enum KbeError {
    /// Bad or missing configuration. Fatal at `open`.
    #[error("configuration error ({field}): {cause}")]
    Configuration { field: String, cause: String },

    #[error("failed to parse config file {path}: {cause}")]
    ConfigParse { path: PathBuf, cause: String },

    /// SQLite-level failure. Most are transient (SQLITE_BUSY) and retried by
    /// the caller; the rest are surfaced.
    #[error("sqlite error at {path}: {cause}")]
    Sqlite { path: PathBuf, cause: String },

    /// Reading or writing a file on disk. Distinguished from `Sqlite`
    /// because the ingestion pipeline treats per-file I/O errors as
    /// drop-and-log, not batch-fatal.
    #[error("failed to read {path}: {cause}")]
    FileRead { path: PathBuf, cause: String },

    #[error("failed to write {path}: {cause}")]
    FileWrite { path: PathBuf, cause: String },

    /// An ANN index file could not be parsed, or a recoverable structural
    /// invariant inside the index was violated. Never fatal: callers rebuild
    /// from the Store and log a warning.
    #[error("corrupt index at {path}: {cause}")]
    CorruptIndex { path: PathBuf, cause: String },

    /// Vector dimensionality did not match the index's configured
    /// dimension.
    #[error("dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The embedding HTTP service failed after exhausting retries.
    #[error("embedding request failed: {cause}")]
    EmbeddingFailed { cause: String },

    /// The rerank HTTP service failed after exhausting retries. Per spec,
    /// rerank failures degrade to pre-rerank ordering rather than erroring.
    #[error("rerank request failed: {cause}")]
    RerankFailed { cause: String },

    #[error("tag extraction failed: {cause}")]
    TagExtractionFailed { cause: String },

    #[error("chunking failed: {cause}")]
    ChunkingFailed { cause: String },

    /// Ingestion batch aborted and rolled back; the set of paths is kept
    /// pending so the next batch retries them.
    #[error("ingestion batch aborted: {cause}")]
    BatchAborted { cause: String },

    #[error("requested entity not found: {0}")]
    NotFound(String),

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("filesystem watch error: {cause}")]
    WatchFailed { cause: String },
}

impl KbeError {
    pub fn sqlite_error(path: &std::path::Path, e: impl std::fmt::Display) -> Self {
        KbeError::Sqlite {
            path: path.to_path_buf(),
            cause: e.to_string(),
        }
    }

    /// Whether this error kind is expected to be transient and worth
    /// retrying with backoff (SQLITE_BUSY, network hiccups).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KbeError::Sqlite { cause, .. } if cause.contains("database is locked") || cause.contains("SQLITE_BUSY")
        )
    }

    /// Whether this error represents corruption that should trigger a
    /// rebuild-from-Store rather than propagate.
    pub fn is_corruption(&self) -> bool {
        matches!(self, KbeError::CorruptIndex { .. } | KbeError::DimensionMismatch { .. })
    }
}

impl From<rusqlite::Error> for KbeError {
    fn from(e: rusqlite::Error) -> Self {
        KbeError::Sqlite {
            path: PathBuf::new(),
            cause: e.to_string(),
        }
    }
}
