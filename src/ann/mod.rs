//! The ANN Index: an in-process, file-persistable vector index.
//!
//! Modeled as a capability behind the [`AnnIndex`] trait per the engine's
//! dynamic-dispatch design note, so the default flat/exact implementation
//! can later be swapped for a genuine approximate structure without
//! touching the Index Registry or Retriever. Higher score always means
//! more similar at this boundary; a backend that natively returns
//! distances must invert before returning from `search`.

mod flat;

pub use flat::FlatIndex;

use crate::error::Result;

/// One scored result from an ANN search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredId {
    pub id: i64,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IndexStats {
    pub live_count: usize,
    pub tombstoned_count: usize,
    pub dim: usize,
}

pub trait AnnIndex: Send + Sync {
    /// Create an empty index for vectors of the given dimension.
    fn create(dim: usize) -> Self
    where
        Self: Sized;

    /// Insert or replace the vector for `id`. Replaces any tombstone.
    fn add(&mut self, id: i64, vector: &[f32]) -> Result<()>;

    /// Tombstone `id`. A removed id must never again appear in `search`
    /// results until re-added.
    fn remove(&mut self, id: i64);

    /// Search for the `k` nearest vectors to `query`, descending by score.
    /// Scores are only comparable within this one index.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredId>>;

    fn stats(&self) -> IndexStats;

    /// Fetch the stored vector for a live (non-tombstoned) id, if present.
    /// Used by hybrid search to re-score a BM25-prefiltered candidate set
    /// by cosine similarity without a second ANN traversal.
    fn get_vector(&self, id: i64) -> Option<&[f32]>;

    /// Atomically persist to `path`: write to a temp file in the same
    /// directory, fsync, then rename. A crash between the temp write and
    /// the rename must leave the previous file, if any, untouched.
    fn save(&self, path: &std::path::Path) -> Result<()>;

    fn load(path: &std::path::Path) -> Result<Self>
    where
        Self: Sized;
}
