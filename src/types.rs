//! Core data model: files, chunks, tags and search results.

use serde::Deserialize;
use serde::Serialize;

/// A source file tracked by a diary (workspace/collection namespace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    pub diary: String,
    pub path: String,
    pub content_hash: String,
    pub mtime: i64,
    pub indexed_at: i64,
}

/// A normalized, embeddable unit of text extracted from a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: i64,
    pub file_id: i64,
    /// Monotonically increasing within a file, starting at 0.
    pub ordinal: i32,
    pub text: String,
    pub token_count: usize,
    /// Absent for chunks the embedder skipped (oversize input, or
    /// normalized-to-empty content) rather than a zero vector.
    pub vector: Option<Vec<f32>>,
}

/// A user tag, deduplicated case-insensitively at the Store boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    /// Number of distinct files this tag is attached to, maintained
    /// incrementally by the Store.
    pub global_freq: i64,
}

/// An edge between a file and a tag extracted from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTag {
    pub file_id: i64,
    pub tag_id: i64,
}

/// A single retrieval result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub text: String,
    pub score: f32,
    pub source_file: String,
    pub matched_tags: Option<Vec<String>>,
    pub tag_match_count: Option<usize>,
    /// True if this hit's score came from the cross-encoder reranker
    /// rather than the pre-rerank blended score. False both when rerank
    /// was never requested and when it was requested but failed.
    pub reranked: bool,
}

/// Extra diagnostic info returned alongside a tag-boosted search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FusionInfo {
    pub matched_tags: Vec<String>,
    pub boost: f32,
    pub spike_count: usize,
    pub total_score: f32,
}

/// Options accepted by `search_hybrid`.
#[derive(Debug, Clone)]
pub struct HybridSearchOptions {
    /// Applied to the embedded query vector before the vector-score half
    /// of the blend, the same as `search_vector`'s `tag_boost`.
    pub tag_boost: f32,
    pub use_semantic_groups: bool,
    pub rerank: bool,
    /// When set, only candidates whose first line contains this string
    /// are considered (the "signature" predicate).
    pub signature: Option<String>,
}

impl Default for HybridSearchOptions {
    fn default() -> Self {
        Self {
            tag_boost: 0.0,
            use_semantic_groups: false,
            rerank: false,
            signature: None,
        }
    }
}

/// A dense embedding vector, always f32 per spec arithmetic rules.
pub type Vector = Vec<f32>;

/// Normalize a vector to unit length in place. A zero vector is left
/// untouched (callers must treat it as degenerate).
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let num = dot(a, b);
    let da = dot(a, a).sqrt();
    let db = dot(b, b).sqrt();
    if da == 0.0 || db == 0.0 {
        return 0.0;
    }
    num / (da * db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_unit_length() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((dot(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_zero_vector_untouched() {
        let mut v = vec![0.0, 0.0];
        normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0]);
    }

    #[test]
    fn cosine_identical_vectors_is_one() {
        let a = vec![1.0, 2.0, 3.0];
        assert!((cosine(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine(&a, &b).abs() < 1e-6);
    }
}
