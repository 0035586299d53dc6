//! The Embedder: batches chunk text, calls an external HTTP embedding
//! service with bounded concurrency, and never surfaces a single transient
//! failure as an error to the ingestion pipeline — only exhaustion of all
//! retries on a batch does.

mod http;

pub use http::HttpEmbedder;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Vector;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, preserving input order in the output.
    /// Individual oversize inputs are skipped per the engine's documented
    /// policy (see `embedder::http::OVERSIZE_POLICY`); all other inputs in
    /// the batch are still embedded.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Option<Vector>>>;

    fn dim(&self) -> usize;
}

/// Greedily pack texts into batches respecting both a token budget and an
/// item-count cap. Each inner `Vec<usize>` is a list of indices into the
/// original `texts` slice, preserving order.
pub fn pack_batches(token_counts: &[usize], max_tokens_per_batch: usize, max_items_per_batch: usize) -> Vec<Vec<usize>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_tokens = 0usize;

    for (i, &tokens) in token_counts.iter().enumerate() {
        let would_overflow_tokens = current_tokens + tokens > max_tokens_per_batch && !current.is_empty();
        let would_overflow_items = current.len() >= max_items_per_batch;
        if would_overflow_tokens || would_overflow_items {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current.push(i);
        current_tokens += tokens;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_respecting_item_cap() {
        let counts = vec![10; 10];
        let batches = pack_batches(&counts, 1_000_000, 3);
        assert_eq!(batches.len(), 4);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[3].len(), 1);
    }

    #[test]
    fn packs_respecting_token_cap() {
        let counts = vec![40, 40, 40, 40];
        let batches = pack_batches(&counts, 100, 100);
        // 40+40=80 fits, +40 would be 120 > 100, so splits after two.
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], vec![0, 1]);
        assert_eq!(batches[1], vec![2, 3]);
    }

    #[test]
    fn a_single_oversize_item_still_gets_its_own_batch() {
        let counts = vec![10_000];
        let batches = pack_batches(&counts, 100, 100);
        assert_eq!(batches, vec![vec![0]]);
    }

    #[test]
    fn preserves_order_across_batches() {
        let counts = vec![1; 5];
        let batches = pack_batches(&counts, 1_000, 2);
        let flat: Vec<usize> = batches.into_iter().flatten().collect();
        assert_eq!(flat, vec![0, 1, 2, 3, 4]);
    }
}
