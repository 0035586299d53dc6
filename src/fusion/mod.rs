//! Tag-Boost Fusion: blends a query vector with a context vector derived
//! from tags related to the query, via the global tag ANN index and the
//! Tag Graph's co-occurrence neighbors.
//!
//! All arithmetic here is f32, matching the rest of the vector pipeline.
//! Any dimension mismatch anywhere in the pipeline falls back to the
//! unboosted query vector and logs a warning rather than failing the
//! search outright — boost=0 must always be a safe, reachable state.

use crate::ann::ScoredId;
use crate::graph::TagGraphSnapshot;
use crate::types::normalize;
use crate::types::FusionInfo;
use crate::types::Tag;

const SPARSE_GRAPH_SYNTHETIC_WEIGHT: f32 = 10.0;
const SPARSE_GRAPH_SYNTHETIC_FREQ: f32 = 100.0;

/// Look up the global tag index for `query_vec`, walk the tag graph from
/// the resulting seed tags, and build a boosted query vector.
///
/// Returns `(fused_vector, info)`. On any failure (dimension mismatch,
/// degenerate seed set, empty graph) this falls back to `query_vec`
/// unchanged with `info.boost == 0.0`.
pub fn fuse(
    query_vec: &[f32],
    boost: f32,
    seed_hits: &[ScoredId],
    graph: &TagGraphSnapshot,
    tags_by_id: &std::collections::HashMap<i64, Tag>,
    tag_vectors: &std::collections::HashMap<i64, Vec<f32>>,
    tag_expand_max_count: usize,
) -> (Vec<f32>, FusionInfo) {
    let fallback = || (query_vec.to_vec(), FusionInfo::default());

    if boost <= 0.0 || seed_hits.is_empty() {
        return fallback();
    }

    // Accumulate co_score[t2] += w(t1, t2) * sim(t1) over every seed's
    // neighbors, excluding the seeds themselves.
    let seed_ids: std::collections::HashSet<i64> = seed_hits.iter().map(|h| h.id).collect();
    let mut co_score: std::collections::HashMap<i64, f32> = std::collections::HashMap::new();

    for seed in seed_hits {
        for &(neighbor, weight) in graph.neighbors_of(seed.id) {
            if seed_ids.contains(&neighbor) {
                continue;
            }
            *co_score.entry(neighbor).or_insert(0.0) += weight as f32 * seed.score;
        }
    }

    let mut candidates: Vec<(i64, f32)> = co_score.into_iter().collect();
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
    candidates.truncate(tag_expand_max_count);

    // Sparse-graph fallback: no expansion candidates survived, so treat the
    // seed tags themselves as the expansion set with a synthetic weight.
    let using_sparse_fallback = candidates.is_empty();
    if using_sparse_fallback {
        for seed in seed_hits {
            candidates.push((seed.id, SPARSE_GRAPH_SYNTHETIC_WEIGHT));
        }
    }

    let mut total_score: f32 = 0.0;
    let mut weighted_sum: Option<Vec<f32>> = None;
    let mut matched_tags = Vec::new();

    for (tag_id, co_weight) in &candidates {
        let global_freq = if using_sparse_fallback {
            SPARSE_GRAPH_SYNTHETIC_FREQ
        } else {
            tags_by_id.get(tag_id).map(|t| t.global_freq as f32).unwrap_or(0.0)
        };

        let score = {
            let s = co_weight.powf(2.5) / (global_freq + 2.0).ln();
            if s.is_finite() { s } else { 0.0 }
        };
        if score <= 0.0 {
            continue;
        }

        let Some(tag_vector) = tag_vectors.get(tag_id) else { continue };
        if tag_vector.len() != query_vec.len() {
            tracing::warn!(tag_id, "tag vector dimension mismatch during fusion, falling back");
            return fallback();
        }

        total_score += score;
        let acc = weighted_sum.get_or_insert_with(|| vec![0.0; query_vec.len()]);
        for (a, v) in acc.iter_mut().zip(tag_vector.iter()) {
            *a += score * v;
        }
        if let Some(tag) = tags_by_id.get(tag_id) {
            matched_tags.push(tag.name.clone());
        }
    }

    if total_score <= 0.0 {
        return fallback();
    }

    let mut context: Vec<f32> = weighted_sum
        .unwrap_or_else(|| vec![0.0; query_vec.len()])
        .iter()
        .map(|x| x / total_score)
        .collect();
    normalize(&mut context);

    let mut fused: Vec<f32> = query_vec
        .iter()
        .zip(context.iter())
        .map(|(q, c)| (1.0 - boost) * q + boost * c)
        .collect();
    normalize(&mut fused);

    let info = FusionInfo {
        matched_tags,
        boost,
        spike_count: candidates.len(),
        total_score,
    };

    (fused, info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn tag(id: i64, name: &str, freq: i64) -> Tag {
        Tag { id, name: name.to_string(), global_freq: freq }
    }

    #[test]
    fn boost_zero_is_identity_fallback() {
        let q = vec![1.0, 0.0];
        let graph = TagGraphSnapshot::default();
        let (fused, info) = fuse(&q, 0.0, &[], &graph, &HashMap::new(), &HashMap::new(), 30);
        assert_eq!(fused, q);
        assert_eq!(info.boost, 0.0);
        assert!(info.matched_tags.is_empty());
    }

    #[test]
    fn empty_seed_hits_is_identity_fallback() {
        let q = vec![1.0, 0.0];
        let graph = TagGraphSnapshot::default();
        let (fused, info) = fuse(&q, 0.5, &[], &graph, &HashMap::new(), &HashMap::new(), 30);
        assert_eq!(fused, q);
        assert_eq!(info.boost, 0.0);
    }

    #[test]
    fn dimension_mismatch_falls_back_safely() {
        let q = vec![1.0, 0.0];
        let mut tags_by_id = HashMap::new();
        tags_by_id.insert(1, tag(1, "rust", 5));
        let mut tag_vectors = HashMap::new();
        tag_vectors.insert(1, vec![1.0, 0.0, 0.0]); // wrong dim

        let seeds = vec![ScoredId { id: 1, score: 0.9 }];
        let mut neighbors = std::collections::HashMap::new();
        neighbors.insert(1i64, vec![(1i64, 10u32)]);
        // no real neighbor graph; sparse fallback uses seed itself
        let graph = TagGraphSnapshot::default();

        let (fused, info) = fuse(&q, 0.5, &seeds, &graph, &tags_by_id, &tag_vectors, 30);
        assert_eq!(fused, q);
        assert_eq!(info.boost, 0.0);
    }

    #[test]
    fn non_trivial_fusion_blends_toward_context() {
        let q = vec![1.0, 0.0];
        let mut tags_by_id = HashMap::new();
        tags_by_id.insert(2, tag(2, "cooking", 3));
        let mut tag_vectors = HashMap::new();
        tag_vectors.insert(2, vec![0.0, 1.0]);

        let seeds = vec![ScoredId { id: 1, score: 0.9 }];
        let graph = TagGraphSnapshot::default();
        // Sparse fallback: no neighbors registered for seed id 1, so the
        // seed itself becomes the candidate, but its vector is absent, so
        // this exercises the no-candidate-survives path instead. Use tag 1
        // as both seed and vector holder to get a real blend.
        tags_by_id.insert(1, tag(1, "seed", 3));
        tag_vectors.insert(1, vec![0.0, 1.0]);

        let (fused, info) = fuse(&q, 0.5, &seeds, &graph, &tags_by_id, &tag_vectors, 30);
        assert!(info.boost > 0.0);
        assert!(fused[1] > 0.0, "fused vector should lean toward the tag context");
    }
}
