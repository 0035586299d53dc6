//! The Retriever: the only component that answers a query. Composes the
//! ANN indices, the Tag Graph, the Embedder and an optional reranker into
//! three public operations: plain vector search (optionally tag-boosted),
//! BM25-prefiltered hybrid search, and tag-text search.

mod bm25;

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::ann::ScoredId;
use crate::config::RetrievalConfig;
use crate::embedder::EmbeddingProvider;
use crate::error::Result;
use crate::fusion::fuse;
use crate::graph::TagGraph;
use crate::registry::IndexRegistry;
use crate::reranker::Reranker;
use crate::store::SqliteStore;
use crate::types::cosine;
use crate::types::Hit;
use crate::types::HybridSearchOptions;

/// Fixed synonym groups for hybrid search's optional query-term expansion.
/// Each group is treated as mutually substitutable; a query term present in
/// a group pulls in the rest of that group as additional BM25 terms.
static SEMANTIC_GROUPS: Lazy<Vec<Vec<&'static str>>> = Lazy::new(|| {
    vec![
        vec!["bug", "defect", "issue", "error"],
        vec!["fix", "patch", "resolve", "repair"],
        vec!["fast", "quick", "rapid", "speedy"],
        vec!["remove", "delete", "drop", "strip"],
        vec!["config", "configuration", "settings", "options"],
        vec!["doc", "docs", "documentation"],
        vec!["test", "tests", "testing"],
    ]
});

fn expand_with_semantic_groups(terms: &[String]) -> Vec<String> {
    let mut expanded: Vec<String> = terms.to_vec();
    let seen: HashSet<String> = terms.iter().cloned().collect();
    let mut added = HashSet::new();
    for term in terms {
        for group in SEMANTIC_GROUPS.iter() {
            if group.contains(&term.as_str()) {
                for synonym in group {
                    if !seen.contains(*synonym) && added.insert(synonym.to_string()) {
                        expanded.push(synonym.to_string());
                    }
                }
            }
        }
    }
    expanded
}

pub struct Retriever {
    store: Arc<SqliteStore>,
    registry: Arc<IndexRegistry>,
    graph: Arc<TagGraph>,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Arc<Reranker>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        store: Arc<SqliteStore>,
        registry: Arc<IndexRegistry>,
        graph: Arc<TagGraph>,
        embedder: Arc<dyn EmbeddingProvider>,
        reranker: Arc<Reranker>,
        config: RetrievalConfig,
    ) -> Self {
        Self { store, registry, graph, embedder, reranker, config }
    }

    /// Plain (optionally tag-boosted) vector search. `diary = None`
    /// fans out across every known diary and merges to a single top-k by
    /// score, tie-broken by ascending chunk id.
    pub async fn search_vector(&self, diary: Option<&str>, query_vec: &[f32], k: usize, tag_boost: f32) -> Result<Vec<Hit>> {
        let (fused_vec, fusion_info) = if tag_boost > 0.0 {
            let (v, info) = self.apply_tag_boost(query_vec, tag_boost).await?;
            (v, Some(info))
        } else {
            (query_vec.to_vec(), None)
        };

        let scored = match diary {
            Some(d) => self.registry.search_diary(d, &self.store, &fused_vec, k).await?,
            None => {
                let diaries = self.store.list_diaries().await?;
                let mut futures = Vec::new();
                for d in diaries {
                    let registry = self.registry.clone();
                    let store = self.store.clone();
                    let fused_vec = fused_vec.clone();
                    futures.push(async move { registry.search_diary(&d, &store, &fused_vec, k).await });
                }
                let mut merged = Vec::new();
                for result in futures::future::join_all(futures).await {
                    merged.extend(result?);
                }
                merged.sort_by(|a: &ScoredId, b: &ScoredId| {
                    b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then(a.id.cmp(&b.id))
                });
                merged.truncate(k);
                merged
            }
        };

        self.hydrate_hits(scored, fusion_info.as_ref()).await
    }

    /// BM25-prefiltered hybrid search blending lexical and vector scores.
    pub async fn search_hybrid(&self, diary: Option<&str>, query_text: &str, k: usize, opts: &HybridSearchOptions) -> Result<Vec<Hit>> {
        let stopwords: HashSet<String> = self.config.stopwords.iter().cloned().collect();
        let mut query_terms = bm25::tokenize(query_text, &stopwords);
        if opts.use_semantic_groups {
            query_terms = expand_with_semantic_groups(&query_terms);
        }

        let mut candidates = self.store.iter_candidate_chunks(diary.map(|s| s.to_string())).await?;
        if let Some(signature) = &opts.signature {
            candidates.retain(|(chunk, _, _)| chunk.text.lines().next().is_some_and(|line| line.contains(signature.as_str())));
        }
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let documents: Vec<Vec<String>> = candidates.iter().map(|(c, _, _)| bm25::tokenize(&c.text, &stopwords)).collect();
        let scorer = bm25::Bm25Scorer::new(self.config.bm25_k1, self.config.bm25_b);
        let bm25_scores = scorer.score_all(&query_terms, &documents);

        let mut ranked: Vec<usize> = (0..candidates.len()).filter(|&i| bm25_scores[i] > 0.0).collect();
        ranked.sort_by(|&a, &b| bm25_scores[b].partial_cmp(&bm25_scores[a]).unwrap_or(std::cmp::Ordering::Equal));
        let keep = (self.config.hybrid_candidate_multiplier * k).max(k);
        ranked.truncate(keep);

        if ranked.is_empty() {
            return Ok(Vec::new());
        }

        let query_vectors = self.embedder.embed(&[query_text.to_string()]).await?;
        let Some(Some(query_vector)) = query_vectors.into_iter().next() else {
            return Ok(Vec::new());
        };
        let query_vector = if opts.tag_boost > 0.0 {
            self.apply_tag_boost(&query_vector, opts.tag_boost).await?.0
        } else {
            query_vector
        };

        let mut blended: Vec<(usize, f32, bool)> = Vec::new();
        for &i in &ranked {
            let (chunk, chunk_diary, _) = &candidates[i];
            let Some(vector) = self.registry.get_diary_vector(chunk_diary, &self.store, chunk.id).await else {
                continue;
            };
            let vec_score = cosine(&query_vector, &vector);
            let final_score = self.config.hybrid_bm25_weight * bm25_scores[i] + self.config.hybrid_vec_weight * vec_score;
            blended.push((i, final_score, false));
        }

        blended.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| {
            candidates[a.0].0.id.cmp(&candidates[b.0].0.id)
        }));
        blended.truncate(k);

        if opts.rerank && self.reranker.enabled() {
            let docs: Vec<String> = blended.iter().map(|&(i, _, _)| candidates[i].0.text.clone()).collect();
            let outcome = self.reranker.rerank(query_text, &docs).await;
            if !outcome.failed {
                let score_map: HashMap<usize, f32> = outcome.scores.into_iter().collect();
                for (local_idx, (_, score, reranked)) in blended.iter_mut().enumerate() {
                    if let Some(new_score) = score_map.get(&local_idx) {
                        *score = *new_score;
                        *reranked = true;
                    }
                }
                blended.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            }
        }

        Ok(blended
            .into_iter()
            .map(|(i, score, reranked)| {
                let (chunk, _, path) = &candidates[i];
                Hit {
                    text: chunk.text.clone(),
                    score,
                    source_file: path.clone(),
                    matched_tags: None,
                    tag_match_count: None,
                    reranked,
                }
            })
            .collect())
    }

    /// Search the global tag index by text, returning `(tag_name, score)`.
    pub async fn search_tag_text(&self, query_text: &str, k: usize) -> Result<Vec<(String, f32)>> {
        let query_vectors = self.embedder.embed(&[query_text.to_string()]).await?;
        let Some(Some(query_vector)) = query_vectors.into_iter().next() else {
            return Ok(Vec::new());
        };
        let hits = self.registry.search_global_tags(&self.store, &query_vector, k).await?;
        let tags = self.store.iter_tags().await?;
        let by_id: HashMap<i64, String> = tags.into_iter().map(|t| (t.id, t.name)).collect();
        Ok(hits
            .into_iter()
            .filter_map(|h| by_id.get(&h.id).map(|name| (name.clone(), h.score)))
            .collect())
    }

    async fn apply_tag_boost(&self, query_vec: &[f32], boost: f32) -> Result<(Vec<f32>, crate::types::FusionInfo)> {
        let seed_hits = self.registry.search_global_tags(&self.store, query_vec, 10).await?;
        let snapshot = self.graph.snapshot();
        let tags = self.store.iter_tags().await?;
        let tags_by_id: HashMap<i64, crate::types::Tag> = tags.iter().map(|t| (t.id, t.clone())).collect();

        let mut tag_vectors = HashMap::new();
        for tag in &tags {
            if let Some(v) = self.store.get_tag_vector(tag.id).await? {
                tag_vectors.insert(tag.id, v);
            }
        }

        Ok(fuse(query_vec, boost, &seed_hits, &snapshot, &tags_by_id, &tag_vectors, self.config.tag_expand_max_count))
    }

    async fn hydrate_hits(&self, scored: Vec<ScoredId>, fusion: Option<&crate::types::FusionInfo>) -> Result<Vec<Hit>> {
        let chunks = self.store.hydrate_chunks(scored.iter().map(|s| s.id).collect()).await?;
        let by_id: HashMap<i64, crate::types::Chunk> = chunks.into_iter().map(|c| (c.id, c)).collect();

        let mut out = Vec::new();
        for s in scored {
            let Some(chunk) = by_id.get(&s.id) else { continue };
            let source_file = self.file_path_for(chunk.file_id).await.unwrap_or_default();
            out.push(Hit {
                text: chunk.text.clone(),
                score: s.score,
                source_file,
                matched_tags: fusion.map(|f| f.matched_tags.clone()),
                tag_match_count: fusion.map(|f| f.matched_tags.len()),
                reranked: false,
            });
        }
        Ok(out)
    }

    async fn file_path_for(&self, file_id: i64) -> Option<String> {
        self.store
            .query(move |conn| {
                conn.query_row("SELECT path FROM files WHERE id = ?1", rusqlite::params![file_id], |r| r.get(0))
                    .map_err(crate::error::KbeError::from)
            })
            .await
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ann::AnnIndex;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct MockEmbedder {
        dim: usize,
    }

    #[async_trait]
    impl EmbeddingProvider for MockEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Option<crate::types::Vector>>> {
            Ok(texts.iter().map(|_| Some(vec![1.0; self.dim])).collect())
        }
        fn dim(&self) -> usize {
            self.dim
        }
    }

    async fn build_retriever(dim: usize) -> (Retriever, Arc<SqliteStore>, Arc<IndexRegistry>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(&dir.path().join("kb.sqlite")).unwrap());
        let registry = Arc::new(IndexRegistry::new(dir.path().to_path_buf(), dim));
        let graph = Arc::new(TagGraph::default());
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(MockEmbedder { dim });
        let reranker = Arc::new(Reranker::new(crate::config::RerankerConfig::default()).unwrap());
        let config = RetrievalConfig { embedding_dim: dim, ..RetrievalConfig::default() };
        let retriever = Retriever::new(store.clone(), registry.clone(), graph, embedder, reranker, config);
        (retriever, store, registry, dir)
    }

    #[tokio::test]
    async fn search_vector_returns_single_hit_for_single_file() {
        let (retriever, store, registry, _dir) = build_retriever(8).await;

        let f = store.upsert_file("diaryA".into(), "a.md".into(), "h1".into(), 1).await.unwrap();
        let chunk_ids = store
            .transaction(move |conn| SqliteStore::replace_chunks(conn, f.id, &[(0, "alpha bravo".into(), 2, None)]))
            .await
            .unwrap();

        let vector = vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        registry
            .apply_updates("diaryA", &store, &[(chunk_ids[0], vector.clone())], &[])
            .await
            .unwrap();

        let hits = retriever.search_vector(None, &vector, 5, 0.0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].source_file.ends_with("a.md"));
        assert!(hits[0].score >= 0.99);
    }

    #[tokio::test]
    async fn search_hybrid_ranks_overlapping_terms_above_unrelated() {
        let (retriever, store, registry, _dir) = build_retriever(4).await;

        let f = store.upsert_file("diaryA".into(), "a.md".into(), "h1".into(), 1).await.unwrap();
        let texts: Vec<(i32, String, usize, Option<Vec<f32>>)> = vec![
            (0, "the quick brown fox".to_string(), 4usize, None),
            (1, "quick foxes jump".to_string(), 3, None),
            (2, "unrelated content about nothing".to_string(), 4, None),
        ];
        let chunk_ids = store
            .transaction(move |conn| SqliteStore::replace_chunks(conn, f.id, &texts))
            .await
            .unwrap();

        for id in &chunk_ids {
            registry.apply_updates("diaryA", &store, &[(*id, vec![1.0, 0.0, 0.0, 0.0])], &[]).await.unwrap();
        }

        let opts = HybridSearchOptions::default();
        let hits = retriever.search_hybrid(None, "quick fox", 3, &opts).await.unwrap();
        assert!(!hits.is_empty());
        let unrelated_rank = hits.iter().position(|h| h.text.contains("unrelated"));
        if let Some(pos) = unrelated_rank {
            assert_eq!(pos, hits.len() - 1);
        }
    }
}
