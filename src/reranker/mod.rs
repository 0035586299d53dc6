//! Optional cross-encoder reranking via an external HTTP service.
//!
//! Rerank failures never fail the search: a failed batch keeps its
//! pre-rerank score and is marked so callers can tell the difference.

use serde::Deserialize;
use serde::Serialize;

use crate::config::RerankerConfig;
use crate::error::KbeError;
use crate::error::Result;

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

/// Outcome of reranking one batch of documents.
pub struct RerankOutcome {
    /// `(document_index, relevance_score)`, present only for documents the
    /// service actually scored.
    pub scores: Vec<(usize, f32)>,
    pub failed: bool,
}

pub struct Reranker {
    client: reqwest::Client,
    config: RerankerConfig,
}

impl Reranker {
    pub fn new(config: RerankerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| KbeError::Configuration {
                field: "reranker".into(),
                cause: e.to_string(),
            })?;
        Ok(Self { client, config })
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled()
    }

    /// Rerank `documents` against `query`. On any failure the batch is
    /// marked `failed` and its documents keep their incoming order/score.
    pub async fn rerank(&self, query: &str, documents: &[String]) -> RerankOutcome {
        let Some(url) = &self.config.rerank_url else {
            return RerankOutcome { scores: Vec::new(), failed: true };
        };

        let body = RerankRequest {
            model: &self.config.model,
            query,
            documents,
            top_n: self.config.top_n.min(documents.len()),
        };

        let mut req = self.client.post(format!("{url}/v1/rerank")).json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<RerankResponse>().await {
                Ok(parsed) => RerankOutcome {
                    scores: parsed.results.into_iter().map(|r| (r.index, r.relevance_score)).collect(),
                    failed: false,
                },
                Err(e) => {
                    tracing::warn!(error = %e, "rerank response parse failed, keeping pre-rerank order");
                    RerankOutcome { scores: Vec::new(), failed: true }
                }
            },
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "rerank request failed, keeping pre-rerank order");
                RerankOutcome { scores: Vec::new(), failed: true }
            }
            Err(e) => {
                tracing::warn!(error = %e, "rerank request errored, keeping pre-rerank order");
                RerankOutcome { scores: Vec::new(), failed: true }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_reranker_reports_not_enabled() {
        let reranker = Reranker::new(RerankerConfig::default()).unwrap();
        assert!(!reranker.enabled());
    }
}
