//! HTTP-backed embedding provider.
//!
//! Oversize-input policy: tokens beyond `safe_token_fraction * max_tokens`
//! are never sent to the service; such inputs are filtered out up front
//! and come back as `None` in the result vector. This is the
//! skip-and-filter choice for the engine's oversize-input open question
//! (the alternative, zero-filling, would silently plant a meaningless
//! vector into every downstream index).
pub const OVERSIZE_POLICY: &str = "skip-and-filter";

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::config::EmbedderConfig;
use crate::embedder::pack_batches;
use crate::embedder::EmbeddingProvider;
use crate::error::KbeError;
use crate::error::Result;
use crate::types::Vector;

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

pub struct HttpEmbedder {
    client: reqwest::Client,
    config: EmbedderConfig,
    dim: usize,
    tokenizer: tiktoken_rs::CoreBPE,
}

impl HttpEmbedder {
    pub fn new(config: EmbedderConfig, dim: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| KbeError::Configuration {
                field: "embedder".into(),
                cause: e.to_string(),
            })?;
        let tokenizer = tiktoken_rs::cl100k_base().map_err(|e| KbeError::Configuration {
            field: "embedder.tokenizer".into(),
            cause: e.to_string(),
        })?;
        Ok(Self { client, config, dim, tokenizer })
    }

    fn token_count(&self, text: &str) -> usize {
        self.tokenizer.encode_with_special_tokens(text).len()
    }

    async fn post_batch(&self, texts: &[String]) -> Result<Vec<Vector>> {
        let safe_limit = (self.config.max_tokens_per_batch as f32 * self.config.safe_token_fraction) as usize;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let body = EmbeddingRequest {
                model: &self.config.model,
                input: texts,
            };
            let mut req = self.client.post(format!("{}/v1/embeddings", self.config.api_url)).json(&body);
            if let Some(key) = &self.config.api_key {
                req = req.bearer_auth(key);
            }

            let result = req.send().await;
            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let parsed: EmbeddingResponse = resp.json().await.map_err(|e| KbeError::EmbeddingFailed {
                            cause: format!("invalid response body: {e}"),
                        })?;
                        let mut data = parsed.data;
                        // Response may arrive unsorted; callers must sort by index.
                        data.sort_by_key(|d| d.index);
                        return Ok(data.into_iter().map(|d| d.embedding).collect());
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        if attempt >= self.config.retry_attempts {
                            return Err(KbeError::EmbeddingFailed {
                                cause: format!("exhausted retries, last status {status}"),
                            });
                        }
                        let backoff = if status.as_u16() == 429 {
                            Duration::from_secs(5 * attempt as u64)
                        } else {
                            Duration::from_millis(self.config.base_backoff_ms * 2u64.pow(attempt - 1))
                        };
                        tracing::warn!(status = %status, attempt, "embedding request retryable failure, backing off");
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    return Err(KbeError::EmbeddingFailed {
                        cause: format!("non-retryable status {status}"),
                    });
                }
                Err(e) => {
                    if attempt >= self.config.retry_attempts {
                        return Err(KbeError::EmbeddingFailed {
                            cause: format!("exhausted retries: {e}"),
                        });
                    }
                    let backoff = Duration::from_millis(self.config.base_backoff_ms * 2u64.pow(attempt - 1));
                    tracing::warn!(error = %e, attempt, "embedding request network failure, backing off");
                    tokio::time::sleep(backoff).await;
                }
            }
            let _ = safe_limit;
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Option<Vector>>> {
        let token_counts: Vec<usize> = texts.iter().map(|t| self.token_count(t)).collect();
        let safe_limit = (self.config.max_tokens_per_batch as f32 * self.config.safe_token_fraction) as usize;

        // Drop-and-mark inputs that can never fit in any batch.
        let mut kept_indices = Vec::new();
        let mut kept_texts = Vec::new();
        let mut kept_token_counts = Vec::new();
        for (i, (text, &tokens)) in texts.iter().zip(token_counts.iter()).enumerate() {
            if tokens > safe_limit {
                tracing::warn!(index = i, tokens, safe_limit, "dropping oversize input before embedding");
                continue;
            }
            kept_indices.push(i);
            kept_texts.push(text.clone());
            kept_token_counts.push(tokens);
        }

        let batches = pack_batches(&kept_token_counts, self.config.max_tokens_per_batch, self.config.max_items_per_batch);

        // Preallocated per-input output slot, flattened preserving global order.
        let mut out: Vec<Option<Vector>> = vec![None; texts.len()];

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let cursor = Arc::new(AtomicUsize::new(0));
        let batches = Arc::new(batches);

        let mut handles = Vec::new();
        for _ in 0..self.config.concurrency.min(batches.len().max(1)) {
            let semaphore = semaphore.clone();
            let cursor = cursor.clone();
            let batches = batches.clone();
            let kept_texts = kept_texts.clone();
            let kept_indices = kept_indices.clone();
            // Work-stealing: each worker pulls the next unclaimed batch index
            // from a shared cursor rather than owning a static partition.
            handles.push(self.spawn_worker(semaphore, cursor, batches, kept_texts, kept_indices));
        }

        let mut results: Vec<(usize, Vector)> = Vec::new();
        for handle in handles {
            let partial = handle.await?;
            results.extend(partial);
        }

        for (original_index, vector) in results {
            out[original_index] = Some(vector);
        }
        Ok(out)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

impl HttpEmbedder {
    #[allow(clippy::too_many_arguments)]
    fn spawn_worker(
        &self,
        semaphore: Arc<Semaphore>,
        cursor: Arc<AtomicUsize>,
        batches: Arc<Vec<Vec<usize>>>,
        kept_texts: Vec<String>,
        kept_indices: Vec<usize>,
    ) -> tokio::task::JoinHandle<Result<Vec<(usize, Vector)>>> {
        let client = self.client.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let embedder = HttpEmbedder {
                client,
                config,
                dim: 0,
                tokenizer: tiktoken_rs::cl100k_base().expect("tokenizer init"),
            };
            let mut out = Vec::new();
            loop {
                let batch_idx = cursor.fetch_add(1, Ordering::SeqCst);
                if batch_idx >= batches.len() {
                    break;
                }
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let batch = &batches[batch_idx];
                let texts: Vec<String> = batch.iter().map(|&i| kept_texts[i].clone()).collect();
                let vectors = embedder.post_batch(&texts).await?;
                for (local_i, vector) in batch.iter().zip(vectors.into_iter()) {
                    out.push((kept_indices[*local_i], vector));
                }
            }
            Ok(out)
        })
    }
}

impl From<tokio::task::JoinError> for KbeError {
    fn from(e: tokio::task::JoinError) -> Self {
        KbeError::EmbeddingFailed {
            cause: format!("embedding worker panicked: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversize_policy_is_skip_and_filter() {
        assert_eq!(OVERSIZE_POLICY, "skip-and-filter");
    }
}
