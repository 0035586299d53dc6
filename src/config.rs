//! Configuration for the knowledge-base engine.
//!
//! Every field carries a `#[serde(default = "...")]` function so that a
//! partial TOML file and `Default::default()` agree on the same values.
//! Loading precedence is: explicit path argument, then
//! `{workdir}/.kbe/config.toml`, then `~/.kbe/config.toml`, then built-in
//! defaults.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::KbeError;
use crate::error::Result;

fn default_data_dir() -> PathBuf {
    PathBuf::from(".kbe")
}

fn default_embedding_dim() -> usize {
    1536
}

fn default_api_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_max_tokens_per_batch() -> usize {
    8192
}

fn default_max_items_per_batch() -> usize {
    100
}

fn default_concurrency() -> usize {
    5
}

fn default_safe_token_fraction() -> f32 {
    0.85
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_embedder_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbedderConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens_per_batch")]
    pub max_tokens_per_batch: usize,
    #[serde(default = "default_max_items_per_batch")]
    pub max_items_per_batch: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_safe_token_fraction")]
    pub safe_token_fraction: f32,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_embedder_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: None,
            model: default_model(),
            max_tokens_per_batch: default_max_tokens_per_batch(),
            max_items_per_batch: default_max_items_per_batch(),
            concurrency: default_concurrency(),
            safe_token_fraction: default_safe_token_fraction(),
            retry_attempts: default_retry_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            timeout_secs: default_embedder_timeout_secs(),
        }
    }
}

impl EmbedderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.api_url.is_empty() {
            return Err(KbeError::Configuration {
                field: "embedder.api_url".into(),
                cause: "must not be empty".into(),
            });
        }
        if self.max_items_per_batch == 0 {
            return Err(KbeError::Configuration {
                field: "embedder.max_items_per_batch".into(),
                cause: "must be > 0".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.safe_token_fraction) {
            return Err(KbeError::Configuration {
                field: "embedder.safe_token_fraction".into(),
                cause: "must be in [0, 1]".into(),
            });
        }
        Ok(())
    }
}

fn default_rerank_url() -> Option<String> {
    None
}

fn default_reranker_timeout_secs() -> u64 {
    30
}

fn default_rerank_top_n() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RerankerConfig {
    #[serde(default = "default_rerank_url")]
    pub rerank_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_reranker_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_rerank_top_n")]
    pub top_n: usize,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            rerank_url: default_rerank_url(),
            api_key: None,
            model: default_model(),
            timeout_secs: default_reranker_timeout_secs(),
            top_n: default_rerank_top_n(),
        }
    }
}

impl RerankerConfig {
    pub fn enabled(&self) -> bool {
        self.rerank_url.is_some()
    }
}

fn default_batch_window_ms() -> u64 {
    2000
}

fn default_max_batch_size() -> usize {
    50
}

fn default_full_scan_on_startup() -> bool {
    true
}

fn default_ignore_folders() -> Vec<String> {
    vec![".git".into(), ".kbe".into(), "node_modules".into(), "target".into()]
}

fn default_ignore_prefixes() -> Vec<String> {
    vec![".".into()]
}

fn default_ignore_suffixes() -> Vec<String> {
    vec![".tmp".into(), ".swp".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestionConfig {
    pub root_path: PathBuf,
    #[serde(default = "default_ignore_folders")]
    pub ignore_folders: Vec<String>,
    #[serde(default = "default_ignore_prefixes")]
    pub ignore_prefixes: Vec<String>,
    #[serde(default = "default_ignore_suffixes")]
    pub ignore_suffixes: Vec<String>,
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_full_scan_on_startup")]
    pub full_scan_on_startup: bool,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("."),
            ignore_folders: default_ignore_folders(),
            ignore_prefixes: default_ignore_prefixes(),
            ignore_suffixes: default_ignore_suffixes(),
            batch_window_ms: default_batch_window_ms(),
            max_batch_size: default_max_batch_size(),
            full_scan_on_startup: default_full_scan_on_startup(),
        }
    }
}

impl IngestionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(KbeError::Configuration {
                field: "ingestion.max_batch_size".into(),
                cause: "must be > 0".into(),
            });
        }
        Ok(())
    }
}

fn default_tag_expand_max_count() -> usize {
    30
}

fn default_chunk_max_tokens() -> usize {
    512
}

fn default_save_debounce_secs() -> u64 {
    60
}

fn default_hybrid_bm25_k1() -> f32 {
    1.5
}

fn default_hybrid_bm25_b() -> f32 {
    0.75
}

fn default_hybrid_bm25_weight() -> f32 {
    0.6
}

fn default_hybrid_vec_weight() -> f32 {
    0.4
}

fn default_hybrid_candidate_multiplier() -> usize {
    3
}

pub fn default_stopwords() -> Vec<String> {
    [
        "a", "an", "the", "is", "are", "was", "were", "be", "been", "of", "to", "in", "on", "at",
        "for", "and", "or", "but", "with", "as", "by", "it", "this", "that", "these", "those",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
    #[serde(default = "default_tag_expand_max_count")]
    pub tag_expand_max_count: usize,
    #[serde(default = "default_chunk_max_tokens")]
    pub chunk_max_tokens: usize,
    #[serde(default = "default_save_debounce_secs")]
    pub save_debounce_secs: u64,
    #[serde(default = "default_hybrid_bm25_k1")]
    pub bm25_k1: f32,
    #[serde(default = "default_hybrid_bm25_b")]
    pub bm25_b: f32,
    #[serde(default = "default_hybrid_bm25_weight")]
    pub hybrid_bm25_weight: f32,
    #[serde(default = "default_hybrid_vec_weight")]
    pub hybrid_vec_weight: f32,
    #[serde(default = "default_hybrid_candidate_multiplier")]
    pub hybrid_candidate_multiplier: usize,
    /// Words excluded from BM25 tokenization. Lowercase; matched after
    /// the candidate text is itself lowercased.
    #[serde(default = "default_stopwords")]
    pub stopwords: Vec<String>,
    #[serde(default)]
    pub embedder: EmbedderConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            embedding_dim: default_embedding_dim(),
            tag_expand_max_count: default_tag_expand_max_count(),
            chunk_max_tokens: default_chunk_max_tokens(),
            save_debounce_secs: default_save_debounce_secs(),
            bm25_k1: default_hybrid_bm25_k1(),
            bm25_b: default_hybrid_bm25_b(),
            hybrid_bm25_weight: default_hybrid_bm25_weight(),
            hybrid_vec_weight: default_hybrid_vec_weight(),
            hybrid_candidate_multiplier: default_hybrid_candidate_multiplier(),
            stopwords: default_stopwords(),
            embedder: EmbedderConfig::default(),
            reranker: RerankerConfig::default(),
            ingestion: IngestionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigWarning {
    WeightsDontSumToOne(f32),
    EmbeddingDimUnusual(usize),
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::WeightsDontSumToOne(sum) => {
                write!(f, "hybrid_bm25_weight + hybrid_vec_weight = {sum}, expected 1.0")
            }
            ConfigWarning::EmbeddingDimUnusual(d) => {
                write!(f, "embedding_dim {d} is unusually small or large")
            }
        }
    }
}

impl RetrievalConfig {
    /// Hard-fail validation, called from `KnowledgeBase::open`. Per spec,
    /// configuration errors are the only error kind allowed to surface at
    /// open time.
    pub fn validate(&self) -> Result<()> {
        if self.embedding_dim == 0 {
            return Err(KbeError::Configuration {
                field: "embedding_dim".into(),
                cause: "must be > 0".into(),
            });
        }
        self.embedder.validate()?;
        self.ingestion.validate()?;
        Ok(())
    }

    /// Soft, informational checks surfaced to the caller at open time but
    /// never fatal.
    pub fn warnings(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let sum = self.hybrid_bm25_weight + self.hybrid_vec_weight;
        if (sum - 1.0).abs() > 1e-3 {
            warnings.push(ConfigWarning::WeightsDontSumToOne(sum));
        }
        if self.embedding_dim < 8 || self.embedding_dim > 8192 {
            warnings.push(ConfigWarning::EmbeddingDimUnusual(self.embedding_dim));
        }
        warnings
    }

    /// Load precedence: explicit path, then `{workdir}/.kbe/config.toml`,
    /// then `~/.kbe/config.toml`, then defaults.
    pub fn load(explicit_path: Option<&Path>, workdir: &Path) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load_from_file(path);
        }
        let project = workdir.join(".kbe").join("config.toml");
        if project.exists() {
            return Self::load_from_file(&project);
        }
        if let Some(home) = dirs_home() {
            let global = home.join(".kbe").join("config.toml");
            if global.exists() {
                return Self::load_from_file(&global);
            }
        }
        Ok(Self::default())
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| KbeError::ConfigParse {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;
        let config: RetrievalConfig = toml::from_str(&content).map_err(|e| KbeError::ConfigParse {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;
        Ok(config)
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_passes_validation() {
        RetrievalConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_embedding_dim_rejected() {
        let mut c = RetrievalConfig::default();
        c.embedding_dim = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let toml_str = r#"
            [embedder]
            model = "custom-model"
        "#;
        let config: RetrievalConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.embedder.model, "custom-model");
        assert_eq!(config.embedder.max_items_per_batch, default_max_items_per_batch());
        assert_eq!(config.tag_expand_max_count, default_tag_expand_max_count());
    }

    #[test]
    fn unbalanced_weights_warn_but_do_not_fail() {
        let mut c = RetrievalConfig::default();
        c.hybrid_bm25_weight = 0.9;
        c.hybrid_vec_weight = 0.9;
        assert!(c.validate().is_ok());
        assert!(!c.warnings().is_empty());
    }
}
