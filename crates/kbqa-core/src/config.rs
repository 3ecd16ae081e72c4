//! Configuration types for the retrieval engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{EngineError, Result};

/// Main configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Keyword (BM25) scoring.
    #[serde(default)]
    pub keyword: KeywordConfig,

    /// Vector store client policy.
    #[serde(default)]
    pub vector: VectorConfig,

    /// Reciprocal rank fusion.
    #[serde(default)]
    pub fusion: FusionConfig,

    /// Lexical reranking.
    #[serde(default)]
    pub rerank: RerankConfig,

    /// Result cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Answer generation.
    #[serde(default)]
    pub answer: AnswerConfig,

    /// Query limits.
    #[serde(default)]
    pub query: QueryConfig,
}

/// BM25 parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordConfig {
    /// Term-frequency saturation.
    #[serde(default = "default_k1")]
    pub k1: f64,

    /// Length normalization (0 = none, 1 = full).
    #[serde(default = "default_b")]
    pub b: f64,
}

impl Default for KeywordConfig {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// Similarity metric of the external vector store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    DotProduct,
}

/// Vector store client policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    /// Per-attempt timeout in milliseconds.
    #[serde(default = "default_vector_timeout")]
    pub timeout_ms: u64,

    /// Retries after the first failed attempt.
    #[serde(default = "default_vector_retries")]
    pub max_retries: u32,

    /// Backoff between attempts, multiplied by the attempt number.
    #[serde(default = "default_vector_backoff")]
    pub retry_backoff_ms: u64,

    /// Consecutive failed calls before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open circuit short-circuits calls.
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,

    /// Metric documented for the configured store.
    #[serde(default)]
    pub metric: SimilarityMetric,

    /// Matches must score strictly above this to count as hits.
    #[serde(default)]
    pub min_score: f32,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            max_retries: 2,
            retry_backoff_ms: 100,
            failure_threshold: 5,
            cooldown_ms: 30_000,
            metric: SimilarityMetric::Cosine,
            min_score: 0.0,
        }
    }
}

/// Reciprocal rank fusion parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// RRF smoothing constant k.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,

    /// Candidates fetched per source = top_k * multiplier.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,

    /// Lower bound on candidates fetched per source.
    #[serde(default = "default_min_candidates")]
    pub min_candidates: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            candidate_multiplier: 2,
            min_candidates: 20,
        }
    }
}

impl FusionConfig {
    /// How many hits to request from each source for a final `top_k`.
    pub fn fetch_count(&self, top_k: usize) -> usize {
        top_k
            .saturating_mul(self.candidate_multiplier.max(1))
            .max(self.min_candidates)
            .max(top_k)
    }
}

/// How the lexical overlap signal is combined with the fused score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankBlend {
    /// `fused * (1 + weight * overlap)`
    #[default]
    Multiplicative,
    /// `fused + weight * overlap / (rrf_k + 1)`
    Additive,
}

/// Lexical reranking parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    /// Run the reranker at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Weight of the overlap signal.
    #[serde(default = "default_rerank_weight")]
    pub weight: f64,

    /// Blend mode.
    #[serde(default)]
    pub blend: RerankBlend,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weight: 0.5,
            blend: RerankBlend::Multiplicative,
        }
    }
}

/// Result cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Use the cache at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of entries.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Default time to live in seconds.
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,

    /// Interval between maintenance passes in seconds.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    /// SQLite file for the write-through backing store.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 1000,
            default_ttl_secs: 3600,
            maintenance_interval_secs: 300,
            path: None,
        }
    }
}

/// Answer generation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerConfig {
    /// Retries after the first failed generation.
    #[serde(default = "default_answer_retries")]
    pub max_retries: u32,

    /// Backoff between attempts, multiplied by the attempt number.
    #[serde(default = "default_answer_backoff")]
    pub retry_backoff_ms: u64,

    /// Passages supplied to the generator.
    #[serde(default = "default_context_chunks")]
    pub context_chunks: usize,

    /// Per-attempt timeout in milliseconds.
    #[serde(default = "default_answer_timeout")]
    pub timeout_ms: u64,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_backoff_ms: 250,
            context_chunks: 5,
            timeout_ms: 30_000,
        }
    }
}

/// Query limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Default number of results.
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    /// Maximum number of results.
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,

    /// Bound on each sub-search, in milliseconds.
    #[serde(default = "default_sub_search_timeout")]
    pub sub_search_timeout_ms: u64,

    /// Queries allowed in flight at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            max_top_k: 100,
            sub_search_timeout_ms: 3000,
            max_concurrent: 10,
        }
    }
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_k1() -> f64 {
    1.2
}

fn default_b() -> f64 {
    0.75
}

fn default_vector_timeout() -> u64 {
    2000
}

fn default_vector_retries() -> u32 {
    2
}

fn default_vector_backoff() -> u64 {
    100
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> u64 {
    30_000
}

fn default_rrf_k() -> f64 {
    60.0
}

fn default_candidate_multiplier() -> usize {
    2
}

fn default_min_candidates() -> usize {
    20
}

fn default_rerank_weight() -> f64 {
    0.5
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_maintenance_interval() -> u64 {
    300
}

fn default_answer_retries() -> u32 {
    2
}

fn default_answer_backoff() -> u64 {
    250
}

fn default_context_chunks() -> usize {
    5
}

fn default_answer_timeout() -> u64 {
    30_000
}

fn default_top_k() -> usize {
    10
}

fn default_max_top_k() -> usize {
    100
}

fn default_sub_search_timeout() -> u64 {
    3000
}

fn default_max_concurrent() -> usize {
    10
}

impl EngineConfig {
    /// Load configuration from file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| EngineError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default paths.
    pub fn load_default() -> Result<Self> {
        // Try user config first
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("kbqa").join("config.toml");
            if user_config.exists() {
                return Self::load(&user_config);
            }
        }

        // Try local config
        let local_config = PathBuf::from("kbqa.toml");
        if local_config.exists() {
            return Self::load(&local_config);
        }

        Ok(Self::default())
    }

    /// Reject parameter combinations the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        let k = &self.keyword;
        if !k.k1.is_finite() || k.k1 < 0.0 {
            return Err(EngineError::config(format!("keyword.k1 must be >= 0, got {}", k.k1)));
        }
        if !(0.0..=1.0).contains(&k.b) {
            return Err(EngineError::config(format!("keyword.b must be in [0, 1], got {}", k.b)));
        }
        if !self.fusion.rrf_k.is_finite() || self.fusion.rrf_k <= 0.0 {
            return Err(EngineError::config(format!(
                "fusion.rrf_k must be > 0, got {}",
                self.fusion.rrf_k
            )));
        }
        if !self.rerank.weight.is_finite() || self.rerank.weight < 0.0 {
            return Err(EngineError::config(format!(
                "rerank.weight must be >= 0, got {}",
                self.rerank.weight
            )));
        }
        if self.cache.capacity == 0 {
            return Err(EngineError::config("cache.capacity must be > 0"));
        }
        if self.cache.default_ttl_secs == 0 {
            return Err(EngineError::config("cache.default_ttl_secs must be > 0"));
        }
        let q = &self.query;
        if q.default_top_k == 0 || q.max_top_k == 0 || q.default_top_k > q.max_top_k {
            return Err(EngineError::config(format!(
                "query top-k bounds invalid: default {} max {}",
                q.default_top_k, q.max_top_k
            )));
        }
        if q.max_concurrent == 0 {
            return Err(EngineError::config("query.max_concurrent must be > 0"));
        }
        if !self.vector.min_score.is_finite() {
            return Err(EngineError::config("vector.min_score must be finite"));
        }
        if self.vector.failure_threshold == 0 {
            return Err(EngineError::config("vector.failure_threshold must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.query.default_top_k, 10);
        assert_eq!(config.fusion.rrf_k, 60.0);
        assert!(config.rerank.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            [keyword]
            k1 = 1.5

            [cache]
            capacity = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.keyword.k1, 1.5);
        assert_eq!(config.keyword.b, 0.75);
        assert_eq!(config.cache.capacity, 8);
        assert_eq!(config.cache.default_ttl_secs, 3600);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.fusion.rrf_k = 0.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.keyword.b = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.cache.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.vector.min_score = f32::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fetch_count() {
        let fusion = FusionConfig::default();
        assert_eq!(fusion.fetch_count(5), 20);
        assert_eq!(fusion.fetch_count(50), 100);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[rerank]\nenabled = false\n\n[vector]\nmin_score = 0.2\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert!(!config.rerank.enabled);
        assert_eq!(config.vector.min_score, 0.2);
        assert_eq!(config.vector.max_retries, 2);
    }
}
