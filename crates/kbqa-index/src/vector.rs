//! Client for the external vector store.
//!
//! The store itself is reached through [`VectorBackend`]; this client owns
//! only the timeout, retry and circuit-breaker policy plus deterministic
//! ordering of what comes back.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use kbqa_core::{
    Chunk, Clock, DocumentId, EngineError, Result, ScoredHit, SearchFilter, VectorBackend,
    VectorConfig, VectorMatch,
};

use crate::breaker::{CircuitBreaker, CircuitState};

const COMPONENT: &str = "vector_store";

/// Vector search with bounded retry and degraded-mode signalling.
pub struct VectorIndex {
    backend: Arc<dyn VectorBackend>,
    config: VectorConfig,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
}

impl VectorIndex {
    pub fn new(backend: Arc<dyn VectorBackend>, config: VectorConfig, clock: Arc<dyn Clock>) -> Self {
        if backend.metric() != config.metric {
            warn!(
                "Vector backend {} reports {:?} but {:?} is configured; scores follow the backend",
                backend.name(),
                backend.metric(),
                config.metric
            );
        }
        let breaker = CircuitBreaker::new(config.failure_threshold, config.cooldown_ms);
        Self {
            backend,
            config,
            breaker,
            clock,
        }
    }

    /// Backend name.
    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// Current breaker state.
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state(self.clock.now_millis())
    }

    /// Nearest chunks to `vector`, best first.
    ///
    /// Fails with `Unavailable` or `Timeout` once retries are exhausted, or
    /// immediately with `Unavailable` while the circuit is open.
    pub async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredHit>> {
        if top_k == 0 {
            return Err(EngineError::invalid_argument("top_k must be >= 1"));
        }
        if vector.is_empty() || vector.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::invalid_argument(
                "query vector must be non-empty and finite",
            ));
        }

        if !self.breaker.allow(self.clock.now_millis()) {
            debug!("Vector search short-circuited: circuit open");
            return Err(EngineError::unavailable(COMPONENT, "circuit open"));
        }

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let mut attempt = 0u32;
        loop {
            let outcome = match tokio::time::timeout(timeout, self.backend.search(vector, top_k, filter))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(EngineError::timeout(COMPONENT, self.config.timeout_ms)),
            };

            match outcome {
                Ok(matches) => {
                    self.breaker.record_success();
                    let hits = rank_matches(matches, top_k, filter, self.config.min_score);
                    debug!("Vector search returned {} hits", hits.len());
                    return Ok(hits);
                }
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        "Vector search attempt {} failed: {}; retrying",
                        attempt, err
                    );
                    let backoff = self.config.retry_backoff_ms.saturating_mul(u64::from(attempt));
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(err) => {
                    if err.is_retryable() {
                        self.breaker.record_failure(self.clock.now_millis());
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Store the embedding of a chunk.
    pub async fn upsert(&self, chunk: &Chunk, embedding: Vec<f32>) -> Result<()> {
        self.backend.upsert(chunk, embedding).await
    }

    /// Drop every vector of a document.
    pub async fn remove_document(&self, document_id: &DocumentId) -> Result<usize> {
        self.backend.remove_document(document_id).await
    }

    /// Number of stored vectors.
    pub async fn len(&self) -> Result<usize> {
        self.backend.len().await
    }
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Order backend matches deterministically and assign 1-based ranks.
///
/// Scores at or below `min_score`, non-finite scores and out-of-scope
/// documents are dropped. Duplicate chunk ids keep their best occurrence.
fn rank_matches(
    mut matches: Vec<VectorMatch>,
    top_k: usize,
    filter: &SearchFilter,
    min_score: f32,
) -> Vec<ScoredHit> {
    matches.retain(|m| {
        m.score.is_finite() && m.score > min_score && filter.allows(&m.document_id)
    });
    matches.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.ordinal.cmp(&b.ordinal))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });

    let mut seen = HashSet::new();
    matches
        .into_iter()
        .filter(|m| seen.insert(m.chunk_id.clone()))
        .take(top_k)
        .enumerate()
        .map(|(i, m)| ScoredHit {
            chunk_id: m.chunk_id,
            score: m.score,
            rank: i as u32 + 1,
        })
        .collect()
}
