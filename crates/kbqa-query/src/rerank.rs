//! Lexical-overlap reranking of fused results.

use std::collections::BTreeSet;

use tracing::debug;

use kbqa_core::{ChunkId, EngineError, FusedResult, RerankBlend, RerankConfig, Result};
use kbqa_index::tokenize::unique_terms;

use crate::fusion::compare_fused;

/// Reranks fused results by the fraction of query terms each chunk contains.
///
/// The combined score is monotonic in both the fused score and the overlap:
///
/// - multiplicative: `fused * (1 + weight * overlap)`
/// - additive: `fused + weight * overlap / (rrf_k + 1)`
///
/// The additive form scales overlap by the largest possible single-list RRF
/// contribution so both terms live on the same scale.
#[derive(Debug, Clone)]
pub struct LexicalReranker {
    weight: f64,
    blend: RerankBlend,
    rrf_k: f64,
}

impl LexicalReranker {
    pub fn new(config: &RerankConfig, rrf_k: f64) -> Result<Self> {
        if !config.weight.is_finite() || config.weight < 0.0 {
            return Err(EngineError::invalid_argument(format!(
                "rerank weight must be >= 0, got {}",
                config.weight
            )));
        }
        if !rrf_k.is_finite() || rrf_k <= 0.0 {
            return Err(EngineError::invalid_argument(format!(
                "rrf k must be > 0, got {}",
                rrf_k
            )));
        }
        Ok(Self {
            weight: config.weight,
            blend: config.blend,
            rrf_k,
        })
    }

    /// Combine a fused score with an overlap fraction in `[0, 1]`.
    pub fn combine(&self, fused: f64, overlap: f64) -> f64 {
        match self.blend {
            RerankBlend::Multiplicative => fused * (1.0 + self.weight * overlap),
            RerankBlend::Additive => fused + self.weight * overlap / (self.rrf_k + 1.0),
        }
    }

    /// Reorder `results` for `query` and keep the best `top_n`.
    ///
    /// `text_of` resolves a chunk id to its text; unresolved chunks get
    /// zero overlap.
    pub fn rerank<'a, F>(
        &self,
        query: &str,
        mut results: Vec<FusedResult>,
        top_n: usize,
        text_of: F,
    ) -> Result<Vec<FusedResult>>
    where
        F: Fn(&ChunkId) -> Option<&'a str>,
    {
        if top_n == 0 {
            return Err(EngineError::invalid_argument("top_n must be >= 1"));
        }

        let query_terms = unique_terms(query);
        for result in &mut results {
            let overlap = text_of(&result.chunk_id)
                .map(|text| overlap(&query_terms, text))
                .unwrap_or(0.0);
            result.rerank_score = Some(self.combine(result.fused_score, overlap));
        }

        results.sort_by(|a, b| {
            b.final_score()
                .total_cmp(&a.final_score())
                .then_with(|| compare_fused(a, b))
        });
        results.truncate(top_n);

        debug!(
            "Reranked with {} query terms, kept {}",
            query_terms.len(),
            results.len()
        );
        Ok(results)
    }
}

/// Fraction of distinct query terms present in `text`.
pub fn overlap(query_terms: &BTreeSet<String>, text: &str) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let chunk_terms = unique_terms(text);
    let present = query_terms.intersection(&chunk_terms).count();
    present as f64 / query_terms.len() as f64
}
