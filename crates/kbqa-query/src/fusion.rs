//! Reciprocal Rank Fusion (RRF) for combining keyword and vector results.
//!
//! RRF score = Σ 1 / (k + rank) over every list a chunk appears in, with
//! 1-based ranks. Only positions matter, so the incomparable BM25 and
//! similarity scales never need normalizing.

use std::cmp::Ordering;
use std::collections::HashMap;

use tracing::{debug, instrument};

use kbqa_core::{ChunkId, EngineError, FusedResult, Result, RetrievalMethod, ScoredHit, SourceMethods};

/// Fuse keyword and vector hit lists.
///
/// Both inputs must already be in descending relevance order; a chunk's
/// rank is its 1-based position. A chunk repeated within one list keeps
/// its first (best) position.
///
/// Output is ordered by fused score descending, then by number of
/// contributing methods, then by lowest rank in any source, then chunk id.
#[instrument(
    skip(keyword, vector),
    fields(keyword_count = keyword.len(), vector_count = vector.len())
)]
pub fn fuse(keyword: &[ScoredHit], vector: &[ScoredHit], k: f64) -> Result<Vec<FusedResult>> {
    if !k.is_finite() || k <= 0.0 {
        return Err(EngineError::invalid_argument(format!(
            "rrf k must be > 0, got {}",
            k
        )));
    }

    let mut fused: HashMap<ChunkId, FusedResult> =
        HashMap::with_capacity(keyword.len() + vector.len());

    for (method, hits) in [
        (RetrievalMethod::Keyword, keyword),
        (RetrievalMethod::Vector, vector),
    ] {
        for (i, hit) in hits.iter().enumerate() {
            let rank = i as u32 + 1;
            let result = fused.entry(hit.chunk_id.clone()).or_insert_with(|| FusedResult {
                chunk_id: hit.chunk_id.clone(),
                fused_score: 0.0,
                source_methods: SourceMethods::default(),
                keyword_rank: None,
                vector_rank: None,
                rerank_score: None,
            });
            if result.source_methods.contains(method) {
                continue;
            }
            result.source_methods.insert(method);
            result.fused_score += 1.0 / (k + f64::from(rank));
            match method {
                RetrievalMethod::Keyword => result.keyword_rank = Some(rank),
                RetrievalMethod::Vector => result.vector_rank = Some(rank),
            }
        }
    }

    let mut results: Vec<FusedResult> = fused.into_values().collect();
    results.sort_by(compare_fused);

    debug!(
        "Fused {} keyword + {} vector hits into {} results ({} in both)",
        keyword.len(),
        vector.len(),
        results.len(),
        results.iter().filter(|r| r.source_methods.count() == 2).count()
    );

    Ok(results)
}

/// Deterministic fused ordering.
pub fn compare_fused(a: &FusedResult, b: &FusedResult) -> Ordering {
    b.fused_score
        .total_cmp(&a.fused_score)
        .then_with(|| b.source_methods.count().cmp(&a.source_methods.count()))
        .then_with(|| a.min_rank().cmp(&b.min_rank()))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}
