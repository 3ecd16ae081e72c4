//! kbqa-index - Retrieval sources
//!
//! This crate provides the two independently scored retrieval methods the
//! engine fuses: an in-process BM25 keyword index and a client for an
//! external vector similarity store.
//!
//! # Features
//!
//! - BM25 scoring with configurable `k1` / `b`
//! - Copy-on-write snapshots so index mutation never blocks searches
//! - Deterministic tie-breaking (ordinal, then chunk id)
//! - Vector client with per-attempt timeout, bounded retry, and circuit breaker

mod breaker;
mod keyword;
pub mod tokenize;
mod vector;

pub use breaker::{CircuitBreaker, CircuitState};
pub use keyword::{KeywordIndex, KeywordSnapshot};
pub use vector::VectorIndex;

// Re-export for convenience
pub use kbqa_core::{ScoredHit, VectorBackend, VectorMatch};
