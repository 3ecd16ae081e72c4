//! kbqa-query - Hybrid retrieval orchestration
//!
//! This crate ties the retrieval sources and the result cache together:
//! queries are checked against the cache, dispatched to the keyword index and
//! the vector store concurrently, merged with Reciprocal Rank Fusion,
//! optionally reranked by lexical overlap, and memoized.
//!
//! # Example
//!
//! ```rust,ignore
//! use kbqa_query::{OrchestratorBuilder, QueryRequest};
//!
//! let engine = OrchestratorBuilder::new(config)
//!     .documents(store.clone())
//!     .embedder(Arc::new(HashEmbedder::new(256)))
//!     .vector_backend(Arc::new(InMemoryVectorStore::default()))
//!     .build()?;
//! engine.rebuild_indexes().await?;
//! let response = engine.query(QueryRequest::new("cache invalidation")).await?;
//! ```

mod fusion;
mod orchestrator;
mod request;
mod rerank;

pub use fusion::{compare_fused, fuse};
pub use orchestrator::{OrchestratorBuilder, RetrievalOrchestrator};
pub use request::{
    AnswerResponse, CacheOutcome, DegradedReason, QueryRequest, QueryResponse, ResponseStatus,
};
pub use rerank::{overlap, LexicalReranker};

// Re-export for convenience
pub use tokio_util::sync::CancellationToken;
