//! kbqa-embed - Embedding models
//!
//! Provides [`HashEmbedder`], a dependency-free stand-in for a hosted
//! embedding model: texts sharing terms get similar vectors, and identical
//! texts always get identical vectors.

mod hash;

pub use hash::HashEmbedder;

// Re-export the Embedder trait for convenience
pub use kbqa_core::Embedder;
