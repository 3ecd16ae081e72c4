//! kbqa-store - Storage collaborators
//!
//! This crate provides the stores the retrieval engine talks to:
//!
//! - [`InMemoryDocumentStore`]: owns documents, chunks, and the corpus
//!   version counter, and notifies change listeners synchronously
//! - [`InMemoryVectorStore`]: brute-force similarity search
//! - [`SqliteCacheBackend`]: durable write-through store for cache entries

mod documents;
mod schema;
mod sqlite;
mod vectors;

pub use documents::InMemoryDocumentStore;
pub use sqlite::SqliteCacheBackend;
pub use vectors::InMemoryVectorStore;

// Re-export schema for testing/migrations
pub use schema::{SCHEMA, SCHEMA_VERSION};
