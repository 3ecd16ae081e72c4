//! Core traits defining the interfaces to external collaborators.

use async_trait::async_trait;

use crate::config::SimilarityMetric;
use crate::error::Result;
use crate::types::{CacheEntry, CacheKey, Chunk, ChunkId, DocumentId, SearchFilter};

/// Read access to corpus versions.
///
/// Reads must be atomic; the version counter is the single source of truth
/// for staleness.
pub trait DocumentVersions: Send + Sync {
    /// Current process-wide corpus version.
    fn corpus_version(&self) -> u64;

    /// Version of a document's last committed change, `None` if it does not exist.
    fn current_version(&self, document_id: &DocumentId) -> Option<u64>;
}

/// Document service owning chunks and the corpus version counter.
#[async_trait]
pub trait DocumentStore: DocumentVersions {
    /// Chunks of a document at its current version, ordered by ordinal.
    ///
    /// A deleted document yields `DocumentNotFound`.
    async fn get_chunks(&self, document_id: &DocumentId) -> Result<Vec<Chunk>>;

    /// Every live document.
    async fn list_documents(&self) -> Result<Vec<DocumentId>>;
}

/// Receives document mutation notifications.
///
/// Called synchronously with the mutation; the mutation is not committed
/// until this returns.
#[async_trait]
pub trait DocumentChangeListener: Send + Sync {
    async fn on_document_changed(&self, document_id: &DocumentId) -> Result<()>;
}

/// Embedding model trait.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier; part of every cache key.
    fn model(&self) -> &str;

    /// Embed a batch of chunk texts.
    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single query text.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Get the embedding dimension.
    fn dimension(&self) -> usize;
}

/// A match returned by a vector backend.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub ordinal: u32,
    pub score: f32,
}

/// External similarity-search store.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Native similarity metric (higher is more similar).
    fn metric(&self) -> SimilarityMetric;

    /// Nearest neighbours of `vector`, at most `top_k`, restricted to `filter`.
    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<VectorMatch>>;

    /// Insert or replace the embedding of a chunk.
    async fn upsert(&self, chunk: &Chunk, embedding: Vec<f32>) -> Result<()>;

    /// Remove every chunk of a document; returns how many were removed.
    async fn remove_document(&self, document_id: &DocumentId) -> Result<usize>;

    /// Number of stored vectors.
    async fn len(&self) -> Result<usize>;
}

/// Hosted language model drafting the final answer text.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// Model identifier recorded with cached answers.
    fn model(&self) -> &str;

    /// Draft an answer to `query` grounded on `context`, in ranked order.
    async fn generate(&self, query: &str, context: &[Chunk]) -> Result<String>;
}

/// Durable store behind the in-memory cache.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Load every persisted entry. Undecodable rows are dropped by the backend.
    async fn load(&self) -> Result<Vec<(CacheKey, CacheEntry)>>;

    /// Insert or overwrite an entry.
    async fn save(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()>;

    /// Remove entries by key.
    async fn remove(&self, keys: &[CacheKey]) -> Result<usize>;

    /// Remove entries that depend on a document.
    async fn remove_for_document(&self, document_id: &DocumentId) -> Result<usize>;

    /// Remove entries whose expiry time is at or before `now_millis`.
    async fn remove_expired(&self, now_millis: u64) -> Result<usize>;
}
