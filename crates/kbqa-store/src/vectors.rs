//! Brute-force in-memory vector store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use kbqa_core::{
    Chunk, ChunkId, DocumentId, EngineError, Result, SearchFilter, SimilarityMetric,
    VectorBackend, VectorMatch,
};

#[derive(Debug, Clone)]
struct StoredVector {
    document_id: DocumentId,
    ordinal: u32,
    embedding: Vec<f32>,
}

/// Exhaustive-scan vector store.
///
/// Outage and latency switches let tests exercise the client's timeout and
/// degraded-mode handling.
pub struct InMemoryVectorStore {
    metric: SimilarityMetric,
    vectors: RwLock<HashMap<ChunkId, StoredVector>>,
    available: AtomicBool,
    latency_ms: AtomicU64,
}

impl InMemoryVectorStore {
    pub fn new(metric: SimilarityMetric) -> Self {
        Self {
            metric,
            vectors: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn simulate(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(EngineError::unavailable("vector_store", "connection refused"));
        }
        Ok(())
    }

    fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        match self.metric {
            SimilarityMetric::DotProduct => dot,
            SimilarityMetric::Cosine => {
                let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if na == 0.0 || nb == 0.0 {
                    0.0
                } else {
                    dot / (na * nb)
                }
            }
        }
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new(SimilarityMetric::Cosine)
    }
}

#[async_trait]
impl VectorBackend for InMemoryVectorStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn metric(&self) -> SimilarityMetric {
        self.metric
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<VectorMatch>> {
        self.simulate().await?;

        let vectors = self.vectors.read()?;
        let mut matches = Vec::new();
        for (chunk_id, stored) in vectors.iter() {
            if !filter.allows(&stored.document_id) {
                continue;
            }
            if stored.embedding.len() != vector.len() {
                return Err(EngineError::invalid_argument(format!(
                    "query dimension {} does not match stored dimension {}",
                    vector.len(),
                    stored.embedding.len()
                )));
            }
            matches.push(VectorMatch {
                chunk_id: chunk_id.clone(),
                document_id: stored.document_id.clone(),
                ordinal: stored.ordinal,
                score: self.similarity(vector, &stored.embedding),
            });
        }

        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.ordinal.cmp(&b.ordinal))
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn upsert(&self, chunk: &Chunk, embedding: Vec<f32>) -> Result<()> {
        self.simulate().await?;
        self.vectors.write()?.insert(
            chunk.id.clone(),
            StoredVector {
                document_id: chunk.document_id.clone(),
                ordinal: chunk.ordinal,
                embedding,
            },
        );
        Ok(())
    }

    async fn remove_document(&self, document_id: &DocumentId) -> Result<usize> {
        self.simulate().await?;
        let mut vectors = self.vectors.write()?;
        let before = vectors.len();
        vectors.retain(|_, v| &v.document_id != document_id);
        let removed = before - vectors.len();
        debug!("Removed {} vectors of {}", removed, document_id);
        Ok(removed)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.vectors.read()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc: &str, ordinal: u32, text: &str) -> Chunk {
        Chunk::new(DocumentId::from(doc), ordinal, text, 1)
    }

    #[tokio::test]
    async fn test_cosine_search() {
        let store = InMemoryVectorStore::default();
        let a = chunk("d1", 0, "a");
        let b = chunk("d1", 1, "b");
        store.upsert(&a, vec![1.0, 0.0]).await.unwrap();
        store.upsert(&b, vec![0.6, 0.8]).await.unwrap();

        let hits = store.search(&[1.0, 0.1], 5, &SearchFilter::all()).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, a.id);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_filter_and_remove() {
        let store = InMemoryVectorStore::default();
        store.upsert(&chunk("d1", 0, "a"), vec![1.0]).await.unwrap();
        store.upsert(&chunk("d2", 0, "b"), vec![1.0]).await.unwrap();

        let hits = store
            .search(&[1.0], 5, &SearchFilter::documents(["d2"]))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, DocumentId::from("d2"));

        assert_eq!(store.remove_document(&DocumentId::from("d1")).await.unwrap(), 1);
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_outage_switch() {
        let store = InMemoryVectorStore::default();
        store.set_available(false);
        let err = store.search(&[1.0], 5, &SearchFilter::all()).await.unwrap_err();
        assert_eq!(err.error_code(), "UNAVAILABLE");
        store.set_available(true);
        assert!(store.search(&[1.0], 5, &SearchFilter::all()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_switch() {
        let store = InMemoryVectorStore::default();
        store.set_latency(Duration::from_secs(5));
        let started = tokio::time::Instant::now();
        store.search(&[1.0], 5, &SearchFilter::all()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_dimension_mismatch() {
        let store = InMemoryVectorStore::default();
        store.upsert(&chunk("d1", 0, "a"), vec![1.0, 0.0]).await.unwrap();
        assert!(store.search(&[1.0], 5, &SearchFilter::all()).await.is_err());
    }
}
