//! In-process BM25 keyword index.
//!
//! Searches run against an immutable [`KeywordSnapshot`]. Mutations build a
//! new snapshot and swap it in, so a query never observes a half-applied
//! document replacement and never waits on a writer.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use kbqa_core::{
    Chunk, ChunkId, DocumentId, EngineError, IndexStats, KeywordConfig, Result, ScoredHit,
    SearchFilter,
};

use crate::tokenize::{term_frequencies, tokenize, unique_terms};

#[derive(Debug, Clone)]
struct IndexedChunk {
    chunk: Arc<Chunk>,
    length: u32,
    terms: Vec<String>,
}

/// Immutable view of the index at one point in time.
#[derive(Debug, Clone, Default)]
pub struct KeywordSnapshot {
    chunks: HashMap<ChunkId, IndexedChunk>,
    postings: HashMap<String, HashMap<ChunkId, u32>>,
    by_document: HashMap<DocumentId, BTreeSet<ChunkId>>,
    total_length: u64,
}

impl KeywordSnapshot {
    /// Look up an indexed chunk.
    pub fn get_chunk(&self, id: &ChunkId) -> Option<&Arc<Chunk>> {
        self.chunks.get(id).map(|c| &c.chunk)
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.chunks.contains_key(id)
    }

    /// Number of indexed chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Ids of a document's indexed chunks.
    pub fn chunks_of(&self, document_id: &DocumentId) -> Vec<ChunkId> {
        self.by_document
            .get(document_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Index counters.
    pub fn stats(&self) -> IndexStats {
        IndexStats {
            chunks: self.chunks.len(),
            documents: self.by_document.len(),
            terms: self.postings.len(),
            average_length: self.average_length(),
        }
    }

    fn average_length(&self) -> f64 {
        if self.chunks.is_empty() {
            0.0
        } else {
            self.total_length as f64 / self.chunks.len() as f64
        }
    }

    fn insert(&mut self, chunk: Chunk) {
        if self.chunks.contains_key(&chunk.id) {
            self.remove(&chunk.id.clone());
        }

        let tokens = tokenize(&chunk.text);
        let length = tokens.len() as u32;
        let tf = term_frequencies(&tokens);
        let mut terms: Vec<String> = tf.keys().cloned().collect();
        terms.sort();

        for (term, count) in tf {
            self.postings
                .entry(term)
                .or_default()
                .insert(chunk.id.clone(), count);
        }
        self.by_document
            .entry(chunk.document_id.clone())
            .or_default()
            .insert(chunk.id.clone());
        self.total_length += u64::from(length);
        self.chunks.insert(
            chunk.id.clone(),
            IndexedChunk {
                chunk: Arc::new(chunk),
                length,
                terms,
            },
        );
    }

    fn remove(&mut self, id: &ChunkId) -> bool {
        let Some(indexed) = self.chunks.remove(id) else {
            return false;
        };

        for term in &indexed.terms {
            if let Some(list) = self.postings.get_mut(term) {
                list.remove(id);
                if list.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        let document_id = &indexed.chunk.document_id;
        if let Some(ids) = self.by_document.get_mut(document_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_document.remove(document_id);
            }
        }
        self.total_length = self.total_length.saturating_sub(u64::from(indexed.length));
        true
    }

    fn remove_document(&mut self, document_id: &DocumentId) -> usize {
        let ids = self.chunks_of(document_id);
        ids.iter().filter(|id| self.remove(id)).count()
    }

    /// Score every chunk matching at least one query term.
    fn score(
        &self,
        k1: f64,
        b: f64,
        query_terms: &BTreeSet<String>,
        top_k: usize,
        filter: &SearchFilter,
    ) -> Vec<ScoredHit> {
        if self.chunks.is_empty() || query_terms.is_empty() {
            return Vec::new();
        }

        let n = self.chunks.len() as f64;
        let avgdl = self.average_length().max(1.0);
        let mut scores: HashMap<&ChunkId, f64> = HashMap::new();

        for term in query_terms {
            let Some(list) = self.postings.get(term) else {
                continue;
            };
            let df = list.len() as f64;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();

            for (id, &tf) in list {
                let Some(indexed) = self.chunks.get(id) else {
                    warn!("keyword postings reference missing chunk {}", id);
                    continue;
                };
                if !filter.allows(&indexed.chunk.document_id) {
                    continue;
                }
                let tf = f64::from(tf);
                let dl = f64::from(indexed.length);
                let norm = k1 * (1.0 - b + b * dl / avgdl);
                *scores.entry(id).or_default() += idf * tf * (k1 + 1.0) / (tf + norm);
            }
        }

        let mut ranked: Vec<(&ChunkId, f64, u32)> = scores
            .into_iter()
            .filter(|(_, score)| *score > 0.0)
            .filter_map(|(id, score)| self.chunks.get(id).map(|c| (id, score, c.chunk.ordinal)))
            .collect();

        ranked.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| a.2.cmp(&b.2))
                .then_with(|| a.0.cmp(b.0))
        });
        ranked.truncate(top_k);

        ranked
            .into_iter()
            .enumerate()
            .map(|(i, (id, score, _))| ScoredHit {
                chunk_id: id.clone(),
                score: score as f32,
                rank: i as u32 + 1,
            })
            .collect()
    }
}

/// BM25 keyword index safe for concurrent search and mutation.
pub struct KeywordIndex {
    k1: f64,
    b: f64,

    /// Current snapshot; readers clone the `Arc` and release the lock.
    current: RwLock<Arc<KeywordSnapshot>>,

    /// Serializes writers.
    writer: Mutex<()>,
}

impl KeywordIndex {
    /// Create an empty index.
    pub fn new(config: &KeywordConfig) -> Result<Self> {
        if !config.k1.is_finite() || config.k1 < 0.0 {
            return Err(EngineError::invalid_argument(format!(
                "k1 must be >= 0, got {}",
                config.k1
            )));
        }
        if !(0.0..=1.0).contains(&config.b) {
            return Err(EngineError::invalid_argument(format!(
                "b must be in [0, 1], got {}",
                config.b
            )));
        }

        Ok(Self {
            k1: config.k1,
            b: config.b,
            current: RwLock::new(Arc::new(KeywordSnapshot::default())),
            writer: Mutex::new(()),
        })
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Result<Arc<KeywordSnapshot>> {
        Ok(self.current.read()?.clone())
    }

    /// Top `top_k` chunks for `query`, best first.
    pub fn search(&self, query: &str, top_k: usize) -> Result<Vec<ScoredHit>> {
        self.search_filtered(query, top_k, &SearchFilter::all())
    }

    /// Top `top_k` chunks for `query` within `filter`.
    pub fn search_filtered(
        &self,
        query: &str,
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredHit>> {
        self.search_snapshot(query, top_k, filter).map(|(hits, _)| hits)
    }

    /// Search and also return the snapshot the hits were scored against.
    pub fn search_snapshot(
        &self,
        query: &str,
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<(Vec<ScoredHit>, Arc<KeywordSnapshot>)> {
        if top_k == 0 {
            return Err(EngineError::invalid_argument("top_k must be >= 1"));
        }

        let snapshot = self.snapshot()?;
        let terms = unique_terms(query);
        let hits = snapshot.score(self.k1, self.b, &terms, top_k, filter);

        debug!(
            "Keyword search for {:?}: {} terms, {} hits",
            query,
            terms.len(),
            hits.len()
        );

        Ok((hits, snapshot))
    }

    /// Add (or replace) a single chunk.
    pub fn add_chunk(&self, chunk: Chunk) -> Result<()> {
        self.mutate(|snapshot| snapshot.insert(chunk))
    }

    /// Remove a single chunk; returns whether it was present.
    pub fn remove_chunk(&self, id: &ChunkId) -> Result<bool> {
        self.mutate(|snapshot| snapshot.remove(id))
    }

    /// Remove every chunk of a document.
    pub fn remove_document(&self, document_id: &DocumentId) -> Result<usize> {
        self.mutate(|snapshot| snapshot.remove_document(document_id))
    }

    /// Swap a document's chunks for a new set in one visible step.
    pub fn replace_document(&self, document_id: &DocumentId, chunks: Vec<Chunk>) -> Result<usize> {
        self.mutate(|snapshot| {
            let removed = snapshot.remove_document(document_id);
            for chunk in chunks {
                if &chunk.document_id != document_id {
                    warn!(
                        "Skipping chunk {} of {} while replacing {}",
                        chunk.id, chunk.document_id, document_id
                    );
                    continue;
                }
                snapshot.insert(chunk);
            }
            removed
        })
    }

    /// Replace the whole index contents.
    pub fn rebuild(&self, chunks: Vec<Chunk>) -> Result<()> {
        let _guard = self.writer.lock()?;
        let mut next = KeywordSnapshot::default();
        for chunk in chunks {
            next.insert(chunk);
        }
        *self.current.write()? = Arc::new(next);
        Ok(())
    }

    /// Look up a chunk in the current snapshot.
    pub fn get_chunk(&self, id: &ChunkId) -> Result<Option<Arc<Chunk>>> {
        Ok(self.snapshot()?.get_chunk(id).cloned())
    }

    /// Index counters.
    pub fn stats(&self) -> Result<IndexStats> {
        Ok(self.snapshot()?.stats())
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut KeywordSnapshot) -> R) -> Result<R> {
        let _guard = self.writer.lock()?;
        let current = self.snapshot()?;
        let mut next: KeywordSnapshot = (*current).clone();
        let out = f(&mut next);
        *self.current.write()? = Arc::new(next);
        Ok(out)
    }
}

impl std::fmt::Debug for KeywordIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeywordIndex")
            .field("k1", &self.k1)
            .field("b", &self.b)
            .finish_non_exhaustive()
    }
}
