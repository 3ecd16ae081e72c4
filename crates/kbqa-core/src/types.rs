//! Core domain types for the retrieval engine.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use ulid::Ulid;

/// Stable identifier of a source document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identifier of a chunk.
///
/// Ordered lexicographically, which is the final tie-break in every ranking.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    /// Fresh random identifier (ULID).
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Content-addressed identifier.
    ///
    /// The corpus version is part of the hash, so reprocessing a document
    /// always yields new chunk ids even when the text is unchanged.
    pub fn derive(document_id: &DocumentId, corpus_version: u64, ordinal: u32, text: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(document_id.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(&corpus_version.to_be_bytes());
        hasher.update(&ordinal.to_be_bytes());
        hasher.update(text.as_bytes());
        let hash = hasher.finalize();
        Self(hex::encode(&hash.as_bytes()[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChunkId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChunkId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A bounded span of text from one document, the unit of retrieval.
///
/// Immutable once created. Reprocessing a document produces new chunks with
/// new ids rather than editing these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Unique identifier.
    pub id: ChunkId,

    /// Parent document.
    pub document_id: DocumentId,

    /// Chunk text content.
    pub text: String,

    /// Position within the document (0-based).
    pub ordinal: u32,

    /// Corpus version stamped when the chunk was indexed.
    pub corpus_version: u64,

    /// Opaque pass-through metadata, never inspected by the engine.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Chunk {
    /// Create a chunk with a content-addressed id.
    pub fn new(document_id: DocumentId, ordinal: u32, text: &str, corpus_version: u64) -> Self {
        let id = ChunkId::derive(&document_id, corpus_version, ordinal, text);
        Self {
            id,
            document_id,
            text: text.to_string(),
            ordinal,
            corpus_version,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata value.
    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Retrieval method that produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMethod {
    Keyword,
    Vector,
}

impl std::fmt::Display for RetrievalMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Keyword => write!(f, "keyword"),
            Self::Vector => write!(f, "vector"),
        }
    }
}

/// Which retrieval methods contributed to a fused result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMethods {
    pub keyword: bool,
    pub vector: bool,
}

impl SourceMethods {
    /// Mark a method as contributing.
    pub fn insert(&mut self, method: RetrievalMethod) {
        match method {
            RetrievalMethod::Keyword => self.keyword = true,
            RetrievalMethod::Vector => self.vector = true,
        }
    }

    pub fn contains(&self, method: RetrievalMethod) -> bool {
        match method {
            RetrievalMethod::Keyword => self.keyword,
            RetrievalMethod::Vector => self.vector,
        }
    }

    /// Number of contributing methods.
    pub fn count(&self) -> usize {
        usize::from(self.keyword) + usize::from(self.vector)
    }
}

/// A hit from a single retrieval method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredHit {
    /// Matched chunk.
    pub chunk_id: ChunkId,

    /// Method-specific score, not comparable across methods.
    pub score: f32,

    /// Position within the source list (1-based).
    pub rank: u32,
}

/// A result after fusing keyword and vector hits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedResult {
    /// Matched chunk.
    pub chunk_id: ChunkId,

    /// Method-agnostic fused score.
    pub fused_score: f64,

    /// Methods in which the chunk appeared.
    pub source_methods: SourceMethods,

    /// Rank in the keyword list, if present.
    pub keyword_rank: Option<u32>,

    /// Rank in the vector list, if present.
    pub vector_rank: Option<u32>,

    /// Combined score after reranking, if the reranker ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f64>,
}

impl FusedResult {
    /// Best (lowest) rank across contributing sources.
    pub fn min_rank(&self) -> u32 {
        match (self.keyword_rank, self.vector_rank) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => u32::MAX,
        }
    }

    /// Score used for final ordering.
    pub fn final_score(&self) -> f64 {
        self.rerank_score.unwrap_or(self.fused_score)
    }
}

/// Restricts retrieval to a set of documents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    /// Documents in scope; `None` means the whole corpus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_ids: Option<BTreeSet<DocumentId>>,
}

impl SearchFilter {
    /// Filter admitting every document.
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter admitting only the given documents.
    pub fn documents<I, D>(ids: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DocumentId>,
    {
        Self {
            document_ids: Some(ids.into_iter().map(Into::into).collect()),
        }
    }

    /// Whether a document passes the filter.
    pub fn allows(&self, document_id: &DocumentId) -> bool {
        self.document_ids
            .as_ref()
            .map(|ids| ids.contains(document_id))
            .unwrap_or(true)
    }

    /// Whether the filter restricts anything.
    pub fn is_scoped(&self) -> bool {
        self.document_ids.is_some()
    }
}

/// A fused result resolved to its chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedPassage {
    #[serde(flatten)]
    pub result: FusedResult,
    pub chunk: Chunk,
}

/// Ordered, bounded retrieval output plus the corpus version it was built at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankedAnswerSet {
    /// Passages in final order.
    pub passages: Vec<RankedPassage>,

    /// Corpus version snapshot read when the query started.
    pub corpus_version: u64,
}

impl RankedAnswerSet {
    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Fused results in order.
    pub fn results(&self) -> impl Iterator<Item = &FusedResult> {
        self.passages.iter().map(|p| &p.result)
    }

    /// Chunk ids in order.
    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.passages.iter().map(|p| p.chunk.id.clone()).collect()
    }

    /// Distinct documents the passages were drawn from.
    pub fn document_ids(&self) -> BTreeSet<DocumentId> {
        self.passages
            .iter()
            .map(|p| p.chunk.document_id.clone())
            .collect()
    }
}

/// A generated answer with the retrieval it was grounded on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    /// Generated answer text.
    pub text: String,

    /// Model that produced the answer.
    pub model: String,

    /// Chunks supplied as context, in order.
    pub citations: Vec<ChunkId>,

    /// Retrieval the answer was built from.
    pub retrieval: RankedAnswerSet,
}

/// Content-addressed cache key (hex digest).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a cache entry memoizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Retrieval,
    Answer,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retrieval => "retrieval",
            Self::Answer => "answer",
        }
    }
}

/// Cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum CachePayload {
    Retrieval(RankedAnswerSet),
    Answer(Answer),
}

impl CachePayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Retrieval(_) => PayloadKind::Retrieval,
            Self::Answer(_) => PayloadKind::Answer,
        }
    }

    /// The retrieval result underlying the payload.
    pub fn answer_set(&self) -> &RankedAnswerSet {
        match self {
            Self::Retrieval(set) => set,
            Self::Answer(answer) => &answer.retrieval,
        }
    }
}

/// Document versions an entry was built against (`None` = document absent).
pub type DependencyVersions = BTreeMap<DocumentId, Option<u64>>;

/// A memoized result.
///
/// Valid for lookup only while `now < expires_at` and every dependent
/// document is still at the recorded version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Cached value.
    pub payload: CachePayload,

    /// Insertion time (Unix millis).
    pub created_at: u64,

    /// Expiry time (Unix millis).
    pub expires_at: u64,

    /// Corpus version snapshot the payload was built at.
    pub corpus_version: u64,

    /// Per-document versions the payload depends on.
    pub dependencies: DependencyVersions,
}

impl CacheEntry {
    /// Create an entry; timestamps are stamped by the cache on insert.
    pub fn new(payload: CachePayload, corpus_version: u64, dependencies: DependencyVersions) -> Self {
        Self {
            payload,
            created_at: 0,
            expires_at: 0,
            corpus_version,
            dependencies,
        }
    }

    /// Whether the entry has passed its expiry time.
    pub fn is_expired(&self, now_millis: u64) -> bool {
        now_millis >= self.expires_at
    }

    /// Remaining time to live in milliseconds.
    pub fn remaining_ttl(&self, now_millis: u64) -> u64 {
        self.expires_at.saturating_sub(now_millis)
    }
}

/// Cache counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Live entries.
    pub size: usize,

    /// Configured maximum number of entries.
    pub capacity: usize,

    /// Lookups served from the cache.
    pub hit_count: u64,

    /// Lookups that missed (absent, expired, or stale).
    pub miss_count: u64,

    /// Entries removed to get back under capacity.
    pub eviction_count: u64,

    /// Entries removed because their TTL elapsed.
    pub expired_count: u64,

    /// Entries removed by document invalidation or version mismatch.
    pub invalidated_count: u64,

    /// Internal inconsistencies repaired.
    pub repair_count: u64,

    /// `hit_count / (hit_count + miss_count)`, 0 when no lookups happened.
    pub hit_rate: f64,
}

/// Keyword index counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub chunks: usize,
    pub documents: usize,
    pub terms: usize,
    pub average_length: f64,
}
