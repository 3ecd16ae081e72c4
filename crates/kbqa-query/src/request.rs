//! Query requests and responses.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use kbqa_core::{Answer, DocumentId, RankedAnswerSet, SearchFilter};

/// A retrieval or answer request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Query text.
    pub text: String,

    /// Number of passages wanted; the configured default when `None`.
    #[serde(default)]
    pub top_k: Option<usize>,

    /// Document scope.
    #[serde(default)]
    pub filter: SearchFilter,

    /// Read and populate the cache.
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
}

fn default_use_cache() -> bool {
    true
}

impl QueryRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            top_k: None,
            filter: SearchFilter::all(),
            use_cache: true,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    /// Restrict retrieval to the given documents.
    pub fn with_documents<I, D>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DocumentId>,
    {
        self.filter = SearchFilter::documents(ids);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }
}

/// Outcome class of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// Both sources answered.
    Complete,
    /// At least one source failed; results come from the rest.
    Degraded,
    /// Nothing matched.
    NoMatches,
}

/// Why a response is degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReason {
    VectorUnavailable,
    VectorTimeout,
    EmbeddingFailed,
    KeywordTimeout,
    KeywordFailed,
}

/// How the cache took part in a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Hit,
    Miss,
    /// Caching disabled for this request or engine.
    Bypassed,
}

/// Result of a retrieval query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query_id: Ulid,
    pub answer_set: RankedAnswerSet,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<DegradedReason>,
    pub cache: CacheOutcome,
    pub latency_ms: u64,
}

impl QueryResponse {
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

/// Result of an answer request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub query_id: Ulid,

    /// `None` when retrieval found nothing to answer from.
    pub answer: Option<Answer>,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<DegradedReason>,
    pub cache: CacheOutcome,
    pub latency_ms: u64,
}
