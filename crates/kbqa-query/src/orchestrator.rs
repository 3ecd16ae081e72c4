//! Retrieval orchestrator: cache check, concurrent retrieval, fusion,
//! reranking, and memoization.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

use kbqa_cache::{CacheLookup, CacheStore, KeyInput, MissReason};
use kbqa_core::{
    Answer, AnswerGenerator, CacheBackend, CacheEntry, CacheKey, CachePayload, CacheStats, Chunk,
    Clock, DependencyVersions, DocumentChangeListener, DocumentId, DocumentStore, DocumentVersions,
    Embedder, EngineConfig, EngineError, IndexStats, PayloadKind, RankedAnswerSet, RankedPassage,
    Result, ScoredHit, SearchFilter, SystemClock, VectorBackend,
};
use kbqa_index::{KeywordIndex, KeywordSnapshot, VectorIndex};

use crate::fusion::fuse;
use crate::request::{
    AnswerResponse, CacheOutcome, DegradedReason, QueryRequest, QueryResponse, ResponseStatus,
};
use crate::rerank::LexicalReranker;

const GENERATOR: &str = "answer_generator";

/// Steps a query moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryPhase {
    Received,
    CacheCheck,
    Retrieving,
    Fusing,
    Reranking,
    Caching,
    Generating,
}

impl QueryPhase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::CacheCheck => "cache_check",
            Self::Retrieving => "retrieving",
            Self::Fusing => "fusing",
            Self::Reranking => "reranking",
            Self::Caching => "caching",
            Self::Generating => "generating",
        }
    }
}

type KeywordOutcome = std::result::Result<(Vec<ScoredHit>, Arc<KeywordSnapshot>), DegradedReason>;
type VectorOutcome = std::result::Result<Vec<ScoredHit>, DegradedReason>;

/// A finished retrieval plus the document versions it was built against.
struct Retrieval {
    response: QueryResponse,
    dependencies: DependencyVersions,
}

/// Wires collaborators into a [`RetrievalOrchestrator`].
pub struct OrchestratorBuilder {
    config: EngineConfig,
    documents: Option<Arc<dyn DocumentStore>>,
    versions: Option<Arc<dyn DocumentVersions>>,
    embedder: Option<Arc<dyn Embedder>>,
    vector_backend: Option<Arc<dyn VectorBackend>>,
    generator: Option<Arc<dyn AnswerGenerator>>,
    cache_backend: Option<Arc<dyn CacheBackend>>,
    clock: Option<Arc<dyn Clock>>,
}

impl OrchestratorBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            documents: None,
            versions: None,
            embedder: None,
            vector_backend: None,
            generator: None,
            cache_backend: None,
            clock: None,
        }
    }

    /// Document service; also the source of corpus and document versions.
    pub fn documents<D: DocumentStore + 'static>(mut self, store: Arc<D>) -> Self {
        let versions: Arc<dyn DocumentVersions> = store.clone();
        let documents: Arc<dyn DocumentStore> = store;
        self.versions = Some(versions);
        self.documents = Some(documents);
        self
    }

    /// Embedding model used to vectorize queries and chunks.
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn vector_backend(mut self, backend: Arc<dyn VectorBackend>) -> Self {
        self.vector_backend = Some(backend);
        self
    }

    /// Answer generator; required only for [`RetrievalOrchestrator::answer`].
    pub fn generator(mut self, generator: Arc<dyn AnswerGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Durable write-through store for cache entries.
    pub fn cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<RetrievalOrchestrator> {
        let config = self.config;
        config.validate()?;

        let (documents, versions) = match (self.documents, self.versions) {
            (Some(documents), Some(versions)) => (documents, versions),
            _ => return Err(EngineError::config("a document store is required")),
        };
        let embedder = self
            .embedder
            .ok_or_else(|| EngineError::config("an embedder is required"))?;
        let backend = self
            .vector_backend
            .ok_or_else(|| EngineError::config("a vector backend is required"))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let keyword = Arc::new(KeywordIndex::new(&config.keyword)?);
        let vector = VectorIndex::new(backend, config.vector.clone(), clock.clone());

        let reranker = if config.rerank.enabled {
            Some(LexicalReranker::new(&config.rerank, config.fusion.rrf_k)?)
        } else {
            None
        };

        let (cache, backing) = if config.cache.enabled {
            let cache = CacheStore::new(config.cache.capacity, versions.clone(), clock.clone())?;
            (Some(cache), self.cache_backend)
        } else {
            if self.cache_backend.is_some() {
                warn!("Cache backend configured but caching is disabled; ignoring it");
            }
            (None, None)
        };

        let permits = Semaphore::new(config.query.max_concurrent);

        info!(
            "Retrieval orchestrator ready (vector backend: {}, cache: {}, persisted: {})",
            vector.name(),
            cache.is_some(),
            backing.is_some()
        );

        Ok(RetrievalOrchestrator {
            config,
            documents,
            versions,
            embedder,
            keyword,
            vector,
            reranker,
            cache,
            backing,
            generator: self.generator,
            clock,
            permits,
        })
    }
}

/// Hybrid retrieval engine.
///
/// Each query reads the corpus version once, checks the cache, then runs the
/// keyword index and the vector store concurrently under a shared timeout.
/// A failed source degrades the response instead of failing it. Results are
/// fused with Reciprocal Rank Fusion, optionally reranked, and cached only
/// when both sources answered.
///
/// Register the orchestrator as a [`DocumentChangeListener`] with the
/// document service so index updates and cache invalidation happen before a
/// document mutation returns.
pub struct RetrievalOrchestrator {
    config: EngineConfig,
    documents: Arc<dyn DocumentStore>,
    versions: Arc<dyn DocumentVersions>,
    embedder: Arc<dyn Embedder>,
    keyword: Arc<KeywordIndex>,
    vector: VectorIndex,
    reranker: Option<LexicalReranker>,
    cache: Option<CacheStore>,
    backing: Option<Arc<dyn CacheBackend>>,
    generator: Option<Arc<dyn AnswerGenerator>>,
    clock: Arc<dyn Clock>,

    /// Bounds queries in flight.
    permits: Semaphore,
}

impl RetrievalOrchestrator {
    /// Run a retrieval query.
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        self.query_with_cancel(request, &CancellationToken::new()).await
    }

    /// Run a retrieval query that aborts when `cancel` fires.
    ///
    /// A cancelled query never writes to the cache.
    #[instrument(skip_all, fields(query = %request.text))]
    pub async fn query_with_cancel(
        &self,
        request: QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryResponse> {
        let started = Instant::now();
        let top_k = self.validate(&request)?;
        let _permit = self.acquire(cancel).await?;

        let retrieval = self.retrieve(&request, top_k, cancel, started).await?;
        Ok(retrieval.response)
    }

    /// Retrieve, then generate an answer from the top passages.
    pub async fn answer(&self, request: QueryRequest) -> Result<AnswerResponse> {
        self.answer_with_cancel(request, &CancellationToken::new()).await
    }

    /// Answer a query, aborting when `cancel` fires.
    ///
    /// No generator call is made when retrieval finds nothing. Generator
    /// failures are retried a bounded number of times, then surfaced as
    /// `Unavailable`.
    #[instrument(skip_all, fields(query = %request.text))]
    pub async fn answer_with_cancel(
        &self,
        request: QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<AnswerResponse> {
        let started = Instant::now();
        let generator = self
            .generator
            .clone()
            .ok_or_else(|| EngineError::config("no answer generator configured"))?;
        let top_k = self.validate(&request)?;
        let _permit = self.acquire(cancel).await?;

        let use_cache = request.use_cache && self.cache.is_some();
        let key = self.key(PayloadKind::Answer, &request, top_k);

        if use_cache {
            self.checkpoint(cancel, QueryPhase::CacheCheck)?;
            if let Some(entry) = self.lookup(&key, PayloadKind::Answer).await {
                if let CachePayload::Answer(answer) = &entry.payload {
                    debug!("Answer cache hit {}", key.short());
                    return Ok(AnswerResponse {
                        query_id: Ulid::new(),
                        answer: Some(answer.clone()),
                        status: ResponseStatus::Complete,
                        degraded: Vec::new(),
                        cache: CacheOutcome::Hit,
                        latency_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
        }

        let Retrieval {
            response,
            dependencies,
        } = self.retrieve(&request, top_k, cancel, started).await?;

        if response.answer_set.is_empty() {
            info!("No matching content; skipping generation");
            return Ok(AnswerResponse {
                query_id: response.query_id,
                answer: None,
                status: response.status,
                degraded: response.degraded,
                cache: response.cache,
                latency_ms: started.elapsed().as_millis() as u64,
            });
        }

        self.checkpoint(cancel, QueryPhase::Generating)?;
        let context: Vec<Chunk> = response
            .answer_set
            .passages
            .iter()
            .take(self.config.answer.context_chunks.max(1))
            .map(|p| p.chunk.clone())
            .collect();

        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(EngineError::cancelled(QueryPhase::Generating.as_str()));
            }
            text = self.generate(generator.as_ref(), &request.text, &context) => text?,
        };

        let answer = Answer {
            text,
            model: generator.model().to_string(),
            citations: context.iter().map(|c| c.id.clone()).collect(),
            retrieval: response.answer_set,
        };

        self.checkpoint(cancel, QueryPhase::Caching)?;
        if use_cache && response.status == ResponseStatus::Complete {
            let corpus_version = answer.retrieval.corpus_version;
            self.remember(
                key,
                CachePayload::Answer(answer.clone()),
                corpus_version,
                dependencies,
            )
            .await;
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        info!(
            "Answer {} generated in {}ms from {} passages",
            response.query_id,
            latency_ms,
            answer.citations.len()
        );

        Ok(AnswerResponse {
            query_id: response.query_id,
            answer: Some(answer),
            status: response.status,
            degraded: response.degraded,
            cache: if use_cache {
                CacheOutcome::Miss
            } else {
                CacheOutcome::Bypassed
            },
            latency_ms,
        })
    }

    /// Bring both indexes in line with the document service after `document_id`
    /// changed, then drop every cache entry that depended on it.
    #[instrument(skip(self))]
    pub async fn refresh_document(&self, document_id: &DocumentId) -> Result<()> {
        let indexed = self.reindex(document_id).await;
        let invalidated = self.invalidate(document_id).await;
        indexed?;
        invalidated?;
        Ok(())
    }

    /// Remove every cache entry depending on `document_id`. Idempotent.
    ///
    /// Returns the number of in-memory entries removed.
    #[instrument(skip(self))]
    pub async fn invalidate(&self, document_id: &DocumentId) -> Result<usize> {
        let removed = match &self.cache {
            Some(cache) => cache.invalidate(document_id)?.len(),
            None => 0,
        };
        if let Some(backing) = &self.backing {
            if let Err(err) = backing.remove_for_document(document_id).await {
                warn!("Backing store invalidation failed for {}: {}", document_id, err);
            }
        }
        Ok(removed)
    }

    /// Cache counters; all zero when caching is disabled.
    pub fn cache_stats(&self) -> Result<CacheStats> {
        match &self.cache {
            Some(cache) => cache.stats(),
            None => Ok(CacheStats::default()),
        }
    }

    /// Rebuild both indexes from the document service.
    #[instrument(skip(self))]
    pub async fn rebuild_indexes(&self) -> Result<IndexStats> {
        let started = Instant::now();
        let document_ids = self.documents.list_documents().await?;

        let mut all = Vec::new();
        let mut per_document = Vec::with_capacity(document_ids.len());
        for document_id in document_ids {
            let chunks = self.documents.get_chunks(&document_id).await?;
            all.extend(chunks.iter().cloned());
            per_document.push((document_id, chunks));
        }
        self.keyword.rebuild(all)?;

        for (document_id, chunks) in &per_document {
            if let Err(err) = self.index_vectors(document_id, chunks).await {
                warn!("Vector indexing failed for {}: {}", document_id, err);
            }
        }

        let stats = self.keyword.stats()?;
        info!(
            "Indexed {} chunks from {} documents in {}ms",
            stats.chunks,
            stats.documents,
            started.elapsed().as_millis()
        );
        Ok(stats)
    }

    /// Load persisted entries into the in-memory cache.
    ///
    /// Entries that have expired or gone stale are deleted from the backing
    /// store instead. Returns the number restored.
    #[instrument(skip(self))]
    pub async fn warm_cache(&self) -> Result<usize> {
        let (Some(cache), Some(backing)) = (&self.cache, &self.backing) else {
            return Ok(0);
        };

        let persisted = match backing.load().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!("Could not load persisted cache: {}", err);
                return Ok(0);
            }
        };

        let mut restored = 0;
        let mut dead = Vec::new();
        for (key, entry) in persisted {
            if cache.restore(key.clone(), entry)? {
                restored += 1;
            } else {
                dead.push(key);
            }
        }
        self.forget(&dead).await;

        info!(
            "Warmed cache with {} entries ({} discarded)",
            restored,
            dead.len()
        );
        Ok(restored)
    }

    /// One maintenance pass: TTL and capacity eviction, backing-store
    /// pruning, and a reverse-index consistency check.
    ///
    /// Returns the number of entries evicted from memory.
    pub async fn run_maintenance(&self) -> Result<usize> {
        let Some(cache) = &self.cache else {
            return Ok(0);
        };

        let evicted = cache.evict()?;
        self.forget(&evicted).await;

        if let Some(backing) = &self.backing {
            match backing.remove_expired(self.clock.now_millis()).await {
                Ok(0) => {}
                Ok(n) => debug!("Pruned {} expired rows from the backing store", n),
                Err(err) => warn!("Backing store pruning failed: {}", err),
            }
        }

        let repairs = cache.check_consistency()?;
        if repairs > 0 {
            info!("Cache maintenance repaired {} structures", repairs);
        }
        Ok(evicted.len())
    }

    /// Run [`Self::run_maintenance`] every `cache.maintenance_interval_secs`
    /// until `shutdown` is cancelled.
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let period = Duration::from_secs(self.config.cache.maintenance_interval_secs.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Cache maintenance stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(err) = engine.run_maintenance().await {
                            warn!("Cache maintenance failed: {}", err);
                        }
                    }
                }
            }
        })
    }

    /// The keyword index.
    pub fn keyword_index(&self) -> &KeywordIndex {
        &self.keyword
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn validate(&self, request: &QueryRequest) -> Result<usize> {
        if request.text.trim().is_empty() {
            return Err(EngineError::invalid_argument("query text must not be empty"));
        }

        let limits = &self.config.query;
        let top_k = request.top_k.unwrap_or(limits.default_top_k);
        if top_k == 0 || top_k > limits.max_top_k {
            return Err(EngineError::invalid_argument(format!(
                "top_k must be in 1..={}, got {}",
                limits.max_top_k, top_k
            )));
        }

        if let Some(ids) = &request.filter.document_ids {
            if ids.is_empty() {
                return Err(EngineError::invalid_argument(
                    "document scope must name at least one document",
                ));
            }
        }

        Ok(top_k)
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<tokio::sync::SemaphorePermit<'_>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::cancelled(QueryPhase::Received.as_str())),
            permit = self.permits.acquire() => {
                permit.map_err(|e| EngineError::internal(format!("query permits closed: {}", e)))
            }
        }
    }

    fn checkpoint(&self, cancel: &CancellationToken, phase: QueryPhase) -> Result<()> {
        if cancel.is_cancelled() {
            debug!("Query cancelled before {}", phase.as_str());
            return Err(EngineError::cancelled(phase.as_str()));
        }
        debug!("Query entering {}", phase.as_str());
        Ok(())
    }

    fn key(&self, kind: PayloadKind, request: &QueryRequest, top_k: usize) -> CacheKey {
        KeyInput {
            kind,
            query: &request.text,
            top_k,
            filter: &request.filter,
            config: &self.config,
            embedder: self.embedder.model(),
            generator: self.generator.as_ref().map(|g| g.model()),
        }
        .key()
    }

    async fn retrieve(
        &self,
        request: &QueryRequest,
        top_k: usize,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<Retrieval> {
        let query_id = Ulid::new();
        self.checkpoint(cancel, QueryPhase::Received)?;

        let corpus_version = self.versions.corpus_version();
        let scope = self.scope_versions(&request.filter);
        let use_cache = request.use_cache && self.cache.is_some();
        let key = self.key(PayloadKind::Retrieval, request, top_k);

        if use_cache {
            self.checkpoint(cancel, QueryPhase::CacheCheck)?;
            if let Some(entry) = self.lookup(&key, PayloadKind::Retrieval).await {
                let answer_set = entry.payload.answer_set().clone();
                let status = status_of(&answer_set, &[]);
                info!(
                    "Query {} served from cache ({} passages)",
                    query_id,
                    answer_set.len()
                );
                return Ok(Retrieval {
                    response: QueryResponse {
                        query_id,
                        answer_set,
                        status,
                        degraded: Vec::new(),
                        cache: CacheOutcome::Hit,
                        latency_ms: started.elapsed().as_millis() as u64,
                    },
                    dependencies: entry.dependencies.clone(),
                });
            }
        }

        self.checkpoint(cancel, QueryPhase::Retrieving)?;
        let fetch = self.config.fusion.fetch_count(top_k);
        let sources = async {
            tokio::join!(
                self.keyword_hits(&request.text, fetch, &request.filter),
                self.vector_hits(&request.text, fetch, &request.filter)
            )
        };
        let (keyword, vector) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Query {} cancelled during retrieval", query_id);
                return Err(EngineError::cancelled(QueryPhase::Retrieving.as_str()));
            }
            outcome = sources => outcome,
        };

        let mut degraded = Vec::new();
        let (keyword_hits, snapshot) = match keyword {
            Ok(found) => found,
            Err(reason) => {
                degraded.push(reason);
                (Vec::new(), self.keyword.snapshot()?)
            }
        };
        let vector_hits = vector.unwrap_or_else(|reason| {
            degraded.push(reason);
            Vec::new()
        });

        self.checkpoint(cancel, QueryPhase::Fusing)?;
        let mut fused = fuse(&keyword_hits, &vector_hits, self.config.fusion.rrf_k)?;
        let before = fused.len();
        fused.retain(|r| snapshot.contains(&r.chunk_id));
        if fused.len() < before {
            debug!(
                "Dropped {} fused results unknown to the keyword snapshot",
                before - fused.len()
            );
        }

        self.checkpoint(cancel, QueryPhase::Reranking)?;
        let ranked = match &self.reranker {
            Some(reranker) => reranker.rerank(&request.text, fused, top_k, |id| {
                snapshot.get_chunk(id).map(|c| c.text.as_str())
            })?,
            None => {
                fused.truncate(top_k);
                fused
            }
        };

        let passages: Vec<RankedPassage> = ranked
            .into_iter()
            .filter_map(|result| {
                let chunk: Chunk = (**snapshot.get_chunk(&result.chunk_id)?).clone();
                Some(RankedPassage { result, chunk })
            })
            .collect();

        let mut dependencies = scope;
        for passage in &passages {
            dependencies.insert(
                passage.chunk.document_id.clone(),
                Some(passage.chunk.corpus_version),
            );
        }

        let answer_set = RankedAnswerSet {
            passages,
            corpus_version,
        };
        let status = status_of(&answer_set, &degraded);

        self.checkpoint(cancel, QueryPhase::Caching)?;
        if use_cache && status == ResponseStatus::Complete {
            self.remember(
                key,
                CachePayload::Retrieval(answer_set.clone()),
                corpus_version,
                dependencies.clone(),
            )
            .await;
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        info!(
            "Query {} completed in {}ms: {} passages ({} keyword, {} vector hits), {:?}",
            query_id,
            latency_ms,
            answer_set.len(),
            keyword_hits.len(),
            vector_hits.len(),
            status
        );

        Ok(Retrieval {
            response: QueryResponse {
                query_id,
                answer_set,
                status,
                degraded,
                cache: if use_cache {
                    CacheOutcome::Miss
                } else {
                    CacheOutcome::Bypassed
                },
                latency_ms,
            },
            dependencies,
        })
    }

    fn sub_search_timeout(&self) -> Duration {
        Duration::from_millis(self.config.query.sub_search_timeout_ms)
    }

    async fn keyword_hits(&self, text: &str, fetch: usize, filter: &SearchFilter) -> KeywordOutcome {
        let index = Arc::clone(&self.keyword);
        let query = text.to_string();
        let filter = filter.clone();
        let task =
            tokio::task::spawn_blocking(move || index.search_snapshot(&query, fetch, &filter));

        match tokio::time::timeout(self.sub_search_timeout(), task).await {
            Ok(Ok(Ok(found))) => Ok(found),
            Ok(Ok(Err(err))) => {
                warn!("Keyword search failed: {}", err);
                Err(DegradedReason::KeywordFailed)
            }
            Ok(Err(err)) => {
                warn!("Keyword search task failed: {}", err);
                Err(DegradedReason::KeywordFailed)
            }
            Err(_) => {
                warn!(
                    "Keyword search exceeded {}ms",
                    self.config.query.sub_search_timeout_ms
                );
                Err(DegradedReason::KeywordTimeout)
            }
        }
    }

    async fn vector_hits(&self, text: &str, fetch: usize, filter: &SearchFilter) -> VectorOutcome {
        let search = async {
            let embedding = self.embedder.embed_query(text).await.map_err(|err| {
                warn!("Query embedding failed, continuing keyword-only: {}", err);
                DegradedReason::EmbeddingFailed
            })?;

            self.vector
                .search(&embedding, fetch, filter)
                .await
                .map_err(|err| {
                    warn!("Vector search failed, continuing keyword-only: {}", err);
                    match err {
                        EngineError::Timeout { .. } => DegradedReason::VectorTimeout,
                        _ => DegradedReason::VectorUnavailable,
                    }
                })
        };

        match tokio::time::timeout(self.sub_search_timeout(), search).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    "Vector search exceeded {}ms, continuing keyword-only",
                    self.config.query.sub_search_timeout_ms
                );
                Err(DegradedReason::VectorTimeout)
            }
        }
    }

    /// Versions of the scoped documents, read at query start.
    fn scope_versions(&self, filter: &SearchFilter) -> DependencyVersions {
        filter
            .document_ids
            .iter()
            .flatten()
            .map(|id| (id.clone(), self.versions.current_version(id)))
            .collect()
    }

    /// Cache lookup that never fails the query.
    ///
    /// A hit whose passages no longer resolve in the keyword index is
    /// treated as corruption: the entry is dropped and the lookup misses.
    async fn lookup(&self, key: &CacheKey, kind: PayloadKind) -> Option<Arc<CacheEntry>> {
        let cache = self.cache.as_ref()?;

        let entry = match cache.get(key) {
            Ok(CacheLookup::Hit(entry)) => entry,
            Ok(CacheLookup::Miss(MissReason::Absent)) => return None,
            Ok(CacheLookup::Miss(reason)) => {
                debug!("Cache miss for {}: {:?}", key.short(), reason);
                self.forget(std::slice::from_ref(key)).await;
                return None;
            }
            Err(err) => {
                warn!("Cache lookup failed, bypassing cache: {}", err);
                return None;
            }
        };

        let snapshot = match self.keyword.snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("Keyword snapshot unavailable, bypassing cache: {}", err);
                return None;
            }
        };

        let valid = entry.payload.kind() == kind
            && entry
                .payload
                .answer_set()
                .passages
                .iter()
                .all(|p| snapshot.contains(&p.chunk.id));
        if valid {
            return Some(entry);
        }

        let err = EngineError::corrupted(
            "cache entry",
            format!("{} references chunks missing from the index", key.short()),
        );
        warn!("{}; dropped", err);
        if let Err(err) = cache.remove(key) {
            warn!("Could not drop cache entry {}: {}", key.short(), err);
        }
        self.forget(std::slice::from_ref(key)).await;
        None
    }

    /// Cache a payload, writing through to the backing store.
    async fn remember(
        &self,
        key: CacheKey,
        payload: CachePayload,
        corpus_version: u64,
        dependencies: DependencyVersions,
    ) {
        let Some(cache) = &self.cache else {
            return;
        };

        let entry = CacheEntry::new(payload, corpus_version, dependencies);
        let ttl = Duration::from_secs(self.config.cache.default_ttl_secs);
        let outcome = match cache.put(key.clone(), entry, ttl) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("Cache write failed for {}: {}", key.short(), err);
                return;
            }
        };

        if let (Some(backing), Some(stored)) = (&self.backing, &outcome.stored) {
            if let Err(err) = backing.save(&key, stored).await {
                warn!("Backing store write failed for {}: {}", key.short(), err);
            }
        }
        self.forget(&outcome.evicted).await;
    }

    /// Delete keys from the backing store.
    async fn forget(&self, keys: &[CacheKey]) {
        if keys.is_empty() {
            return;
        }
        if let Some(backing) = &self.backing {
            if let Err(err) = backing.remove(keys).await {
                warn!("Backing store delete of {} keys failed: {}", keys.len(), err);
            }
        }
    }

    async fn reindex(&self, document_id: &DocumentId) -> Result<()> {
        match self.documents.get_chunks(document_id).await {
            Ok(chunks) => {
                let removed = self.keyword.replace_document(document_id, chunks.clone())?;
                debug!(
                    "Reindexed {}: {} chunks replaced by {}",
                    document_id,
                    removed,
                    chunks.len()
                );
                if let Err(err) = self.index_vectors(document_id, &chunks).await {
                    warn!("Vector indexing failed for {}: {}", document_id, err);
                }
            }
            Err(EngineError::DocumentNotFound { .. }) => {
                let removed = self.keyword.remove_document(document_id)?;
                debug!("Removed {} chunks of deleted {}", removed, document_id);
                if let Err(err) = self.vector.remove_document(document_id).await {
                    warn!("Vector removal failed for {}: {}", document_id, err);
                }
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    async fn index_vectors(&self, document_id: &DocumentId, chunks: &[Chunk]) -> Result<()> {
        self.vector.remove_document(document_id).await?;
        if chunks.is_empty() {
            return Ok(());
        }

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let embeddings = self.embedder.embed_documents(&texts).await?;
        if embeddings.len() != chunks.len() {
            return Err(EngineError::embedding(format!(
                "expected {} embeddings, got {}",
                chunks.len(),
                embeddings.len()
            )));
        }

        for (chunk, embedding) in chunks.iter().zip(embeddings) {
            self.vector.upsert(chunk, embedding).await?;
        }
        Ok(())
    }

    async fn generate(
        &self,
        generator: &dyn AnswerGenerator,
        query: &str,
        context: &[Chunk],
    ) -> Result<String> {
        let config = &self.config.answer;
        let timeout = Duration::from_millis(config.timeout_ms);
        let mut attempt = 0u32;

        loop {
            let outcome = match tokio::time::timeout(timeout, generator.generate(query, context)).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::timeout(GENERATOR, config.timeout_ms)),
            };

            match outcome {
                Ok(text) => return Ok(text),
                Err(err) if err.is_retryable() && attempt < config.max_retries => {
                    attempt += 1;
                    warn!("Generation attempt {} failed: {}; retrying", attempt, err);
                    let backoff = config.retry_backoff_ms.saturating_mul(u64::from(attempt));
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(err) if err.is_retryable() => {
                    return Err(EngineError::unavailable(
                        GENERATOR,
                        format!("giving up after {} attempts: {}", attempt + 1, err),
                    ));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn status_of(answer_set: &RankedAnswerSet, degraded: &[DegradedReason]) -> ResponseStatus {
    if !degraded.is_empty() {
        ResponseStatus::Degraded
    } else if answer_set.is_empty() {
        ResponseStatus::NoMatches
    } else {
        ResponseStatus::Complete
    }
}

#[async_trait]
impl DocumentChangeListener for RetrievalOrchestrator {
    async fn on_document_changed(&self, document_id: &DocumentId) -> Result<()> {
        self.refresh_document(document_id).await
    }
}

impl std::fmt::Debug for RetrievalOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalOrchestrator")
            .field("keyword", &self.keyword)
            .field("vector", &self.vector)
            .field("cache", &self.cache)
            .field("persisted", &self.backing.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use kbqa_core::ManualClock;
    use kbqa_embed::HashEmbedder;
    use kbqa_store::{InMemoryDocumentStore, InMemoryVectorStore, SqliteCacheBackend};

    const START: u64 = 1_700_000_000_000;

    /// Generator failing a scripted number of times before answering.
    #[derive(Default)]
    struct ScriptedGenerator {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl ScriptedGenerator {
        fn failing(times: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(times),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AnswerGenerator for ScriptedGenerator {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, query: &str, context: &[Chunk]) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(EngineError::unavailable("llm", "overloaded"));
            }
            Ok(format!("{} ({} passages)", query, context.len()))
        }
    }

    struct Fixture {
        store: Arc<InMemoryDocumentStore>,
        vectors: Arc<InMemoryVectorStore>,
        generator: Arc<ScriptedGenerator>,
        clock: Arc<ManualClock>,
        engine: Arc<RetrievalOrchestrator>,
    }

    const CORPUS: &[(&str, &[&str])] = &[
        (
            "cache",
            &[
                "Cache invalidation removes stale entries when a document changes.",
                "Entries expire after their time to live elapses.",
            ],
        ),
        (
            "fusion",
            &[
                "Reciprocal rank fusion merges keyword and vector rankings.",
                "Fusion uses only ranks, never raw scores.",
            ],
        ),
        (
            "storage",
            &[
                "The write-through store persists cache entries in SQLite.",
                "Rows that fail to decode are deleted on load.",
            ],
        ),
    ];

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.vector.max_retries = 0;
        config.vector.retry_backoff_ms = 1;
        config
    }

    async fn build(
        config: EngineConfig,
        generator: ScriptedGenerator,
        backing: Option<Arc<SqliteCacheBackend>>,
        load_corpus: bool,
    ) -> Fixture {
        let store = Arc::new(InMemoryDocumentStore::new());
        let vectors = Arc::new(InMemoryVectorStore::default());
        let generator = Arc::new(generator);
        let clock = Arc::new(ManualClock::new(START));

        let mut builder = OrchestratorBuilder::new(config)
            .documents(store.clone())
            .embedder(Arc::new(HashEmbedder::default()))
            .vector_backend(vectors.clone())
            .generator(generator.clone())
            .clock(clock.clone());
        if let Some(backing) = backing {
            builder = builder.cache_backend(backing);
        }
        let engine = Arc::new(builder.build().unwrap());

        let listener: Arc<dyn DocumentChangeListener> = engine.clone();
        store.subscribe(Arc::downgrade(&listener)).unwrap();

        if load_corpus {
            for (id, passages) in CORPUS {
                store
                    .upsert_document(&DocumentId::from(*id), *passages)
                    .await
                    .unwrap();
            }
        }

        Fixture {
            store,
            vectors,
            generator,
            clock,
            engine,
        }
    }

    async fn fixture() -> Fixture {
        build(test_config(), ScriptedGenerator::default(), None, true).await
    }

    fn documents_of(response: &QueryResponse) -> Vec<String> {
        response
            .answer_set
            .passages
            .iter()
            .map(|p| p.chunk.document_id.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_complete_query_then_cache_hit() {
        let fx = fixture().await;

        let first = fx
            .engine
            .query(QueryRequest::new("cache invalidation"))
            .await
            .unwrap();
        assert_eq!(first.status, ResponseStatus::Complete);
        assert_eq!(first.cache, CacheOutcome::Miss);
        assert!(!first.is_degraded());
        assert_eq!(first.answer_set.corpus_version, 3);

        let top = &first.answer_set.passages[0];
        assert_eq!(top.chunk.document_id, DocumentId::from("cache"));
        assert_eq!(top.chunk.ordinal, 0);
        assert_eq!(top.result.source_methods.count(), 2);

        let second = fx
            .engine
            .query(QueryRequest::new("  Cache   INVALIDATION "))
            .await
            .unwrap();
        assert_eq!(second.cache, CacheOutcome::Hit);
        assert_eq!(second.answer_set, first.answer_set);
        assert_ne!(second.query_id, first.query_id);

        let stats = fx.engine.cache_stats().unwrap();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
    }

    #[tokio::test]
    async fn test_top_k_bounds_results() {
        let fx = fixture().await;
        let response = fx
            .engine
            .query(QueryRequest::new("entries").with_top_k(2))
            .await
            .unwrap();
        assert_eq!(response.answer_set.len(), 2);
        let ranks: Vec<f64> = response
            .answer_set
            .results()
            .map(|r| r.final_score())
            .collect();
        assert!(ranks[0] >= ranks[1]);
    }

    #[tokio::test]
    async fn test_vector_outage_degrades_to_keyword_only() {
        let fx = fixture().await;
        fx.vectors.set_available(false);

        let response = fx
            .engine
            .query(QueryRequest::new("reciprocal rank fusion"))
            .await
            .unwrap();
        assert_eq!(response.status, ResponseStatus::Degraded);
        assert_eq!(response.degraded, vec![DegradedReason::VectorUnavailable]);
        assert!(!response.answer_set.is_empty());
        assert!(response
            .answer_set
            .results()
            .all(|r| r.keyword_rank.is_some() && r.vector_rank.is_none()));
        assert_eq!(documents_of(&response)[0], "fusion");

        // Degraded results are not memoized
        assert_eq!(fx.engine.cache_stats().unwrap().size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_vector_store_times_out() {
        let fx = fixture().await;
        fx.vectors.set_latency(Duration::from_secs(10));

        let response = fx
            .engine
            .query(QueryRequest::new("cache invalidation"))
            .await
            .unwrap();
        assert_eq!(response.status, ResponseStatus::Degraded);
        assert_eq!(response.degraded, vec![DegradedReason::VectorTimeout]);
        assert_eq!(documents_of(&response)[0], "cache");
    }

    #[tokio::test]
    async fn test_empty_corpus_reports_no_matches() {
        let fx = build(test_config(), ScriptedGenerator::default(), None, false).await;

        let response = fx.engine.query(QueryRequest::new("anything")).await.unwrap();
        assert_eq!(response.status, ResponseStatus::NoMatches);
        assert!(response.answer_set.is_empty());
        assert_eq!(fx.engine.cache_stats().unwrap().size, 0);

        let answer = fx.engine.answer(QueryRequest::new("anything")).await.unwrap();
        assert!(answer.answer.is_none());
        assert_eq!(answer.status, ResponseStatus::NoMatches);
        assert_eq!(fx.generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_stopword_query_reports_no_matches() {
        let fx = fixture().await;

        let response = fx.engine.query(QueryRequest::new("what is the")).await.unwrap();
        assert_eq!(response.status, ResponseStatus::NoMatches);
        assert!(response.answer_set.is_empty());
        assert_eq!(fx.engine.cache_stats().unwrap().size, 0);

        let answer = fx.engine.answer(QueryRequest::new("what is the")).await.unwrap();
        assert!(answer.answer.is_none());
        assert_eq!(fx.generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_rerank_bypass_returns_fused_order() {
        let mut config = test_config();
        config.rerank.enabled = false;
        let fx = build(config, ScriptedGenerator::default(), None, true).await;
        let text = "cache entries";

        let response = fx.engine.query(QueryRequest::new(text)).await.unwrap();
        assert_eq!(response.status, ResponseStatus::Complete);

        // Rebuild both source lists the way the engine fetches them
        let config = fx.engine.config();
        let top_k = config.query.default_top_k;
        let fetch = config.fusion.fetch_count(top_k);
        let keyword = fx.engine.keyword_index().search(text, fetch).unwrap();
        let embedding = HashEmbedder::default().embed_query(text).await.unwrap();
        let vector: Vec<ScoredHit> = fx
            .vectors
            .search(&embedding, fetch, &SearchFilter::all())
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.score > config.vector.min_score)
            .enumerate()
            .map(|(i, m)| ScoredHit {
                chunk_id: m.chunk_id,
                score: m.score,
                rank: i as u32 + 1,
            })
            .collect();
        let mut expected = fuse(&keyword, &vector, config.fusion.rrf_k).unwrap();
        expected.truncate(top_k);

        let actual: Vec<_> = response.answer_set.results().cloned().collect();
        assert_eq!(actual, expected);
        assert!(actual.iter().all(|r| r.rerank_score.is_none()));
        assert!(actual.iter().all(|r| r.final_score() == r.fused_score));
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected() {
        let fx = fixture().await;
        let bad = [
            QueryRequest::new("   "),
            QueryRequest::new("cache").with_top_k(0),
            QueryRequest::new("cache").with_top_k(101),
            QueryRequest::new("cache").with_documents(Vec::<&str>::new()),
        ];
        for request in bad {
            let err = fx.engine.query(request).await.unwrap_err();
            assert_eq!(err.error_code(), "INVALID_ARGUMENT");
        }
    }

    #[tokio::test]
    async fn test_document_update_invalidates_cached_results() {
        let fx = fixture().await;
        let request = QueryRequest::new("cache invalidation");

        fx.engine.query(request.clone()).await.unwrap();
        assert_eq!(fx.engine.cache_stats().unwrap().size, 1);

        fx.store
            .upsert_document(
                &DocumentId::from("cache"),
                &["Invalidation now runs eagerly on every document edit."],
            )
            .await
            .unwrap();
        assert_eq!(fx.engine.cache_stats().unwrap().size, 0);

        let after = fx.engine.query(request).await.unwrap();
        assert_eq!(after.cache, CacheOutcome::Miss);
        assert_eq!(after.answer_set.corpus_version, 4);
        assert!(after
            .answer_set
            .passages
            .iter()
            .any(|p| p.chunk.text.contains("eagerly")));
        assert!(!after
            .answer_set
            .passages
            .iter()
            .any(|p| p.chunk.text.contains("stale entries")));
    }

    #[tokio::test]
    async fn test_document_delete_removes_from_results() {
        let fx = fixture().await;
        fx.engine.query(QueryRequest::new("fusion ranks")).await.unwrap();

        fx.store
            .delete_document(&DocumentId::from("fusion"))
            .await
            .unwrap();

        let response = fx.engine.query(QueryRequest::new("fusion ranks")).await.unwrap();
        assert_eq!(response.cache, CacheOutcome::Miss);
        assert!(!documents_of(&response).contains(&"fusion".to_string()));
    }

    #[tokio::test]
    async fn test_scoped_query_and_scope_invalidation() {
        let fx = fixture().await;
        let request = QueryRequest::new("cache entries").with_documents(["storage"]);

        let response = fx.engine.query(request.clone()).await.unwrap();
        assert!(!response.answer_set.is_empty());
        assert!(documents_of(&response).iter().all(|d| d == "storage"));

        // Documents outside the scope do not touch the entry
        fx.store
            .upsert_document(&DocumentId::from("cache"), &["unrelated edit"])
            .await
            .unwrap();
        let hit = fx.engine.query(request.clone()).await.unwrap();
        assert_eq!(hit.cache, CacheOutcome::Hit);

        fx.store
            .upsert_document(&DocumentId::from("storage"), &["Rows live in SQLite."])
            .await
            .unwrap();
        let miss = fx.engine.query(request).await.unwrap();
        assert_eq!(miss.cache, CacheOutcome::Miss);
    }

    #[tokio::test]
    async fn test_cache_bypass() {
        let fx = fixture().await;
        let response = fx
            .engine
            .query(QueryRequest::new("cache invalidation").without_cache())
            .await
            .unwrap();
        assert_eq!(response.cache, CacheOutcome::Bypassed);
        assert_eq!(fx.engine.cache_stats().unwrap().size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_leaves_no_cache_entry() {
        let fx = fixture().await;
        fx.vectors.set_latency(Duration::from_secs(1));

        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let engine = fx.engine.clone();
            let token = token.clone();
            async move {
                engine
                    .query_with_cancel(QueryRequest::new("cache invalidation"), &token)
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.error_code(), "CANCELLED");
        assert_eq!(fx.engine.cache_stats().unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let fx = fixture().await;
        let token = CancellationToken::new();
        token.cancel();
        let err = fx
            .engine
            .query_with_cancel(QueryRequest::new("cache"), &token)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "CANCELLED");
    }

    #[tokio::test]
    async fn test_answer_is_generated_and_cached() {
        let fx = fixture().await;
        let request = QueryRequest::new("how does fusion work");

        let first = fx.engine.answer(request.clone()).await.unwrap();
        let answer = first.answer.unwrap();
        assert_eq!(first.status, ResponseStatus::Complete);
        assert_eq!(first.cache, CacheOutcome::Miss);
        assert_eq!(answer.model, "scripted");
        assert!(!answer.citations.is_empty());
        assert_eq!(answer.citations.len(), answer.retrieval.len().min(5));
        assert_eq!(answer.citations[0], answer.retrieval.passages[0].chunk.id);
        assert_eq!(fx.generator.calls(), 1);

        let second = fx.engine.answer(request).await.unwrap();
        assert_eq!(second.cache, CacheOutcome::Hit);
        assert_eq!(second.answer.unwrap().text, answer.text);
        assert_eq!(fx.generator.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_retries_transient_failures() {
        let fx = build(test_config(), ScriptedGenerator::failing(2), None, true).await;

        let response = fx.engine.answer(QueryRequest::new("fusion")).await.unwrap();
        assert!(response.answer.is_some());
        assert_eq!(fx.generator.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_surfaces_exhausted_retries() {
        let fx = build(test_config(), ScriptedGenerator::failing(10), None, true).await;

        let err = fx.engine.answer(QueryRequest::new("fusion")).await.unwrap_err();
        assert_eq!(err.error_code(), "UNAVAILABLE");
        assert_eq!(fx.generator.calls(), 3);
        assert!(err.to_string().contains(GENERATOR));
    }

    #[tokio::test]
    async fn test_answer_requires_generator() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let engine = OrchestratorBuilder::new(test_config())
            .documents(store)
            .embedder(Arc::new(HashEmbedder::default()))
            .vector_backend(Arc::new(InMemoryVectorStore::default()))
            .build()
            .unwrap();
        let err = engine.answer(QueryRequest::new("x1")).await.unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }

    #[tokio::test]
    async fn test_builder_requires_collaborators() {
        let err = OrchestratorBuilder::new(test_config()).build().unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }

    #[tokio::test]
    async fn test_hit_with_missing_chunks_is_repaired() {
        let fx = fixture().await;
        let request = QueryRequest::new("cache invalidation");
        fx.engine.query(request.clone()).await.unwrap();

        // Index and cache disagree without any version change
        fx.engine
            .keyword_index()
            .remove_document(&DocumentId::from("cache"))
            .unwrap();

        let response = fx.engine.query(request).await.unwrap();
        assert_eq!(response.cache, CacheOutcome::Miss);
        assert!(!documents_of(&response).contains(&"cache".to_string()));
    }

    #[tokio::test]
    async fn test_rebuild_indexes_from_store() {
        let store = Arc::new(InMemoryDocumentStore::new());
        for (id, passages) in CORPUS {
            store
                .upsert_document(&DocumentId::from(*id), *passages)
                .await
                .unwrap();
        }
        let vectors = Arc::new(InMemoryVectorStore::default());
        let engine = OrchestratorBuilder::new(test_config())
            .documents(store)
            .embedder(Arc::new(HashEmbedder::default()))
            .vector_backend(vectors.clone())
            .build()
            .unwrap();

        let stats = engine.rebuild_indexes().await.unwrap();
        assert_eq!(stats.chunks, 6);
        assert_eq!(stats.documents, 3);
        assert_eq!(vectors.len().await.unwrap(), 6);

        let response = engine.query(QueryRequest::new("sqlite")).await.unwrap();
        assert_eq!(response.status, ResponseStatus::Complete);
    }

    #[tokio::test]
    async fn test_ttl_maintenance() {
        let mut config = test_config();
        config.cache.default_ttl_secs = 1;
        let fx = build(config, ScriptedGenerator::default(), None, true).await;

        fx.engine.query(QueryRequest::new("fusion")).await.unwrap();
        assert_eq!(fx.engine.cache_stats().unwrap().size, 1);

        fx.clock.advance(2_000);
        assert_eq!(fx.engine.run_maintenance().await.unwrap(), 1);
        assert_eq!(fx.engine.cache_stats().unwrap().size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_maintenance_stops_on_cancel() {
        let mut config = test_config();
        config.cache.default_ttl_secs = 1;
        config.cache.maintenance_interval_secs = 1;
        let fx = build(config, ScriptedGenerator::default(), None, true).await;

        fx.engine.query(QueryRequest::new("fusion")).await.unwrap();
        fx.clock.advance(2_000);

        let shutdown = CancellationToken::new();
        let handle = fx.engine.spawn_maintenance(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(fx.engine.cache_stats().unwrap().size, 0);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_persisted_cache_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let request = QueryRequest::new("cache invalidation");

        let first = {
            let backing = Arc::new(SqliteCacheBackend::open(&path).unwrap());
            let fx = build(test_config(), ScriptedGenerator::default(), Some(backing.clone()), true)
                .await;
            let response = fx.engine.query(request.clone()).await.unwrap();
            assert_eq!(backing.count().unwrap(), 1);
            response
        };

        // Restart over the same corpus
        let store = Arc::new(InMemoryDocumentStore::new());
        for (id, passages) in CORPUS {
            store
                .upsert_document(&DocumentId::from(*id), *passages)
                .await
                .unwrap();
        }
        let engine = OrchestratorBuilder::new(test_config())
            .documents(store)
            .embedder(Arc::new(HashEmbedder::default()))
            .vector_backend(Arc::new(InMemoryVectorStore::default()))
            .cache_backend(Arc::new(SqliteCacheBackend::open(&path).unwrap()))
            .clock(Arc::new(ManualClock::new(START)))
            .build()
            .unwrap();
        engine.rebuild_indexes().await.unwrap();
        assert_eq!(engine.warm_cache().await.unwrap(), 1);

        let response = engine.query(request).await.unwrap();
        assert_eq!(response.cache, CacheOutcome::Hit);
        assert_eq!(response.answer_set.chunk_ids(), first.answer_set.chunk_ids());
    }

    #[tokio::test]
    async fn test_scoring_change_misses_persisted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let request = QueryRequest::new("cache invalidation");

        {
            let backing = Arc::new(SqliteCacheBackend::open(&path).unwrap());
            let fx = build(test_config(), ScriptedGenerator::default(), Some(backing.clone()), true)
                .await;
            fx.engine.query(request.clone()).await.unwrap();
            assert_eq!(backing.count().unwrap(), 1);
        }

        let store = Arc::new(InMemoryDocumentStore::new());
        for (id, passages) in CORPUS {
            store
                .upsert_document(&DocumentId::from(*id), *passages)
                .await
                .unwrap();
        }
        let mut config = test_config();
        config.keyword.k1 = 2.0;
        let engine = OrchestratorBuilder::new(config)
            .documents(store)
            .embedder(Arc::new(HashEmbedder::default()))
            .vector_backend(Arc::new(InMemoryVectorStore::default()))
            .cache_backend(Arc::new(SqliteCacheBackend::open(&path).unwrap()))
            .clock(Arc::new(ManualClock::new(START)))
            .build()
            .unwrap();
        engine.rebuild_indexes().await.unwrap();
        assert_eq!(engine.warm_cache().await.unwrap(), 1);

        // Entries built under other BM25 parameters are never served
        let response = engine.query(request).await.unwrap();
        assert_eq!(response.cache, CacheOutcome::Miss);
        assert_eq!(engine.cache_stats().unwrap().size, 2);
    }

    #[tokio::test]
    async fn test_invalidation_reaches_backing_store() {
        let backing = Arc::new(SqliteCacheBackend::open_memory().unwrap());
        let fx = build(test_config(), ScriptedGenerator::default(), Some(backing.clone()), true)
            .await;

        fx.engine.query(QueryRequest::new("cache invalidation")).await.unwrap();
        assert_eq!(backing.count().unwrap(), 1);

        assert_eq!(fx.engine.invalidate(&DocumentId::from("cache")).await.unwrap(), 1);
        assert_eq!(backing.count().unwrap(), 0);
        assert_eq!(fx.engine.invalidate(&DocumentId::from("cache")).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_queries_and_updates() {
        let fx = fixture().await;

        let mut handles = Vec::new();
        for i in 0..16usize {
            let engine = fx.engine.clone();
            handles.push(tokio::spawn(async move {
                let text = if i % 2 == 0 { "cache entries" } else { "rank fusion" };
                engine
                    .query(QueryRequest::new(text).with_top_k(1 + i % 4))
                    .await
            }));
        }
        let writer = {
            let store = fx.store.clone();
            tokio::spawn(async move {
                for n in 0..5 {
                    store
                        .upsert_document(
                            &DocumentId::from("cache"),
                            &[format!("Cache revision {} replaces entries.", n)],
                        )
                        .await
                        .unwrap();
                }
            })
        };

        for handle in handles {
            let response = handle.await.unwrap().unwrap();
            assert_ne!(response.status, ResponseStatus::Degraded);
        }
        writer.await.unwrap();

        let response = fx
            .engine
            .query(QueryRequest::new("cache revision"))
            .await
            .unwrap();
        let texts: Vec<&str> = response
            .answer_set
            .passages
            .iter()
            .filter(|p| p.chunk.document_id == DocumentId::from("cache"))
            .map(|p| p.chunk.text.as_str())
            .collect();
        assert_eq!(texts, vec!["Cache revision 4 replaces entries."]);
    }
}
