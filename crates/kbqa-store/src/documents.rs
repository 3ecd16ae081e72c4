//! In-memory document store owning the corpus version counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use kbqa_core::{
    Chunk, DocumentChangeListener, DocumentId, DocumentStore, DocumentVersions, EngineError, Result,
};

#[derive(Debug, Clone)]
struct StoredDocument {
    version: u64,
    chunks: Vec<Chunk>,
}

/// Document service keeping chunked documents in memory.
///
/// Every committed add, update, or delete increments the corpus version
/// exactly once. Subscribed listeners are called, in subscription order,
/// before the mutating call returns.
///
/// The mutation is committed before listeners run. A failing listener is
/// logged and the remaining listeners still run; the call reports the new
/// version either way.
pub struct InMemoryDocumentStore {
    corpus_version: AtomicU64,
    documents: RwLock<HashMap<DocumentId, StoredDocument>>,

    /// Serializes mutations, held across listener notification.
    writer: tokio::sync::Mutex<()>,

    listeners: RwLock<Vec<Weak<dyn DocumentChangeListener>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            corpus_version: AtomicU64::new(0),
            documents: RwLock::new(HashMap::new()),
            writer: tokio::sync::Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a change listener. Dropped listeners are pruned lazily.
    pub fn subscribe(&self, listener: Weak<dyn DocumentChangeListener>) -> Result<()> {
        self.listeners.write()?.push(listener);
        Ok(())
    }

    /// Add or replace a document, one chunk per non-blank passage.
    ///
    /// Returns the new corpus version.
    pub async fn upsert_document<S: AsRef<str>>(
        &self,
        document_id: &DocumentId,
        passages: &[S],
    ) -> Result<u64> {
        let _guard = self.writer.lock().await;

        let version = self.corpus_version.load(Ordering::SeqCst) + 1;
        let chunks: Vec<Chunk> = passages
            .iter()
            .map(|p| p.as_ref().trim())
            .filter(|p| !p.is_empty())
            .enumerate()
            .map(|(ordinal, text)| Chunk::new(document_id.clone(), ordinal as u32, text, version))
            .collect();
        let count = chunks.len();

        self.documents
            .write()?
            .insert(document_id.clone(), StoredDocument { version, chunks });
        self.corpus_version.store(version, Ordering::SeqCst);

        debug!(
            "Document {} committed at version {} with {} chunks",
            document_id, version, count
        );

        self.notify(document_id).await;
        Ok(version)
    }

    /// Delete a document. Returns the new corpus version.
    pub async fn delete_document(&self, document_id: &DocumentId) -> Result<u64> {
        let _guard = self.writer.lock().await;

        if self.documents.write()?.remove(document_id).is_none() {
            return Err(EngineError::DocumentNotFound {
                id: document_id.to_string(),
            });
        }
        let version = self.corpus_version.fetch_add(1, Ordering::SeqCst) + 1;

        info!("Document {} deleted at version {}", document_id, version);

        self.notify(document_id).await;
        Ok(version)
    }

    /// Number of live documents.
    pub fn len(&self) -> Result<usize> {
        Ok(self.documents.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    async fn notify(&self, document_id: &DocumentId) {
        let listeners: Vec<Arc<dyn DocumentChangeListener>> = match self.listeners.write() {
            Ok(mut registered) => {
                registered.retain(|l| l.strong_count() > 0);
                registered.iter().filter_map(Weak::upgrade).collect()
            }
            Err(err) => {
                error!("Change listeners unreachable for {}: {}", document_id, err);
                return;
            }
        };

        for listener in listeners {
            if let Err(err) = listener.on_document_changed(document_id).await {
                warn!("Change listener failed for {}: {}", document_id, err);
            }
        }
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentVersions for InMemoryDocumentStore {
    fn corpus_version(&self) -> u64 {
        self.corpus_version.load(Ordering::SeqCst)
    }

    fn current_version(&self, document_id: &DocumentId) -> Option<u64> {
        self.documents
            .read()
            .ok()
            .and_then(|docs| docs.get(document_id).map(|d| d.version))
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get_chunks(&self, document_id: &DocumentId) -> Result<Vec<Chunk>> {
        self.documents
            .read()?
            .get(document_id)
            .map(|d| d.chunks.clone())
            .ok_or_else(|| EngineError::DocumentNotFound {
                id: document_id.to_string(),
            })
    }

    async fn list_documents(&self) -> Result<Vec<DocumentId>> {
        let mut ids: Vec<DocumentId> = self.documents.read()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
