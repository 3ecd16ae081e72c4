//! SQLite persistence for cache entries.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags};
use tracing::{debug, info, warn};

use kbqa_core::{
    CacheBackend, CacheEntry, CacheKey, CachePayload, DependencyVersions, DocumentId, EngineError,
    Result,
};

use crate::schema::{SCHEMA, SCHEMA_VERSION};

/// Write-through store for cache entries.
///
/// Entries survive restarts and are reloaded into the in-memory cache at
/// start-up. Rows that no longer decode are deleted on load.
pub struct SqliteCacheBackend {
    /// Connection wrapped in blocking Mutex.
    conn: Arc<Mutex<Connection>>,
}

struct Row {
    key: String,
    payload: String,
    corpus_version: i64,
    created_at: i64,
    expires_at: i64,
}

impl SqliteCacheBackend {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| EngineError::database(format!("Failed to open database: {}", e)))?;

        let store = Self::init(conn)?;
        info!("Cache database opened at {:?}", path);
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            EngineError::database(format!("Failed to open in-memory database: {}", e))
        })?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 30000;
            PRAGMA foreign_keys = ON;
            "#,
        )
        .map_err(|e| EngineError::database(format!("Failed to configure connection: {}", e)))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| EngineError::database(format!("Failed to initialize schema: {}", e)))?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )
        .map_err(|e| EngineError::database(format!("Failed to record schema version: {}", e)))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Execute a blocking operation on the connection.
    fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| EngineError::database(e.to_string()))?;
        f(&conn)
    }

    /// Execute a mutable blocking operation on the connection.
    fn with_conn_mut<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| EngineError::database(e.to_string()))?;
        f(&mut conn)
    }

    /// Number of persisted entries.
    pub fn count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as usize)
            .map_err(|e| EngineError::database(format!("Failed to count entries: {}", e)))
        })
    }

    fn load_dependencies(conn: &Connection, key: &str) -> Result<DependencyVersions> {
        let mut stmt = conn
            .prepare_cached(
                "SELECT document_id, version FROM cache_dependencies WHERE key = ?1",
            )
            .map_err(|e| EngineError::database(e.to_string()))?;

        let rows = stmt
            .query_map(params![key], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?))
            })
            .map_err(|e| EngineError::database(e.to_string()))?;

        let mut dependencies = DependencyVersions::new();
        for row in rows {
            let (document_id, version) = row.map_err(|e| EngineError::database(e.to_string()))?;
            dependencies.insert(DocumentId::from(document_id), version.map(|v| v as u64));
        }
        Ok(dependencies)
    }
}

#[async_trait]
impl CacheBackend for SqliteCacheBackend {
    async fn load(&self) -> Result<Vec<(CacheKey, CacheEntry)>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT key, payload, corpus_version, created_at, expires_at
                     FROM cache_entries ORDER BY created_at",
                )
                .map_err(|e| EngineError::database(e.to_string()))?;

            let rows = stmt
                .query_map([], |row| {
                    Ok(Row {
                        key: row.get(0)?,
                        payload: row.get(1)?,
                        corpus_version: row.get(2)?,
                        created_at: row.get(3)?,
                        expires_at: row.get(4)?,
                    })
                })
                .map_err(|e| EngineError::database(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| EngineError::database(e.to_string()))?;

            let mut entries = Vec::with_capacity(rows.len());
            let mut corrupted = Vec::new();
            for row in rows {
                let payload: CachePayload = match serde_json::from_str(&row.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        let err = EngineError::corrupted("cache row", format!("{}: {}", row.key, e));
                        warn!("{}; deleting", err);
                        corrupted.push(row.key);
                        continue;
                    }
                };
                let dependencies = Self::load_dependencies(conn, &row.key)?;
                entries.push((
                    CacheKey::new(row.key),
                    CacheEntry {
                        payload,
                        created_at: row.created_at as u64,
                        expires_at: row.expires_at as u64,
                        corpus_version: row.corpus_version as u64,
                        dependencies,
                    },
                ));
            }

            for key in &corrupted {
                conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])
                    .map_err(|e| EngineError::database(e.to_string()))?;
            }

            debug!(
                "Loaded {} cache entries ({} corrupted)",
                entries.len(),
                corrupted.len()
            );
            Ok(entries)
        })
    }

    async fn save(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        let payload = serde_json::to_string(&entry.payload)?;

        self.with_conn_mut(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| EngineError::database(e.to_string()))?;

            tx.execute(
                "INSERT OR REPLACE INTO cache_entries
                 (key, kind, payload, corpus_version, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    key.as_str(),
                    entry.payload.kind().as_str(),
                    payload,
                    entry.corpus_version as i64,
                    entry.created_at as i64,
                    entry.expires_at as i64,
                ],
            )
            .map_err(|e| EngineError::database(format!("Failed to save entry: {}", e)))?;

            // REPLACE deletes the old row, cascading to its dependencies
            tx.execute(
                "DELETE FROM cache_dependencies WHERE key = ?1",
                params![key.as_str()],
            )
            .map_err(|e| EngineError::database(e.to_string()))?;

            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO cache_dependencies (key, document_id, version)
                         VALUES (?1, ?2, ?3)",
                    )
                    .map_err(|e| EngineError::database(e.to_string()))?;
                for (document_id, version) in &entry.dependencies {
                    stmt.execute(params![
                        key.as_str(),
                        document_id.as_str(),
                        version.map(|v| v as i64),
                    ])
                    .map_err(|e| EngineError::database(e.to_string()))?;
                }
            }

            tx.commit()
                .map_err(|e| EngineError::database(e.to_string()))?;
            Ok(())
        })
    }

    async fn remove(&self, keys: &[CacheKey]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.with_conn_mut(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| EngineError::database(e.to_string()))?;
            let mut removed = 0;
            for key in keys {
                removed += tx
                    .execute(
                        "DELETE FROM cache_entries WHERE key = ?1",
                        params![key.as_str()],
                    )
                    .map_err(|e| EngineError::database(e.to_string()))?;
            }
            tx.commit()
                .map_err(|e| EngineError::database(e.to_string()))?;
            Ok(removed)
        })
    }

    async fn remove_for_document(&self, document_id: &DocumentId) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM cache_entries WHERE key IN
                 (SELECT key FROM cache_dependencies WHERE document_id = ?1)",
                params![document_id.as_str()],
            )
            .map_err(|e| EngineError::database(format!("Failed to invalidate: {}", e)))
        })
    }

    async fn remove_expired(&self, now_millis: u64) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM cache_entries WHERE expires_at <= ?1",
                params![now_millis as i64],
            )
            .map_err(|e| EngineError::database(format!("Failed to prune: {}", e)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbqa_core::{Chunk, FusedResult, RankedAnswerSet, RankedPassage, SourceMethods};

    fn entry(docs: &[(&str, Option<u64>)], expires_at: u64) -> CacheEntry {
        let chunk = Chunk::new(DocumentId::from("d1"), 0, "cached passage", 3);
        let passage = RankedPassage {
            result: FusedResult {
                chunk_id: chunk.id.clone(),
                fused_score: 1.0 / 61.0,
                source_methods: SourceMethods {
                    keyword: true,
                    vector: true,
                },
                keyword_rank: Some(1),
                vector_rank: Some(1),
                rerank_score: None,
            },
            chunk,
        };
        CacheEntry {
            payload: CachePayload::Retrieval(RankedAnswerSet {
                passages: vec![passage],
                corpus_version: 3,
            }),
            created_at: 100,
            expires_at,
            corpus_version: 3,
            dependencies: docs
                .iter()
                .map(|(d, v)| (DocumentId::from(*d), *v))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = SqliteCacheBackend::open_memory().unwrap();
        let saved = entry(&[("d1", Some(3)), ("d2", None)], 5_000);
        store.save(&CacheKey::new("k1"), &saved).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, CacheKey::new("k1"));
        assert_eq!(loaded[0].1, saved);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_dependencies() {
        let store = SqliteCacheBackend::open_memory().unwrap();
        let key = CacheKey::new("k1");
        store.save(&key, &entry(&[("d1", Some(3))], 5_000)).await.unwrap();
        store.save(&key, &entry(&[("d2", Some(4))], 5_000)).await.unwrap();

        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.remove_for_document(&DocumentId::from("d1")).await.unwrap(), 0);
        assert_eq!(store.remove_for_document(&DocumentId::from("d2")).await.unwrap(), 1);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_and_prune() {
        let store = SqliteCacheBackend::open_memory().unwrap();
        store.save(&CacheKey::new("a"), &entry(&[], 1_000)).await.unwrap();
        store.save(&CacheKey::new("b"), &entry(&[], 2_000)).await.unwrap();
        store.save(&CacheKey::new("c"), &entry(&[], 3_000)).await.unwrap();

        assert_eq!(store.remove_expired(2_000).await.unwrap(), 2);
        assert_eq!(store.remove(&[CacheKey::new("c"), CacheKey::new("zz")]).await.unwrap(), 1);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupted_rows_are_dropped() {
        let store = SqliteCacheBackend::open_memory().unwrap();
        store.save(&CacheKey::new("good"), &entry(&[("d1", Some(3))], 5_000)).await.unwrap();
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO cache_entries VALUES ('bad', 'retrieval', '{not json', 1, 1, 9999)",
                    [],
                )
                .map_err(|e| EngineError::database(e.to_string()))
            })
            .unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, CacheKey::new("good"));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reopen_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("kbqa.db");
        {
            let store = SqliteCacheBackend::open(&path).unwrap();
            store.save(&CacheKey::new("k1"), &entry(&[], 5_000)).await.unwrap();
        }
        let store = SqliteCacheBackend::open(&path).unwrap();
        assert_eq!(store.load().await.unwrap().len(), 1);
    }
}
