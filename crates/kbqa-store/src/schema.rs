//! Database schema definitions.

/// Cache persistence schema.
pub const SCHEMA: &str = r#"
-- One row per cached result
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    corpus_version INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_expires_at ON cache_entries(expires_at);

-- Document versions each entry was built against
CREATE TABLE IF NOT EXISTS cache_dependencies (
    key TEXT NOT NULL REFERENCES cache_entries(key) ON DELETE CASCADE,
    document_id TEXT NOT NULL,
    version INTEGER,
    PRIMARY KEY (key, document_id)
);

CREATE INDEX IF NOT EXISTS idx_cache_dependencies_document ON cache_dependencies(document_id);

-- Schema bookkeeping
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Schema version for migrations.
pub const SCHEMA_VERSION: u32 = 1;
