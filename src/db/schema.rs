/// Schema for the key-value cache table.
pub const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache (
    hash TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    expire INTEGER NOT NULL,
    info TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_cache_expire ON cache(expire);
"#;

/// Schema for the offline model mirror.
pub const OFFLINE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS offline_mirror (
    adapter TEXT NOT NULL,
    id TEXT NOT NULL,
    data BLOB NOT NULL,
    offline INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (adapter, id)
);

CREATE INDEX IF NOT EXISTS idx_offline_pending ON offline_mirror(adapter, offline);
"#;
