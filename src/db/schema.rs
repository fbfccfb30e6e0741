/// Schema for the local store. Every statement is idempotent so the batch can
/// run on every open.
pub const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- seq doubles as the rowid and breaks created_at ties
CREATE TABLE IF NOT EXISTS operation_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL,
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    body TEXT NOT NULL,
    idempotency_key TEXT,
    extra_headers TEXT NOT NULL DEFAULT '{}',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_attempt_at TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'completed', 'failed_permanent'))
);

CREATE INDEX IF NOT EXISTS idx_operation_queue_order
    ON operation_queue(status, created_at, seq);

CREATE TABLE IF NOT EXISTS cache_items (
    key TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Bumped whenever `SCHEMA` changes shape.
pub const SCHEMA_VERSION: u32 = 1;
