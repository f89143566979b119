//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the ledger database.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Every item ever discovered, keyed by canonical identity
CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    source TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'document',
    state TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    discovered_at TEXT NOT NULL,
    fetched_at TEXT,
    processed_at TEXT,
    last_checked_at TEXT,
    updated_at TEXT NOT NULL,
    http_status INTEGER,
    etag TEXT,
    last_modified TEXT,
    content_hash TEXT,
    similarity_signature BLOB,
    failure_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    skip_reason TEXT,
    duplicate_of TEXT
);

CREATE INDEX IF NOT EXISTS idx_items_source_state ON items(source, state);
CREATE INDEX IF NOT EXISTS idx_items_content_hash ON items(source, content_hash);

-- Append-only fetch history
CREATE TABLE IF NOT EXISTS fetches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_key TEXT NOT NULL REFERENCES items(key),
    fetched_at TEXT NOT NULL,
    http_status INTEGER NOT NULL,
    etag TEXT,
    last_modified TEXT,
    content_hash TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_fetches_item ON fetches(item_key);

-- Collection campaigns
CREATE TABLE IF NOT EXISTS campaigns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    start_date TEXT NOT NULL,
    duration_secs INTEGER NOT NULL,
    end_date TEXT,
    config_snapshot TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- At most one active campaign
CREATE UNIQUE INDEX IF NOT EXISTS idx_campaigns_single_active
    ON campaigns(status) WHERE status = 'active';

-- Runs per source
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    status TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_source ON runs(source, status);

-- Persist rate states for resumption
CREATE TABLE IF NOT EXISTS rate_states (
    source TEXT PRIMARY KEY,
    backoff_level INTEGER NOT NULL DEFAULT 0,
    backoff_until TEXT,
    last_request_at TEXT,
    window_started_at TEXT,
    window_count INTEGER NOT NULL DEFAULT 0
);

-- Per-source execution leases, times in unix milliseconds
CREATE TABLE IF NOT EXISTS source_locks (
    source TEXT PRIMARY KEY,
    token TEXT NOT NULL,
    holder TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

/// Current schema version, stored in `PRAGMA user_version`
pub const SCHEMA_VERSION: u32 = 1;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

/// Reads the schema version recorded in the database
pub fn get_schema_version(conn: &rusqlite::Connection) -> Result<u32, rusqlite::Error> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}
