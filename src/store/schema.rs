//! SQLite DDL for the standup store.
//!
//! All `CREATE TABLE` / `CREATE INDEX` statements live here so they are
//! reviewable and testable in isolation.

use rusqlite::Connection;

/// Schema version written to `schema_meta` on first open.
pub(crate) const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Complete DDL. Uses `IF NOT EXISTS` throughout so `apply_schema` is idempotent.
pub(crate) const SCHEMA_SQL: &str = r#"
-- Enable WAL mode for concurrent reads during writes.
PRAGMA journal_mode = WAL;

-- Enforce foreign key constraints (per connection).
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS standups (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    title             TEXT NOT NULL,
    to_address        TEXT NOT NULL,
    subject_prefix    TEXT NOT NULL DEFAULT '',
    closing_message   TEXT NOT NULL DEFAULT '',
    time_zone_name    TEXT NOT NULL,
    start_time_string TEXT NOT NULL,
    image_urls        TEXT NOT NULL DEFAULT '[]',  -- JSON array of strings
    image_days        TEXT NOT NULL DEFAULT '[]'   -- JSON array of strings
);

CREATE TABLE IF NOT EXISTS posts (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    standup_id INTEGER NOT NULL REFERENCES standups(id) ON DELETE CASCADE,
    title      TEXT NOT NULL,
    sent_at    INTEGER,            -- epoch millis, NULL until sent
    created_at INTEGER NOT NULL    -- epoch millis
);

CREATE INDEX IF NOT EXISTS idx_posts_standup ON posts(standup_id, sent_at);

CREATE TABLE IF NOT EXISTS items (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    standup_id INTEGER NOT NULL REFERENCES standups(id) ON DELETE CASCADE,
    post_id    INTEGER REFERENCES posts(id) ON DELETE SET NULL,
    kind       TEXT NOT NULL,
    title      TEXT NOT NULL,
    author     TEXT NOT NULL DEFAULT '',
    date       TEXT NOT NULL       -- YYYY-MM-DD
);

CREATE INDEX IF NOT EXISTS idx_items_pending ON items(standup_id, post_id);

-- Mailer hand-off state for sent posts.
CREATE TABLE IF NOT EXISTS deliveries (
    post_id      INTEGER PRIMARY KEY REFERENCES posts(id) ON DELETE CASCADE,
    attempts     INTEGER NOT NULL DEFAULT 0,
    delivered_at INTEGER,          -- epoch millis
    last_error   TEXT
);
"#;

/// Apply the full schema to an open connection.
///
/// Safe to call multiple times. Seeds the schema version on a fresh database.
pub(crate) fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        rusqlite::params![CURRENT_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// Read the schema version, `None` if never seeded.
pub(crate) fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<u32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_meta WHERE key = 'schema_version'")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().ok())
        }
        None => Ok(None),
    }
}
