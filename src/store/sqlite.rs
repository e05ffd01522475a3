//! SQLite-backed standup store.
//!
//! One database file holds standups, items, posts and delivery state.
//! Reads that build a [`StandupAggregate`] run inside a single transaction
//! so the schedule and item set come from one consistent snapshot.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, info, warn};

use super::schema::{apply_schema, read_schema_version};
use crate::error::{Result, StandupError};
use crate::model::{
    Item, ItemChanges, ItemDraft, ItemId, Post, PostId, Standup, StandupDraft, StandupId,
};
use crate::standup::{DigestPayload, StandupAggregate};
use crate::timezone::Clock;

const STANDUP_COLUMNS: &str = "id, title, to_address, subject_prefix, closing_message, \
     time_zone_name, start_time_string, image_urls, image_days";
const ITEM_COLUMNS: &str = "id, standup_id, post_id, kind, title, author, date";
const POST_COLUMNS: &str = "id, standup_id, title, sent_at, created_at";

/// How long a writer waits on another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A sent post whose digest has not reached the mailer yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelivery {
    /// Sent post.
    pub post_id: PostId,
    /// Owning standup.
    pub standup_id: StandupId,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Message of the last failure.
    pub last_error: Option<String>,
}

/// SQLite-backed store.
///
/// Thread-safe via an internal `Mutex<Connection>`; state transitions use
/// immediate transactions so other processes sharing the file serialize too.
pub struct SqliteStandupStore {
    conn: Mutex<Connection>,
}

impl SqliteStandupStore {
    /// Open (or create) the database at `path`, applying the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        debug!("opened standup store at {}", path.display());
        Self::from_connection(conn)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Schema version recorded in the database.
    pub fn schema_version(&self) -> Result<Option<u32>> {
        let conn = self.lock()?;
        Ok(read_schema_version(&conn)?)
    }

    // -- Standups ----------------------------------------------------------

    /// Validate and insert a standup.
    ///
    /// # Errors
    ///
    /// [`StandupError::Validation`] with every failing field; nothing is written.
    pub fn create_standup(&self, draft: &StandupDraft) -> Result<Standup> {
        draft.validate()?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO standups (title, to_address, subject_prefix, closing_message, \
             time_zone_name, start_time_string, image_urls, image_days) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                draft.title,
                draft.to_address,
                draft.subject_prefix,
                draft.closing_message,
                draft.time_zone_name,
                draft.start_time_string,
                json_list(&draft.image_urls),
                json_list(&draft.image_days),
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!(standup_id = id, title = %draft.title, "created standup");
        load_standup(&conn, id)
    }

    /// Validate and replace the editable fields of a standup.
    pub fn update_standup(&self, id: StandupId, draft: &StandupDraft) -> Result<Standup> {
        draft.validate()?;
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE standups SET title = ?1, to_address = ?2, subject_prefix = ?3, \
             closing_message = ?4, time_zone_name = ?5, start_time_string = ?6, \
             image_urls = ?7, image_days = ?8 WHERE id = ?9",
            params![
                draft.title,
                draft.to_address,
                draft.subject_prefix,
                draft.closing_message,
                draft.time_zone_name,
                draft.start_time_string,
                json_list(&draft.image_urls),
                json_list(&draft.image_days),
                id,
            ],
        )?;
        if rows == 0 {
            return Err(StandupError::not_found("standup", id));
        }
        load_standup(&conn, id)
    }

    /// Fetch a standup.
    pub fn get_standup(&self, id: StandupId) -> Result<Standup> {
        let conn = self.lock()?;
        load_standup(&conn, id)
    }

    /// All standups in creation order.
    pub fn list_standups(&self) -> Result<Vec<Standup>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STANDUP_COLUMNS} FROM standups ORDER BY id"
        ))?;
        let rows = stmt.query_map([], row_to_standup)?;
        let mut standups = Vec::new();
        for r in rows {
            standups.push(r?);
        }
        Ok(standups)
    }

    /// Delete a standup with all of its items and posts in one transaction.
    pub fn delete_standup(&self, id: StandupId) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let items = tx.execute("DELETE FROM items WHERE standup_id = ?1", params![id])?;
        let posts = tx.execute("DELETE FROM posts WHERE standup_id = ?1", params![id])?;
        let rows = tx.execute("DELETE FROM standups WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(StandupError::not_found("standup", id));
        }

        tx.commit()?;
        info!(standup_id = id, items, posts, "deleted standup");
        Ok(())
    }

    // -- Items -------------------------------------------------------------

    /// Validate and insert an item.
    ///
    /// With `post_id` set the item is attached to that post straight away;
    /// the post must belong to the same standup.
    pub fn create_item(&self, draft: &ItemDraft) -> Result<Item> {
        draft.validate()?;
        let conn = self.lock()?;
        ensure_standup_exists(&conn, draft.standup_id)?;
        if let Some(post_id) = draft.post_id {
            ensure_post_in_standup(&conn, post_id, draft.standup_id)?;
        }

        conn.execute(
            "INSERT INTO items (standup_id, post_id, kind, title, author, date) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                draft.standup_id,
                draft.post_id,
                draft.kind,
                draft.title,
                draft.author,
                format_date(draft.date),
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(item_id = id, standup_id = draft.standup_id, kind = %draft.kind, "created item");
        load_item(&conn, id)
    }

    /// Fetch an item.
    pub fn get_item(&self, id: ItemId) -> Result<Item> {
        let conn = self.lock()?;
        load_item(&conn, id)
    }

    /// Apply and validate a partial edit.
    pub fn update_item(&self, id: ItemId, changes: &ItemChanges) -> Result<Item> {
        let conn = self.lock()?;
        let draft = load_item(&conn, id)?.with_changes(changes);
        draft.validate()?;
        conn.execute(
            "UPDATE items SET kind = ?1, title = ?2, author = ?3, date = ?4 WHERE id = ?5",
            params![
                draft.kind,
                draft.title,
                draft.author,
                format_date(draft.date),
                id
            ],
        )?;
        load_item(&conn, id)
    }

    /// Delete an item.
    pub fn delete_item(&self, id: ItemId) -> Result<()> {
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM items WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(StandupError::not_found("item", id));
        }
        Ok(())
    }

    /// Items of a standup in creation order.
    pub fn list_items(&self, standup_id: StandupId) -> Result<Vec<Item>> {
        let conn = self.lock()?;
        ensure_standup_exists(&conn, standup_id)?;
        load_items(&conn, standup_id)
    }

    // -- Posts -------------------------------------------------------------

    /// Create an unsent post that items can be attached to.
    pub fn create_post(
        &self,
        standup_id: StandupId,
        title: &str,
        clock: &dyn Clock,
    ) -> Result<Post> {
        let conn = self.lock()?;
        ensure_standup_exists(&conn, standup_id)?;
        let id = insert_post(&conn, standup_id, title, clock.now())?;
        load_post(&conn, id)
    }

    /// Fetch a post.
    pub fn get_post(&self, id: PostId) -> Result<Post> {
        let conn = self.lock()?;
        load_post(&conn, id)
    }

    /// Posts of a standup in creation order.
    pub fn list_posts(&self, standup_id: StandupId) -> Result<Vec<Post>> {
        let conn = self.lock()?;
        ensure_standup_exists(&conn, standup_id)?;
        load_posts(&conn, standup_id)
    }

    // -- Aggregate and digests ---------------------------------------------

    /// Load a standup with its items and posts from one snapshot.
    pub fn load_aggregate(&self, standup_id: StandupId) -> Result<StandupAggregate> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let aggregate = load_aggregate(&tx, standup_id)?;
        tx.commit()?;
        Ok(aggregate)
    }

    /// Send today's digest if it is due.
    ///
    /// Within one immediate transaction: re-check that the standup is due
    /// and not yet sent today, take the newest unsent post (or create one),
    /// attach every pending item to it and stamp `sent_at`. Returns `None`
    /// when nothing is due, so concurrent callers cannot both send.
    pub fn send_digest(
        &self,
        standup_id: StandupId,
        clock: &dyn Clock,
    ) -> Result<Option<DigestPayload>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let aggregate = load_aggregate(&tx, standup_id)?;
        if !aggregate.is_due_now(clock) {
            debug!(standup_id, "digest not due");
            return Ok(None);
        }

        let now = clock.now();
        let post_id = match aggregate.posts().iter().rev().find(|p| p.sent_at.is_none()) {
            Some(post) => post.id,
            None => {
                let title = Post::title_for(aggregate.standup(), aggregate.zone().today(clock));
                insert_post(&tx, standup_id, &title, now)?
            }
        };

        let claimed = tx.execute(
            "UPDATE items SET post_id = ?1 WHERE standup_id = ?2 AND post_id IS NULL",
            params![post_id, standup_id],
        )?;
        tx.execute(
            "UPDATE posts SET sent_at = ?1 WHERE id = ?2",
            params![now.timestamp_millis(), post_id],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO deliveries (post_id) VALUES (?1)",
            params![post_id],
        )?;

        let aggregate = load_aggregate(&tx, standup_id)?;
        let post = load_post(&tx, post_id)?;
        tx.commit()?;

        info!(standup_id, post_id, claimed, "sent standup digest");
        Ok(Some(aggregate.payload_for_post(&post)))
    }

    /// Rebuild the digest of a stored post.
    pub fn payload_for_post(&self, post_id: PostId) -> Result<DigestPayload> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let post = load_post(&tx, post_id)?;
        let aggregate = load_aggregate(&tx, post.standup_id)?;
        tx.commit()?;
        Ok(aggregate.payload_for_post(&post))
    }

    /// Record the outcome of handing a sent post to the mailer.
    pub fn record_delivery(
        &self,
        post_id: PostId,
        outcome: std::result::Result<(), String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let rows = match outcome {
            Ok(()) => conn.execute(
                "UPDATE deliveries SET delivered_at = ?1, last_error = NULL WHERE post_id = ?2",
                params![at.timestamp_millis(), post_id],
            )?,
            Err(message) => {
                warn!(post_id, error = %message, "digest delivery failed");
                conn.execute(
                    "UPDATE deliveries SET attempts = attempts + 1, last_error = ?1 \
                     WHERE post_id = ?2",
                    params![message, post_id],
                )?
            }
        };
        if rows == 0 {
            return Err(StandupError::not_found("post", post_id));
        }
        Ok(())
    }

    /// Sent posts not yet delivered with fewer than `max_attempts` failures.
    pub fn pending_deliveries(&self, max_attempts: u32) -> Result<Vec<PendingDelivery>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT d.post_id, p.standup_id, d.attempts, d.last_error \
             FROM deliveries d JOIN posts p ON p.id = d.post_id \
             WHERE d.delivered_at IS NULL AND d.attempts < ?1 ORDER BY d.post_id",
        )?;
        let rows = stmt.query_map(params![max_attempts], |row| {
            Ok(PendingDelivery {
                post_id: row.get(0)?,
                standup_id: row.get(1)?,
                attempts: row.get(2)?,
                last_error: row.get(3)?,
            })
        })?;
        let mut pending = Vec::new();
        for r in rows {
            pending.push(r?);
        }
        Ok(pending)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StandupError::Lock(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Query helpers (work on a connection or a transaction)
// ---------------------------------------------------------------------------

fn load_aggregate(conn: &Connection, standup_id: StandupId) -> Result<StandupAggregate> {
    let standup = load_standup(conn, standup_id)?;
    let items = load_items(conn, standup_id)?;
    let posts = load_posts(conn, standup_id)?;
    StandupAggregate::new(standup, items, posts)
}

fn load_standup(conn: &Connection, id: StandupId) -> Result<Standup> {
    conn.query_row(
        &format!("SELECT {STANDUP_COLUMNS} FROM standups WHERE id = ?1"),
        params![id],
        row_to_standup,
    )
    .optional()?
    .ok_or_else(|| StandupError::not_found("standup", id))
}

fn load_item(conn: &Connection, id: ItemId) -> Result<Item> {
    conn.query_row(
        &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1"),
        params![id],
        row_to_item,
    )
    .optional()?
    .ok_or_else(|| StandupError::not_found("item", id))
}

fn load_post(conn: &Connection, id: PostId) -> Result<Post> {
    conn.query_row(
        &format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?1"),
        params![id],
        row_to_post,
    )
    .optional()?
    .ok_or_else(|| StandupError::not_found("post", id))
}

fn load_items(conn: &Connection, standup_id: StandupId) -> Result<Vec<Item>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ITEM_COLUMNS} FROM items WHERE standup_id = ?1 ORDER BY id"
    ))?;
    let rows = stmt.query_map(params![standup_id], row_to_item)?;
    let mut items = Vec::new();
    for r in rows {
        items.push(r?);
    }
    Ok(items)
}

fn load_posts(conn: &Connection, standup_id: StandupId) -> Result<Vec<Post>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {POST_COLUMNS} FROM posts WHERE standup_id = ?1 ORDER BY id"
    ))?;
    let rows = stmt.query_map(params![standup_id], row_to_post)?;
    let mut posts = Vec::new();
    for r in rows {
        posts.push(r?);
    }
    Ok(posts)
}

fn insert_post(
    conn: &Connection,
    standup_id: StandupId,
    title: &str,
    created_at: DateTime<Utc>,
) -> Result<PostId> {
    conn.execute(
        "INSERT INTO posts (standup_id, title, created_at) VALUES (?1, ?2, ?3)",
        params![standup_id, title, created_at.timestamp_millis()],
    )?;
    Ok(conn.last_insert_rowid())
}

fn ensure_standup_exists(conn: &Connection, id: StandupId) -> Result<()> {
    let found: Option<i64> = conn
        .query_row("SELECT id FROM standups WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    found
        .map(|_| ())
        .ok_or_else(|| StandupError::not_found("standup", id))
}

fn ensure_post_in_standup(conn: &Connection, post_id: PostId, standup_id: StandupId) -> Result<()> {
    let owner: Option<StandupId> = conn
        .query_row(
            "SELECT standup_id FROM posts WHERE id = ?1",
            params![post_id],
            |row| row.get(0),
        )
        .optional()?;
    match owner {
        Some(owner) if owner == standup_id => Ok(()),
        Some(_) => {
            let mut errors = crate::error::ValidationErrors::default();
            errors.add("post_id", "belongs to a different standup");
            Err(StandupError::Validation(errors))
        }
        None => Err(StandupError::not_found("post", post_id)),
    }
}

// ---------------------------------------------------------------------------
// Row conversion helpers
// ---------------------------------------------------------------------------

fn row_to_standup(row: &rusqlite::Row<'_>) -> rusqlite::Result<Standup> {
    let image_urls: String = row.get(7)?;
    let image_days: String = row.get(8)?;
    Ok(Standup {
        id: row.get(0)?,
        title: row.get(1)?,
        to_address: row.get(2)?,
        subject_prefix: row.get(3)?,
        closing_message: row.get(4)?,
        time_zone_name: row.get(5)?,
        start_time_string: row.get(6)?,
        image_urls: parse_list(7, &image_urls)?,
        image_days: parse_list(8, &image_days)?,
    })
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<Item> {
    let date: String = row.get(6)?;
    Ok(Item {
        id: row.get(0)?,
        standup_id: row.get(1)?,
        post_id: row.get(2)?,
        kind: row.get(3)?,
        title: row.get(4)?,
        author: row.get(5)?,
        date: parse_date(6, &date)?,
    })
}

fn row_to_post(row: &rusqlite::Row<'_>) -> rusqlite::Result<Post> {
    let sent_at: Option<i64> = row.get(3)?;
    let created_at: i64 = row.get(4)?;
    Ok(Post {
        id: row.get(0)?,
        standup_id: row.get(1)?,
        title: row.get(2)?,
        sent_at: sent_at.map(|ms| millis_to_utc(3, ms)).transpose()?,
        created_at: millis_to_utc(4, created_at)?,
    })
}

fn json_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_owned())
}

fn parse_list(idx: usize, raw: &str) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_date(idx: usize, raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn millis_to_utc(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}
