//! # SQLite Schema for SpiteStore
//!
//! This module defines the database schema and handles initialization.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  commits                              stream_heads                      │
//! │  ┌──────────────────────────┐         ┌─────────────────────────┐       │
//! │  │ checkpoint_number (PK)   │         │ bucket_id, stream_id(PK)│       │
//! │  │ bucket_id, stream_id ────┼────────►│ head_revision           │       │
//! │  │ stream_revision, items   │         │ snapshot_revision       │       │
//! │  │ commit_sequence (UNIQUE) │         └─────────────────────────┘       │
//! │  │ commit_id       (UNIQUE) │                                           │
//! │  │ dispatched, recycled     │         snapshots                         │
//! │  │ headers, payload BLOB    │         ┌─────────────────────────┐       │
//! │  └──────────────────────────┘         │ bucket, stream, rev (PK)│       │
//! │                                       │ payload BLOB            │       │
//! │                                       └─────────────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why two unique indexes on `commits`?
//!
//! Optimistic concurrency is enforced by the database, not by a lock:
//! - `(bucket_id, stream_id, commit_sequence)` lets exactly one writer claim
//!   each sequence number
//! - `(bucket_id, stream_id, commit_id)` makes a replayed attempt fail instead
//!   of landing twice
//!
//! When an insert trips either index the writer re-reads the row to tell a
//! duplicate from a conflict.
//!
//! ### Why `AUTOINCREMENT`?
//!
//! Plain `INTEGER PRIMARY KEY` may hand out the rowid of a deleted row again.
//! `AUTOINCREMENT` guarantees checkpoint numbers are never reused, even after
//! a purge.
//!
//! ### Why partial indexes?
//!
//! Deleted streams are soft-deleted (`recycled = 1`). Restricting the unique
//! indexes to live rows lets a deleted stream id be reused from sequence 1.

use rusqlite::Connection;

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// Table Definitions
// =============================================================================

/// Commits table: one row per persisted commit.
///
/// `items` is the number of events in the commit, so the first revision is
/// `stream_revision - items + 1` without decoding the payload.
const CREATE_COMMITS: &str = r#"
CREATE TABLE IF NOT EXISTS commits (
    checkpoint_number INTEGER PRIMARY KEY AUTOINCREMENT,
    bucket_id TEXT NOT NULL,
    stream_id TEXT NOT NULL,
    stream_hash INTEGER NOT NULL,
    stream_revision INTEGER NOT NULL CHECK (stream_revision > 0),
    items INTEGER NOT NULL CHECK (items > 0),
    commit_id TEXT NOT NULL,
    commit_sequence INTEGER NOT NULL CHECK (commit_sequence > 0),
    commit_stamp INTEGER NOT NULL,
    dispatched INTEGER NOT NULL DEFAULT 0,
    recycled INTEGER NOT NULL DEFAULT 0,
    headers BLOB NOT NULL,
    payload BLOB NOT NULL,
    checksum BLOB NOT NULL
)
"#;

/// At most one live commit per (bucket, stream, sequence).
const CREATE_COMMITS_SEQUENCE_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS ix_commits_sequence
ON commits(bucket_id, stream_id, commit_sequence)
WHERE recycled = 0
"#;

/// At most one live commit per (bucket, stream, commit id).
const CREATE_COMMITS_COMMIT_ID_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS ix_commits_commit_id
ON commits(bucket_id, stream_id, commit_id)
WHERE recycled = 0
"#;

/// Range-overlap reads by revision.
const CREATE_COMMITS_REVISION_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS ix_commits_revision
ON commits(bucket_id, stream_id, stream_revision)
"#;

/// Recovery scan for commits whose dispatch marker never got set.
const CREATE_COMMITS_DISPATCH_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS ix_commits_undispatched
ON commits(checkpoint_number)
WHERE dispatched = 0 AND recycled = 0
"#;

/// Stream heads: highest committed and snapshotted revision per stream.
const CREATE_STREAM_HEADS: &str = r#"
CREATE TABLE IF NOT EXISTS stream_heads (
    bucket_id TEXT NOT NULL,
    stream_id TEXT NOT NULL,
    stream_hash INTEGER NOT NULL,
    head_revision INTEGER NOT NULL,
    snapshot_revision INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (bucket_id, stream_id)
) WITHOUT ROWID
"#;

/// Snapshots: one row per (bucket, stream, revision). Writes are upserts.
const CREATE_SNAPSHOTS: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    bucket_id TEXT NOT NULL,
    stream_id TEXT NOT NULL,
    stream_revision INTEGER NOT NULL,
    payload BLOB NOT NULL,
    checksum BLOB NOT NULL,
    PRIMARY KEY (bucket_id, stream_id, stream_revision)
) WITHOUT ROWID
"#;

/// Metadata table: schema version and other settings.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS spitestore_metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// Tables in drop order.
const TABLES: [&str; 4] = ["commits", "stream_heads", "snapshots", "spitestore_metadata"];

// =============================================================================
// Schema Operations
// =============================================================================

/// Sets the pragmas every read-write connection runs with.
pub fn apply_pragmas(conn: &Connection) -> Result<()> {
    // WAL mode: reader connections see a consistent snapshot while the
    // writer appends.
    conn.execute_batch("PRAGMA journal_mode = WAL")?;
    // Sync WAL on commit, but not every write.
    conn.execute_batch("PRAGMA synchronous = NORMAL")?;
    conn.execute_batch("PRAGMA foreign_keys = ON")?;
    Ok(())
}

/// Creates all tables and indexes if missing, then checks the schema version.
///
/// Idempotent: safe to call on an already-initialized database.
pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_METADATA)?;
    conn.execute_batch(CREATE_COMMITS)?;
    conn.execute_batch(CREATE_COMMITS_SEQUENCE_INDEX)?;
    conn.execute_batch(CREATE_COMMITS_COMMIT_ID_INDEX)?;
    conn.execute_batch(CREATE_COMMITS_REVISION_INDEX)?;
    conn.execute_batch(CREATE_COMMITS_DISPATCH_INDEX)?;
    conn.execute_batch(CREATE_STREAM_HEADS)?;
    conn.execute_batch(CREATE_SNAPSHOTS)?;

    verify_or_set_version(conn)
}

/// Drops every SpiteStore table.
pub fn drop_tables(conn: &Connection) -> Result<()> {
    for table in TABLES {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {table}"))?;
    }
    Ok(())
}

/// Verifies the schema version, or sets it if this is a new database.
fn verify_or_set_version(conn: &Connection) -> Result<()> {
    let existing: Option<i32> = conn
        .query_row(
            "SELECT value FROM spitestore_metadata WHERE key = 'schema_version'",
            [],
            |row| {
                let s: String = row.get(0)?;
                Ok(s.parse().unwrap_or(0))
            },
        )
        .ok();

    match existing {
        None => {
            conn.execute(
                "INSERT INTO spitestore_metadata (key, value) VALUES ('schema_version', ?)",
                [SCHEMA_VERSION.to_string()],
            )?;
        }
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) => {
            return Err(Error::Schema(format!(
                "schema version mismatch: database has version {v}, but this SpiteStore version requires {SCHEMA_VERSION}"
            )));
        }
    }

    Ok(())
}

// =============================================================================
// Database Handle
// =============================================================================

/// An initialized SQLite database.
///
/// Used directly by tests and tools; the engine itself opens connections
/// through a [`ConnectionFactory`](crate::connection::ConnectionFactory).
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        initialize(&conn)?;
        Ok(Self { conn })
    }

    /// Creates an in-memory database for testing.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        initialize(&conn)?;
        Ok(Self { conn })
    }

    /// Returns a reference to the underlying SQLite connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Consumes the handle and returns the connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<String>, _>>()
            .unwrap()
    }

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(
            table_names(db.connection()),
            vec!["commits", "snapshots", "spitestore_metadata", "stream_heads"]
        );
    }

    #[test]
    fn test_indexes_created() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name LIKE 'ix_commits_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn test_schema_version_stored() {
        let db = Database::open_in_memory().unwrap();
        let version: String = db
            .connection()
            .query_row(
                "SELECT value FROM spitestore_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());
    }

    #[test]
    fn test_double_initialization() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("twice.db");

        drop(Database::open(&path).unwrap());
        let db = Database::open(&path).unwrap();
        initialize(db.connection()).unwrap();
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.connection()
            .execute(
                "UPDATE spitestore_metadata SET value = '99' WHERE key = 'schema_version'",
                [],
            )
            .unwrap();

        assert!(matches!(initialize(db.connection()), Err(Error::Schema(_))));
    }

    #[test]
    fn test_drop_tables() {
        let db = Database::open_in_memory().unwrap();
        drop_tables(db.connection()).unwrap();
        assert!(table_names(db.connection()).is_empty());
    }
}
