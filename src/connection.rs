//! # Connection Factory
//!
//! The SQLite engine never opens connections on its own. It asks a
//! [`ConnectionFactory`] for a write-capable ("master") or read-only
//! ("replica") handle, passing an optional [`ShardId`]. Connections are
//! owned by the thread that asked for them and passed explicitly to every
//! query; there is no ambient or thread-local connection state.
//!
//! ## Shards
//!
//! Each reader thread serves one shard. A stream's [`StreamHash`] picks its
//! shard, so every stream-scoped read of that stream lands on the same
//! replica. The master serves every shard and is opened without a hint.
//!
//! Open failures that mean "try again later" (busy, locked, cannot open) are
//! surfaced as [`Error::StorageUnavailable`] so callers can tell them apart
//! from real faults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use crate::error::{Error, ErrorKind, Result};
use crate::schema::apply_pragmas;
use crate::types::StreamHash;

/// A reader shard, derived from a stream hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardId(usize);

impl ShardId {
    /// The shard with the given index.
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Maps a stream hash onto one of `shards` shards.
    pub fn for_stream(hash: StreamHash, shards: usize) -> Self {
        Self((hash.as_raw() as u64 % shards.max(1) as u64) as usize)
    }

    /// Position of this shard.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Opens SQLite connections for the engine.
pub trait ConnectionFactory: Send + Sync {
    /// Opens a read-write connection.
    fn open_master(&self, shard: Option<ShardId>) -> Result<Connection>;

    /// Opens a read-only connection.
    fn open_replica(&self, shard: Option<ShardId>) -> Result<Connection>;
}

/// Opens every connection against one database file.
///
/// A single file holds every shard, so the hint only shows up in the logs.
#[derive(Debug, Clone)]
pub struct SqliteConnectionFactory {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteConnectionFactory {
    /// Creates a factory for the database at `path`.
    pub fn new(path: impl AsRef<Path>, busy_timeout: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout,
        }
    }

    /// The database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConnectionFactory for SqliteConnectionFactory {
    fn open_master(&self, shard: Option<ShardId>) -> Result<Connection> {
        debug!(path = %self.path.display(), ?shard, "opening master connection");
        let conn = Connection::open(&self.path).map_err(|e| classify_open_error(&self.path, e))?;
        conn.busy_timeout(self.busy_timeout)?;
        apply_pragmas(&conn)?;
        Ok(conn)
    }

    fn open_replica(&self, shard: Option<ShardId>) -> Result<Connection> {
        debug!(path = %self.path.display(), ?shard, "opening replica connection");
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| classify_open_error(&self.path, e))?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }
}

/// Maps an open failure to `StorageUnavailable` when it is transient.
fn classify_open_error(path: &Path, err: rusqlite::Error) -> Error {
    let err = Error::from(err);
    if err.kind() == ErrorKind::Unavailable {
        Error::StorageUnavailable(format!("cannot open '{}': {}", path.display(), err))
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_then_replica() {
        let dir = tempfile::TempDir::new().unwrap();
        let factory = SqliteConnectionFactory::new(dir.path().join("f.db"), Duration::from_secs(1));

        let master = factory.open_master(None).unwrap();
        master.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();

        let replica = factory.open_replica(Some(ShardId::new(0))).unwrap();
        let count: i64 = replica
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert!(replica.execute("INSERT INTO t VALUES (1)", []).is_err());
    }

    #[test]
    fn test_stream_shard_is_stable_and_in_range() {
        use crate::types::StreamId;

        for name in ["order-1", "order-2", "customer-9", ""] {
            let hash = StreamId::new(name).hash();
            let shard = ShardId::for_stream(hash, 3);
            assert!(shard.index() < 3);
            assert_eq!(shard, ShardId::for_stream(hash, 3));
        }
        assert_eq!(ShardId::for_stream(StreamHash::from_raw(-1), 1).index(), 0);
        assert_eq!(ShardId::for_stream(StreamHash::from_raw(7), 0).index(), 0);
    }

    #[test]
    fn test_missing_directory_is_unavailable() {
        let dir = tempfile::TempDir::new().unwrap();
        let factory = SqliteConnectionFactory::new(
            dir.path().join("no-such-dir").join("f.db"),
            Duration::from_secs(1),
        );

        let err = factory.open_master(None).unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable(_)));
    }
}
