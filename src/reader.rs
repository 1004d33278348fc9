//! # Commit Reader
//!
//! Read operations for the SQLite engine. Each reader thread owns a read-only
//! connection; WAL mode means readers always see the latest committed batch
//! without blocking the writer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Reader Pool                               │
//! │                                                                 │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────┐             │
//! │  │Reader 1 │  │Reader 2 │  │Reader 3 │  │Reader N │             │
//! │  │(thread) │  │(thread) │  │(thread) │  │(thread) │             │
//! │  └────┬────┘  └────┬────┘  └────┬────┘  └────┬────┘             │
//! │       └────────────┴─────┬──────┴────────────┘                  │
//! │            one shard and one read-only connection each          │
//! └──────────────────────────┬──────────────────────────────────────┘
//!                            ▼
//!                     ┌─────────────┐
//!                     │   SQLite    │
//!                     │   (WAL)     │
//!                     └─────────────┘
//! ```
//!
//! ## Paging
//!
//! Every multi-row query is issued in pages of `page_size` rows, keyed on the
//! last row seen (sequence, checkpoint or stream id). Callers get one
//! concatenated result and never observe the page boundaries.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::codec::{decode_commit, decode_snapshot_payload, CommitRow};
use crate::commit::{Commit, Snapshot, StreamHead};
use crate::error::Result;
use crate::serialization::Serializer;
use crate::types::{BucketId, CheckpointToken, CommitSequence, StreamId, StreamRev};

/// Default number of rows fetched per page.
pub const DEFAULT_PAGE_SIZE: usize = 128;

const COMMIT_COLUMNS: &str = "bucket_id, stream_id, stream_revision, commit_id, commit_sequence,
     commit_stamp, checkpoint_number, headers, payload, checksum";

// =============================================================================
// Request Types
// =============================================================================

/// Request type for read operations.
pub enum ReadRequest {
    /// Commits of one stream overlapping a revision window.
    StreamCommits {
        bucket_id: BucketId,
        stream_id: StreamId,
        min_revision: StreamRev,
        max_revision: StreamRev,
        response: oneshot::Sender<Result<Vec<Commit>>>,
    },
    /// Commits in checkpoint order, optionally bounded and bucket-scoped.
    CheckpointCommits {
        bucket_id: Option<BucketId>,
        from: CheckpointToken,
        to: Option<CheckpointToken>,
        response: oneshot::Sender<Result<Vec<Commit>>>,
    },
    /// One bounded page of the feed.
    CheckpointPage {
        bucket_id: Option<BucketId>,
        from: CheckpointToken,
        limit: usize,
        response: oneshot::Sender<Result<Vec<Commit>>>,
    },
    /// Snapshot candidates.
    StreamsToSnapshot {
        bucket_id: BucketId,
        max_threshold: u64,
        response: oneshot::Sender<Result<Vec<StreamHead>>>,
    },
    /// Latest snapshot at or before a revision.
    Snapshot {
        bucket_id: BucketId,
        stream_id: StreamId,
        max_revision: StreamRev,
        response: oneshot::Sender<Result<Option<Snapshot>>>,
    },
    /// Commits whose dispatch marker is unset.
    Undispatched {
        response: oneshot::Sender<Result<Vec<Commit>>>,
    },
    /// Shutdown the reader.
    Shutdown,
}

// =============================================================================
// Direct Read Functions
// =============================================================================

fn commit_row(row: &Row<'_>) -> rusqlite::Result<CommitRow> {
    Ok(CommitRow {
        bucket_id: row.get(0)?,
        stream_id: row.get(1)?,
        stream_revision: row.get(2)?,
        commit_id: row.get(3)?,
        commit_sequence: row.get(4)?,
        commit_stamp_ms: row.get(5)?,
        checkpoint: row.get(6)?,
        headers: row.get(7)?,
        payload: row.get(8)?,
        checksum: row.get(9)?,
    })
}

/// Fetches pages until one comes back short.
fn collect_pages<T>(
    page_size: usize,
    mut fetch: impl FnMut(Option<&T>, usize) -> Result<Vec<T>>,
) -> Result<Vec<T>> {
    let page_size = page_size.max(1);
    let mut all: Vec<T> = Vec::new();

    loop {
        let page = fetch(all.last(), page_size)?;
        let done = page.len() < page_size;
        all.extend(page);
        if done {
            return Ok(all);
        }
    }
}

/// Reads every live commit of a stream that overlaps `min..=max`.
///
/// A commit overlaps when it ends at or after `min` and starts at or before
/// `max`. Results are ascending by commit sequence.
pub fn read_stream_commits(
    conn: &Connection,
    serializer: &dyn Serializer,
    bucket_id: &BucketId,
    stream_id: &StreamId,
    min_revision: StreamRev,
    max_revision: StreamRev,
    page_size: usize,
) -> Result<Vec<Commit>> {
    let sql = format!(
        "SELECT {COMMIT_COLUMNS} FROM commits
         WHERE bucket_id = ?1 AND stream_id = ?2 AND recycled = 0
           AND stream_revision >= ?3 AND (stream_revision - items) < ?4
           AND commit_sequence > ?5
         ORDER BY commit_sequence
         LIMIT ?6"
    );
    let mut stmt = conn.prepare_cached(&sql)?;

    collect_pages(page_size, |last: Option<&Commit>, limit| {
        let after = last.map(|c| c.commit_sequence).unwrap_or(CommitSequence::NONE);
        let rows = stmt
            .query_map(
                params![
                    bucket_id.as_str(),
                    stream_id.as_str(),
                    min_revision.to_sql(),
                    max_revision.to_sql(),
                    after.as_raw() as i64,
                    limit as i64,
                ],
                commit_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|row| decode_commit(row, serializer))
            .collect()
    })
}

/// Reads live commits with `from < checkpoint <= to`, ascending.
///
/// `to = None` reads to the end of the feed; `bucket_id = None` spans every
/// bucket.
pub fn read_commits_from(
    conn: &Connection,
    serializer: &dyn Serializer,
    bucket_id: Option<&BucketId>,
    from: CheckpointToken,
    to: Option<CheckpointToken>,
    page_size: usize,
) -> Result<Vec<Commit>> {
    let sql = format!(
        "SELECT {COMMIT_COLUMNS} FROM commits
         WHERE checkpoint_number > ?1 AND checkpoint_number <= ?2 AND recycled = 0
           AND (?3 IS NULL OR bucket_id = ?3)
         ORDER BY checkpoint_number
         LIMIT ?4"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let upper = to.map(|t| t.as_raw()).unwrap_or(i64::MAX);
    let bucket = bucket_id.map(|b| b.as_str());

    let commits = collect_pages(page_size, |last: Option<&Commit>, limit| {
        let after = last.map(|c| c.checkpoint).unwrap_or(from);
        let rows = stmt
            .query_map(
                params![after.as_raw(), upper, bucket, limit as i64],
                commit_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|row| decode_commit(row, serializer))
            .collect()
    })?;

    debug!(from = %from, count = commits.len(), "read checkpoint feed");
    Ok(commits)
}

/// Reads at most `limit` live commits after `from`, ascending by checkpoint.
pub fn read_commit_page(
    conn: &Connection,
    serializer: &dyn Serializer,
    bucket_id: Option<&BucketId>,
    from: CheckpointToken,
    limit: usize,
) -> Result<Vec<Commit>> {
    let sql = format!(
        "SELECT {COMMIT_COLUMNS} FROM commits
         WHERE checkpoint_number > ?1 AND recycled = 0
           AND (?2 IS NULL OR bucket_id = ?2)
         ORDER BY checkpoint_number
         LIMIT ?3"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(
            params![from.as_raw(), bucket_id.map(|b| b.as_str()), limit as i64],
            commit_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|row| decode_commit(row, serializer))
        .collect()
}

/// Reads live commits whose dispatch marker is unset, ascending by checkpoint.
pub fn read_undispatched(
    conn: &Connection,
    serializer: &dyn Serializer,
    page_size: usize,
) -> Result<Vec<Commit>> {
    let sql = format!(
        "SELECT {COMMIT_COLUMNS} FROM commits
         WHERE dispatched = 0 AND recycled = 0 AND checkpoint_number > ?1
         ORDER BY checkpoint_number
         LIMIT ?2"
    );
    let mut stmt = conn.prepare_cached(&sql)?;

    collect_pages(page_size, |last: Option<&Commit>, limit| {
        let after = last.map(|c| c.checkpoint).unwrap_or(CheckpointToken::START);
        let rows = stmt
            .query_map(params![after.as_raw(), limit as i64], commit_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|row| decode_commit(row, serializer))
            .collect()
    })
}

/// Reads streams of a bucket with at least `max_threshold` unsnapshotted events.
pub fn read_streams_to_snapshot(
    conn: &Connection,
    bucket_id: &BucketId,
    max_threshold: u64,
    page_size: usize,
) -> Result<Vec<StreamHead>> {
    let mut stmt = conn.prepare_cached(
        "SELECT stream_id, head_revision, snapshot_revision FROM stream_heads
         WHERE bucket_id = ?1 AND head_revision - snapshot_revision >= ?2 AND stream_id > ?3
         ORDER BY stream_id
         LIMIT ?4",
    )?;

    collect_pages(page_size, |last: Option<&StreamHead>, limit| {
        let after = last.map(|h| h.stream_id.as_str()).unwrap_or("");
        let heads = stmt
            .query_map(
                params![bucket_id.as_str(), max_threshold as i64, after, limit as i64],
                |row| {
                    let stream_id: String = row.get(0)?;
                    let head_revision: i64 = row.get(1)?;
                    let snapshot_revision: i64 = row.get(2)?;
                    Ok(StreamHead {
                        bucket_id: bucket_id.clone(),
                        stream_id: StreamId::new(stream_id),
                        head_revision: StreamRev::from_raw(head_revision as u64),
                        snapshot_revision: StreamRev::from_raw(snapshot_revision as u64),
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(heads)
    })
}

/// Reads the most recent snapshot at or before `max_revision`.
pub fn read_snapshot(
    conn: &Connection,
    serializer: &dyn Serializer,
    bucket_id: &BucketId,
    stream_id: &StreamId,
    max_revision: StreamRev,
) -> Result<Option<Snapshot>> {
    let row: Option<(i64, Vec<u8>, Vec<u8>)> = conn
        .query_row(
            "SELECT stream_revision, payload, checksum FROM snapshots
             WHERE bucket_id = ? AND stream_id = ? AND stream_revision <= ?
             ORDER BY stream_revision DESC
             LIMIT 1",
            params![
                bucket_id.as_str(),
                stream_id.as_str(),
                max_revision.to_sql()
            ],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    row.map(|(revision, blob, checksum)| {
        Ok(Snapshot {
            bucket_id: bucket_id.clone(),
            stream_id: stream_id.clone(),
            stream_revision: StreamRev::from_raw(revision as u64),
            payload: decode_snapshot_payload(&blob, &checksum, serializer)?,
        })
    })
    .transpose()
}

// =============================================================================
// Reader Loop
// =============================================================================

/// Reader loop for one shard.
///
/// Each thread owns its channel and its read-only connection, so shards
/// query in parallel. The loop ends on `Shutdown` or when every sender is
/// gone.
pub fn run_reader(
    conn: Connection,
    serializer: Arc<dyn Serializer>,
    page_size: usize,
    mut rx: mpsc::Receiver<ReadRequest>,
) {
    let serializer = serializer.as_ref();

    loop {
        match rx.blocking_recv() {
            Some(ReadRequest::StreamCommits {
                bucket_id,
                stream_id,
                min_revision,
                max_revision,
                response,
            }) => {
                let result = read_stream_commits(
                    &conn,
                    serializer,
                    &bucket_id,
                    &stream_id,
                    min_revision,
                    max_revision,
                    page_size,
                );
                let _ = response.send(result);
            }
            Some(ReadRequest::CheckpointCommits {
                bucket_id,
                from,
                to,
                response,
            }) => {
                let result =
                    read_commits_from(&conn, serializer, bucket_id.as_ref(), from, to, page_size);
                let _ = response.send(result);
            }
            Some(ReadRequest::CheckpointPage {
                bucket_id,
                from,
                limit,
                response,
            }) => {
                let result = read_commit_page(&conn, serializer, bucket_id.as_ref(), from, limit);
                let _ = response.send(result);
            }
            Some(ReadRequest::StreamsToSnapshot {
                bucket_id,
                max_threshold,
                response,
            }) => {
                let result = read_streams_to_snapshot(&conn, &bucket_id, max_threshold, page_size);
                let _ = response.send(result);
            }
            Some(ReadRequest::Snapshot {
                bucket_id,
                stream_id,
                max_revision,
                response,
            }) => {
                let result = read_snapshot(&conn, serializer, &bucket_id, &stream_id, max_revision);
                let _ = response.send(result);
            }
            Some(ReadRequest::Undispatched { response }) => {
                let result = read_undispatched(&conn, serializer, page_size);
                let _ = response.send(result);
            }
            Some(ReadRequest::Shutdown) | None => break,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_commit;
    use crate::commit::{CommitAttempt, EventMessage, Payload};
    use crate::schema::Database;
    use crate::serialization::JsonSerializer;
    use crate::types::CommitId;
    use serde_json::json;

    fn setup_test_db() -> Connection {
        Database::open_in_memory().unwrap().into_connection()
    }

    /// Inserts a commit row directly, bypassing the writer.
    fn insert_commit(conn: &Connection, bucket: &str, stream: &str, sequence: u64, revision: u64, items: usize) {
        let attempt = CommitAttempt::new(
            bucket,
            stream,
            StreamRev::from_raw(revision),
            CommitId::new(),
            CommitSequence::from_raw(sequence),
            (0..items)
                .map(|i| EventMessage::new(Payload::new("E", json!(i))))
                .collect(),
        );
        let encoded = encode_commit(&attempt, &JsonSerializer).unwrap();

        conn.execute(
            "INSERT INTO commits (bucket_id, stream_id, stream_hash, stream_revision, items,
                                  commit_id, commit_sequence, commit_stamp, headers, payload, checksum)
             VALUES (?, ?, 0, ?, ?, ?, ?, 0, ?, ?, ?)",
            params![
                bucket,
                stream,
                revision as i64,
                items as i64,
                attempt.commit_id.to_string(),
                sequence as i64,
                encoded.headers,
                encoded.payload,
                encoded.checksum,
            ],
        )
        .unwrap();
    }

    fn four_commits_of_two(conn: &Connection) {
        for i in 1..=4u64 {
            insert_commit(conn, "default", "s", i, i * 2, 2);
        }
    }

    #[test]
    fn test_range_overlap_read() {
        let conn = setup_test_db();
        four_commits_of_two(&conn);

        let commits = read_stream_commits(
            &conn,
            &JsonSerializer,
            &BucketId::default(),
            &StreamId::new("s"),
            StreamRev::from_raw(3),
            StreamRev::from_raw(5),
            DEFAULT_PAGE_SIZE,
        )
        .unwrap();

        let revisions: Vec<u64> = commits.iter().map(|c| c.stream_revision.as_raw()).collect();
        assert_eq!(revisions, vec![4, 6]);
    }

    #[test]
    fn test_small_pages_return_everything() {
        let conn = setup_test_db();
        four_commits_of_two(&conn);

        let commits = read_stream_commits(
            &conn,
            &JsonSerializer,
            &BucketId::default(),
            &StreamId::new("s"),
            StreamRev::FIRST,
            StreamRev::MAX,
            1,
        )
        .unwrap();
        assert_eq!(commits.len(), 4);

        let feed = read_commits_from(&conn, &JsonSerializer, None, CheckpointToken::START, None, 3).unwrap();
        assert_eq!(feed.len(), 4);
    }

    #[test]
    fn test_checkpoint_bounds_and_bucket_filter() {
        let conn = setup_test_db();
        insert_commit(&conn, "a", "s", 1, 1, 1);
        insert_commit(&conn, "b", "s", 1, 1, 1);
        insert_commit(&conn, "a", "s", 2, 2, 1);

        let bounded = read_commits_from(
            &conn,
            &JsonSerializer,
            None,
            CheckpointToken::from_raw(1),
            Some(CheckpointToken::from_raw(2)),
            DEFAULT_PAGE_SIZE,
        )
        .unwrap();
        assert_eq!(bounded.len(), 1);
        assert_eq!(bounded[0].bucket_id.as_str(), "b");

        let only_a = read_commits_from(
            &conn,
            &JsonSerializer,
            Some(&BucketId::new("a")),
            CheckpointToken::START,
            None,
            DEFAULT_PAGE_SIZE,
        )
        .unwrap();
        let checkpoints: Vec<i64> = only_a.iter().map(|c| c.checkpoint.as_raw()).collect();
        assert_eq!(checkpoints, vec![1, 3]);
    }

    #[test]
    fn test_commit_page_is_bounded() {
        let conn = setup_test_db();
        for sequence in 1..=5 {
            insert_commit(&conn, "a", "s", sequence, sequence, 1);
        }
        insert_commit(&conn, "b", "s", 1, 1, 1);

        let first = read_commit_page(&conn, &JsonSerializer, None, CheckpointToken::START, 2).unwrap();
        let checkpoints: Vec<i64> = first.iter().map(|c| c.checkpoint.as_raw()).collect();
        assert_eq!(checkpoints, vec![1, 2]);

        let rest = read_commit_page(&conn, &JsonSerializer, None, CheckpointToken::from_raw(4), 10).unwrap();
        assert_eq!(rest.len(), 2);

        let only_b = read_commit_page(
            &conn,
            &JsonSerializer,
            Some(&BucketId::new("b")),
            CheckpointToken::START,
            10,
        )
        .unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].checkpoint.as_raw(), 6);
    }

    #[test]
    fn test_recycled_commits_are_hidden() {
        let conn = setup_test_db();
        insert_commit(&conn, "default", "s", 1, 1, 1);
        conn.execute("UPDATE commits SET recycled = 1", []).unwrap();

        let feed = read_commits_from(&conn, &JsonSerializer, None, CheckpointToken::START, None, 10).unwrap();
        assert!(feed.is_empty());
        assert!(read_undispatched(&conn, &JsonSerializer, 10).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_empty() {
        let conn = setup_test_db();
        let snapshot = read_snapshot(
            &conn,
            &JsonSerializer,
            &BucketId::default(),
            &StreamId::new("missing"),
            StreamRev::MAX,
        )
        .unwrap();
        assert!(snapshot.is_none());
    }
}
