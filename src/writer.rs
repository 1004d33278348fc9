//! # Batch Writer with Group Commit
//!
//! Every write against the SQLite engine goes through one dedicated thread
//! that owns the only read-write connection. Commit attempts are collected
//! over a short time window and executed in a single SQLite transaction, with
//! a SAVEPOINT around each attempt.
//!
//! ## Why Group Commit?
//!
//! SQLite's throughput is bounded by fsync: each transaction commit waits for
//! the disk. Batching amortizes that cost:
//!
//! ```text
//! Without batching:                With batching:
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ c1 → BEGIN → COMMIT      │     │ BEGIN IMMEDIATE          │
//! │ c2 → BEGIN → COMMIT      │     │   SAVEPOINT attempt_0    │
//! │ c3 → BEGIN → COMMIT      │     │   SAVEPOINT attempt_1    │
//! │ ...                      │     │   SAVEPOINT attempt_2    │
//! │ 100 fsyncs               │     │ COMMIT                   │
//! └──────────────────────────┘     │ 1 fsync                  │
//!                                  └──────────────────────────┘
//! ```
//!
//! ## SAVEPOINT Semantics
//!
//! - Attempt succeeds: SAVEPOINT released, row kept
//! - Attempt conflicts: SAVEPOINT rolled back, other attempts unaffected
//!
//! ## Conflict Detection
//!
//! Two layers, in order:
//!
//! 1. Stream head lookup (staged → committed cache → disk). An attempt whose
//!    sequence or first revision is not past the head is rejected before
//!    touching the table.
//! 2. The unique indexes on `commits`. Anything the head check missed (another
//!    process wrote the stream) trips an index.
//!
//! Either way the writer re-reads the stream for the attempt's commit id to
//! decide between [`Error::DuplicateCommit`] and [`Error::Concurrency`].
//!
//! ## Staged vs Committed State
//!
//! Heads written inside the current batch live in `staged` until the outer
//! COMMIT succeeds; only then are they merged into the committed cache. A
//! failed batch discards them, so memory never leads disk.
//!
//! ## Ordering
//!
//! Non-commit requests (snapshots, purges, deletes, dispatch markers) flush
//! the pending batch first and then run in their own transaction, so every
//! request takes effect in arrival order.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{encode_commit, encode_snapshot};
use crate::commit::{Commit, CommitAttempt, Snapshot};
use crate::error::{Error, ErrorKind, Result};
use crate::schema;
use crate::serialization::Serializer;
use crate::types::{BucketId, CheckpointToken, CommitSequence, StreamId, StreamRev};

// =============================================================================
// Configuration
// =============================================================================

/// Default batch timeout in milliseconds.
///
/// Shorter = lower latency, longer = higher throughput.
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 10;

/// Maximum attempts per batch.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 1000;

/// Number of stream heads kept in the committed cache.
pub const DEFAULT_HEAD_CACHE_SIZE: usize = 10_000;

/// Size of the request channel.
const REQUEST_CHANNEL_SIZE: usize = 4096;

/// Configuration for the batch writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum time to wait for more attempts before executing a batch.
    pub batch_timeout: Duration,

    /// Maximum attempts per batch.
    pub batch_max_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
        }
    }
}

// =============================================================================
// Request Types
// =============================================================================

/// A request sent to the writer thread.
pub enum WriteRequest {
    /// Create tables and indexes.
    Initialize {
        response: oneshot::Sender<Result<()>>,
    },

    /// Persist a commit attempt (batched).
    Commit {
        attempt: CommitAttempt,
        response: oneshot::Sender<Result<Commit>>,
    },

    /// Upsert a snapshot.
    AddSnapshot {
        snapshot: Snapshot,
        response: oneshot::Sender<Result<bool>>,
    },

    /// Set the dispatch marker of a commit.
    MarkDispatched {
        checkpoint: CheckpointToken,
        response: oneshot::Sender<Result<()>>,
    },

    /// Remove everything, or one bucket.
    Purge {
        bucket_id: Option<BucketId>,
        response: oneshot::Sender<Result<()>>,
    },

    /// Drop every table.
    DropAll {
        response: oneshot::Sender<Result<()>>,
    },

    /// Soft-delete a stream.
    DeleteStream {
        bucket_id: BucketId,
        stream_id: StreamId,
        response: oneshot::Sender<Result<()>>,
    },

    /// Flush and stop. The sender fires once the connection is closed.
    Shutdown { done: oneshot::Sender<()> },
}

/// A commit waiting for the current batch to execute.
struct PendingCommit {
    attempt: CommitAttempt,
    response: oneshot::Sender<Result<Commit>>,
}

// =============================================================================
// Stream Heads
// =============================================================================

type HeadKey = (BucketId, StreamId);

/// Latest sequence and revision of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadEntry {
    commit_sequence: CommitSequence,
    head_revision: StreamRev,
}

/// Heads modified in the current batch (not yet committed to disk).
struct StagedState {
    heads: HashMap<HeadKey, HeadEntry>,
}

impl StagedState {
    fn new() -> Self {
        Self {
            heads: HashMap::new(),
        }
    }

    fn clear(&mut self) {
        self.heads.clear();
    }
}

// =============================================================================
// Batch Writer
// =============================================================================

/// The writer that owns the read-write connection.
///
/// Runs on a dedicated thread; use [`BatchWriterHandle`] from async code.
pub struct BatchWriter {
    /// SQLite connection (owned, single writer).
    conn: Connection,

    /// Encodes headers, events and snapshot payloads.
    serializer: Arc<dyn Serializer>,

    /// Committed stream heads (mirrors disk for the streams it holds).
    heads_committed: LruCache<HeadKey, HeadEntry>,

    /// Batch-local overlay.
    staged: StagedState,
}

impl BatchWriter {
    /// Creates a writer. The schema does not need to exist yet.
    pub fn new(conn: Connection, serializer: Arc<dyn Serializer>) -> Self {
        let capacity = NonZeroUsize::new(DEFAULT_HEAD_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);

        Self {
            conn,
            serializer,
            heads_committed: LruCache::new(capacity),
            staged: StagedState::new(),
        }
    }

    // =========================================================================
    // Stream Head Lookups (Staged → Committed → Disk)
    // =========================================================================

    fn get_stream_head(&mut self, key: &HeadKey) -> Result<Option<HeadEntry>> {
        if let Some(entry) = self.staged.heads.get(key) {
            return Ok(Some(*entry));
        }
        if let Some(entry) = self.heads_committed.get(key) {
            return Ok(Some(*entry));
        }

        let entry = self
            .conn
            .query_row(
                "SELECT MAX(commit_sequence), MAX(stream_revision) FROM commits
                 WHERE bucket_id = ? AND stream_id = ? AND recycled = 0",
                params![key.0.as_str(), key.1.as_str()],
                |row| {
                    let sequence: Option<i64> = row.get(0)?;
                    let revision: Option<i64> = row.get(1)?;
                    Ok(sequence.zip(revision))
                },
            )?
            .map(|(sequence, revision)| HeadEntry {
                commit_sequence: CommitSequence::from_raw(sequence as u64),
                head_revision: StreamRev::from_raw(revision as u64),
            });

        if let Some(entry) = entry {
            self.heads_committed.put(key.clone(), entry);
        }
        Ok(entry)
    }

    fn forget_bucket(&mut self, bucket_id: &BucketId) {
        let keys: Vec<HeadKey> = self
            .heads_committed
            .iter()
            .filter(|(key, _)| &key.0 == bucket_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            self.heads_committed.pop(&key);
        }
    }

    /// Decides whether a rejected attempt is a replay or a lost race.
    fn classify_conflict(&self, attempt: &CommitAttempt) -> Result<Error> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM commits
                 WHERE bucket_id = ? AND stream_id = ? AND commit_id = ? AND recycled = 0",
                params![
                    attempt.bucket_id.as_str(),
                    attempt.stream_id.as_str(),
                    attempt.commit_id.to_string(),
                ],
                |row| row.get(0),
            )
            .optional()?;

        Ok(if exists.is_some() {
            Error::DuplicateCommit {
                bucket_id: attempt.bucket_id.clone(),
                stream_id: attempt.stream_id.clone(),
                commit_id: attempt.commit_id,
            }
        } else {
            Error::Concurrency {
                bucket_id: attempt.bucket_id.clone(),
                stream_id: attempt.stream_id.clone(),
                commit_sequence: attempt.commit_sequence,
                stream_revision: attempt.stream_revision,
            }
        })
    }

    // =========================================================================
    // Batch Execution
    // =========================================================================

    /// Executes a batch of commit attempts in one transaction.
    ///
    /// 1. Begin outer transaction
    /// 2. For each attempt, create a SAVEPOINT and execute
    /// 3. On success: release SAVEPOINT
    /// 4. On failure: rollback SAVEPOINT (others continue)
    /// 5. Commit outer transaction
    /// 6. Send responses
    fn execute_batch(&mut self, items: Vec<PendingCommit>) {
        if items.is_empty() {
            return;
        }

        self.staged.clear();

        let (attempts, responses): (Vec<_>, Vec<_>) = items
            .into_iter()
            .map(|pending| (pending.attempt, pending.response))
            .unzip();

        match self.execute_batch_inner(&attempts) {
            Ok(results) => {
                self.commit_staged_state();
                debug!(attempts = attempts.len(), "batch committed");

                for (response, result) in responses.into_iter().zip(results) {
                    let _ = response.send(result);
                }
            }
            Err(e) => {
                warn!(error = %e, attempts = attempts.len(), "batch commit failed");
                let transient = e.kind() == ErrorKind::Unavailable;
                let msg = format!("batch commit failed: {}", e);

                for response in responses {
                    let err = if transient {
                        Error::StorageUnavailable(msg.clone())
                    } else {
                        Error::Storage(msg.clone())
                    };
                    let _ = response.send(Err(err));
                }

                self.staged.clear();
            }
        }
    }

    /// Inner batch execution with raw transaction SQL.
    ///
    /// Raw statements avoid holding a `rusqlite::Transaction` borrow of the
    /// connection across the per-attempt helpers.
    fn execute_batch_inner(&mut self, attempts: &[CommitAttempt]) -> Result<Vec<Result<Commit>>> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;

        let mut results = Vec::with_capacity(attempts.len());
        for (index, attempt) in attempts.iter().enumerate() {
            match self.execute_attempt_in_savepoint(attempt, index) {
                Ok(result) => results.push(result),
                Err(e) => {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    return Err(e);
                }
            }
        }

        match self.conn.execute_batch("COMMIT") {
            Ok(()) => Ok(results),
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e.into())
            }
        }
    }

    /// Executes one attempt within a SAVEPOINT.
    ///
    /// The outer `Result` fails the whole batch (savepoint bookkeeping broke);
    /// the inner one belongs to this attempt alone.
    fn execute_attempt_in_savepoint(
        &mut self,
        attempt: &CommitAttempt,
        index: usize,
    ) -> Result<Result<Commit>> {
        let key = (attempt.bucket_id.clone(), attempt.stream_id.clone());

        match self.get_stream_head(&key) {
            Ok(Some(head))
                if attempt.commit_sequence <= head.commit_sequence
                    || attempt.first_revision() <= head.head_revision =>
            {
                return Ok(self.classify_conflict(attempt).and_then(Err));
            }
            Ok(_) => {}
            Err(e) => return Ok(Err(e)),
        }

        let sp_name = format!("attempt_{}", index);
        self.conn.execute_batch(&format!("SAVEPOINT {}", sp_name))?;

        match self.insert_commit(attempt) {
            Ok(commit) => {
                self.conn.execute_batch(&format!("RELEASE {}", sp_name))?;
                self.staged.heads.insert(
                    key,
                    HeadEntry {
                        commit_sequence: commit.commit_sequence,
                        head_revision: commit.stream_revision,
                    },
                );
                Ok(Ok(commit))
            }
            Err(e) => {
                self.conn.execute_batch(&format!("ROLLBACK TO {}", sp_name))?;
                self.conn.execute_batch(&format!("RELEASE {}", sp_name))?;

                if is_constraint_violation(&e) {
                    Ok(self.classify_conflict(attempt).and_then(Err))
                } else {
                    Ok(Err(e))
                }
            }
        }
    }

    /// Inserts the commit row and advances the stream head.
    fn insert_commit(&self, attempt: &CommitAttempt) -> Result<Commit> {
        let encoded = encode_commit(attempt, self.serializer.as_ref())?;

        self.conn.execute(
            "INSERT INTO commits (bucket_id, stream_id, stream_hash, stream_revision, items,
                                  commit_id, commit_sequence, commit_stamp, headers, payload, checksum)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                attempt.bucket_id.as_str(),
                attempt.stream_id.as_str(),
                attempt.stream_id.hash().as_raw(),
                attempt.stream_revision.to_sql(),
                attempt.events.len() as i64,
                attempt.commit_id.to_string(),
                attempt.commit_sequence.as_raw() as i64,
                attempt.commit_stamp_ms as i64,
                encoded.headers.as_slice(),
                encoded.payload.as_slice(),
                encoded.checksum.as_slice(),
            ],
        )?;
        let checkpoint = CheckpointToken::from_raw(self.conn.last_insert_rowid());

        self.conn.execute(
            "INSERT INTO stream_heads (bucket_id, stream_id, stream_hash, head_revision, snapshot_revision)
             VALUES (?, ?, ?, ?, 0)
             ON CONFLICT(bucket_id, stream_id) DO UPDATE SET
                 head_revision = MAX(head_revision, excluded.head_revision)",
            params![
                attempt.bucket_id.as_str(),
                attempt.stream_id.as_str(),
                attempt.stream_id.hash().as_raw(),
                attempt.stream_revision.to_sql(),
            ],
        )?;

        Ok(Commit::from_attempt(attempt.clone(), checkpoint))
    }

    /// Merges staged heads into the committed cache.
    fn commit_staged_state(&mut self) {
        for (key, entry) in self.staged.heads.drain() {
            self.heads_committed.put(key, entry);
        }
    }

    // =========================================================================
    // Immediate Operations
    // =========================================================================

    /// Runs `f` inside its own IMMEDIATE transaction.
    fn in_transaction<T>(&mut self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&self.conn) {
            Ok(value) => match self.conn.execute_batch("COMMIT") {
                Ok(()) => Ok(value),
                Err(e) => {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    Err(e.into())
                }
            },
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Creates the schema.
    pub fn execute_initialize(&mut self) -> Result<()> {
        schema::initialize(&self.conn)?;
        info!("schema initialized");
        Ok(())
    }

    /// Upserts a snapshot if its stream has a commit at or before its revision.
    pub fn execute_add_snapshot(&mut self, snapshot: Snapshot) -> Result<bool> {
        let (blob, checksum) = encode_snapshot(&snapshot, self.serializer.as_ref())?;

        self.in_transaction(|conn| {
            let covered: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM commits
                     WHERE bucket_id = ? AND stream_id = ? AND recycled = 0
                       AND (stream_revision - items) < ?
                     LIMIT 1",
                    params![
                        snapshot.bucket_id.as_str(),
                        snapshot.stream_id.as_str(),
                        snapshot.stream_revision.to_sql(),
                    ],
                    |row| row.get(0),
                )
                .optional()?;
            if covered.is_none() {
                return Ok(false);
            }

            conn.execute(
                "INSERT INTO snapshots (bucket_id, stream_id, stream_revision, payload, checksum)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(bucket_id, stream_id, stream_revision) DO UPDATE SET
                     payload = excluded.payload,
                     checksum = excluded.checksum",
                params![
                    snapshot.bucket_id.as_str(),
                    snapshot.stream_id.as_str(),
                    snapshot.stream_revision.to_sql(),
                    blob.as_slice(),
                    checksum.as_slice(),
                ],
            )?;

            conn.execute(
                "UPDATE stream_heads SET snapshot_revision = MAX(snapshot_revision, ?)
                 WHERE bucket_id = ? AND stream_id = ?",
                params![
                    snapshot.stream_revision.to_sql(),
                    snapshot.bucket_id.as_str(),
                    snapshot.stream_id.as_str(),
                ],
            )?;

            Ok(true)
        })
    }

    /// Sets the dispatch marker. Updating an already-set marker is harmless.
    pub fn execute_mark_dispatched(&mut self, checkpoint: CheckpointToken) -> Result<()> {
        self.conn.execute(
            "UPDATE commits SET dispatched = 1 WHERE checkpoint_number = ?",
            params![checkpoint.as_raw()],
        )?;
        Ok(())
    }

    /// Deletes all rows, or one bucket's rows.
    ///
    /// Checkpoint numbers keep increasing afterwards (`AUTOINCREMENT`).
    pub fn execute_purge(&mut self, bucket_id: Option<&BucketId>) -> Result<()> {
        match bucket_id {
            None => {
                self.in_transaction(|conn| {
                    conn.execute("DELETE FROM commits", [])?;
                    conn.execute("DELETE FROM snapshots", [])?;
                    conn.execute("DELETE FROM stream_heads", [])?;
                    Ok(())
                })?;
                self.heads_committed.clear();
                info!("purged all buckets");
            }
            Some(bucket_id) => {
                self.in_transaction(|conn| {
                    conn.execute("DELETE FROM commits WHERE bucket_id = ?", [bucket_id.as_str()])?;
                    conn.execute("DELETE FROM snapshots WHERE bucket_id = ?", [bucket_id.as_str()])?;
                    conn.execute("DELETE FROM stream_heads WHERE bucket_id = ?", [bucket_id.as_str()])?;
                    Ok(())
                })?;
                self.forget_bucket(bucket_id);
                info!(bucket = %bucket_id, "purged bucket");
            }
        }
        Ok(())
    }

    /// Drops every table.
    pub fn execute_drop_all(&mut self) -> Result<()> {
        schema::drop_tables(&self.conn)?;
        self.heads_committed.clear();
        info!("dropped all tables");
        Ok(())
    }

    /// Flags a stream's commits as recycled and removes its snapshots and head.
    pub fn execute_delete_stream(&mut self, bucket_id: &BucketId, stream_id: &StreamId) -> Result<()> {
        let recycled = self.in_transaction(|conn| {
            let recycled = conn.execute(
                "UPDATE commits SET recycled = 1
                 WHERE bucket_id = ? AND stream_id = ? AND recycled = 0",
                params![bucket_id.as_str(), stream_id.as_str()],
            )?;
            conn.execute(
                "DELETE FROM snapshots WHERE bucket_id = ? AND stream_id = ?",
                params![bucket_id.as_str(), stream_id.as_str()],
            )?;
            conn.execute(
                "DELETE FROM stream_heads WHERE bucket_id = ? AND stream_id = ?",
                params![bucket_id.as_str(), stream_id.as_str()],
            )?;
            Ok(recycled)
        })?;

        self.heads_committed
            .pop(&(bucket_id.clone(), stream_id.clone()));
        debug!(bucket = %bucket_id, stream = %stream_id, commits = recycled, "stream deleted");
        Ok(())
    }
}

fn is_constraint_violation(err: &Error) -> bool {
    matches!(
        err,
        Error::Sqlite(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation
    )
}

// =============================================================================
// Batch Writer Handle (Async Interface)
// =============================================================================

/// Async handle to the writer thread.
///
/// Cloning is cheap; every clone feeds the same thread.
#[derive(Clone)]
pub struct BatchWriterHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl BatchWriterHandle {
    /// Sends a request and awaits its response.
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> WriteRequest,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(make(response_tx))
            .await
            .map_err(|_| Error::Storage("writer has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Storage("writer dropped response".to_string()))?
    }

    /// Creates tables and indexes.
    pub async fn initialize(&self) -> Result<()> {
        self.request(|response| WriteRequest::Initialize { response })
            .await
    }

    /// Persists a commit attempt.
    pub async fn commit(&self, attempt: CommitAttempt) -> Result<Commit> {
        self.request(|response| WriteRequest::Commit { attempt, response })
            .await
    }

    /// Upserts a snapshot.
    pub async fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool> {
        self.request(|response| WriteRequest::AddSnapshot { snapshot, response })
            .await
    }

    /// Sets the dispatch marker of the commit at `checkpoint`.
    pub async fn mark_dispatched(&self, checkpoint: CheckpointToken) -> Result<()> {
        self.request(|response| WriteRequest::MarkDispatched {
            checkpoint,
            response,
        })
        .await
    }

    /// Deletes all rows, or one bucket's rows.
    pub async fn purge(&self, bucket_id: Option<BucketId>) -> Result<()> {
        self.request(|response| WriteRequest::Purge {
            bucket_id,
            response,
        })
        .await
    }

    /// Drops every table.
    pub async fn drop_all(&self) -> Result<()> {
        self.request(|response| WriteRequest::DropAll { response })
            .await
    }

    /// Soft-deletes a stream.
    pub async fn delete_stream(&self, bucket_id: BucketId, stream_id: StreamId) -> Result<()> {
        self.request(|response| WriteRequest::DeleteStream {
            bucket_id,
            stream_id,
            response,
        })
        .await
    }

    /// Flushes pending attempts, stops the thread and waits for the
    /// connection to close. Returns immediately if already stopped.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriteRequest::Shutdown { done: done_tx }).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

// =============================================================================
// Writer Loop
// =============================================================================

/// Runs the batch writer loop until shutdown or until every handle is gone.
pub async fn run_batch_writer(
    mut writer: BatchWriter,
    mut rx: mpsc::Receiver<WriteRequest>,
    config: WriterConfig,
) {
    let mut batch: Vec<PendingCommit> = Vec::new();
    let mut batch_start: Option<Instant> = None;
    let mut done: Option<oneshot::Sender<()>> = None;

    loop {
        let wait_timeout = match batch_start {
            // No pending attempts - wait effectively forever
            None => Duration::from_secs(3600),
            Some(start) => config.batch_timeout.saturating_sub(start.elapsed()),
        };

        match timeout(wait_timeout, rx.recv()).await {
            Ok(Some(WriteRequest::Commit { attempt, response })) => {
                if batch.is_empty() {
                    batch_start = Some(Instant::now());
                }
                batch.push(PendingCommit { attempt, response });

                if batch.len() >= config.batch_max_size {
                    writer.execute_batch(std::mem::take(&mut batch));
                    batch_start = None;
                }
            }
            Ok(Some(WriteRequest::Shutdown { done: ack })) => {
                writer.execute_batch(std::mem::take(&mut batch));
                done = Some(ack);
                break;
            }
            Ok(Some(request)) => {
                // Everything queued before this request lands first.
                writer.execute_batch(std::mem::take(&mut batch));
                batch_start = None;
                execute_immediate(&mut writer, request);
            }
            Ok(None) => {
                writer.execute_batch(std::mem::take(&mut batch));
                break;
            }
            Err(_) => {
                writer.execute_batch(std::mem::take(&mut batch));
                batch_start = None;
            }
        }
    }

    drop(rx);
    drop(writer);
    if let Some(ack) = done {
        let _ = ack.send(());
    }
    debug!("writer stopped");
}

fn execute_immediate(writer: &mut BatchWriter, request: WriteRequest) {
    match request {
        WriteRequest::Initialize { response } => {
            let _ = response.send(writer.execute_initialize());
        }
        WriteRequest::AddSnapshot { snapshot, response } => {
            let _ = response.send(writer.execute_add_snapshot(snapshot));
        }
        WriteRequest::MarkDispatched {
            checkpoint,
            response,
        } => {
            let _ = response.send(writer.execute_mark_dispatched(checkpoint));
        }
        WriteRequest::Purge {
            bucket_id,
            response,
        } => {
            let _ = response.send(writer.execute_purge(bucket_id.as_ref()));
        }
        WriteRequest::DropAll { response } => {
            let _ = response.send(writer.execute_drop_all());
        }
        WriteRequest::DeleteStream {
            bucket_id,
            stream_id,
            response,
        } => {
            let _ = response.send(writer.execute_delete_stream(&bucket_id, &stream_id));
        }
        // The loop batches commits itself; a stray one runs alone.
        WriteRequest::Commit { attempt, response } => {
            writer.execute_batch(vec![PendingCommit { attempt, response }]);
        }
        WriteRequest::Shutdown { done } => {
            let _ = done.send(());
        }
    }
}

/// Spawns the batch writer on a dedicated thread.
pub fn spawn_batch_writer(
    conn: Connection,
    serializer: Arc<dyn Serializer>,
    config: WriterConfig,
) -> Result<BatchWriterHandle> {
    let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);

    let writer = BatchWriter::new(conn, serializer);
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Storage(format!("failed to create writer runtime: {}", e)))?;

    std::thread::Builder::new()
        .name("spitestore-writer".to_string())
        .spawn(move || {
            rt.block_on(run_batch_writer(writer, rx, config));
        })
        .map_err(|e| Error::Storage(format!("failed to spawn writer thread: {}", e)))?;

    Ok(BatchWriterHandle { tx })
}

// =============================================================================
// Tests
// =============================================================================
