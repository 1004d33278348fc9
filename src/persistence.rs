//! # Storage Engine Contract
//!
//! [`PersistStreams`] is the set of operations every backend implements. Two
//! engines ship with the crate:
//!
//! - [`SqlitePersistence`](crate::sqlite::SqlitePersistence): durable, single
//!   writer thread with group commit, pooled readers
//! - [`InMemoryPersistence`](crate::memory::InMemoryPersistence): process-local,
//!   for tests and embedding
//!
//! [`EventStore`](crate::store::EventStore) also implements the trait, layering
//! the commit pipeline over whichever engine it wraps.
//!
//! ## Guarantees
//!
//! - All methods may be called concurrently; engines are `Send + Sync`.
//! - `commit` is atomic per `(bucket, stream, commit_sequence)` and per
//!   `(bucket, stream, commit_id)`. A replayed commit id fails with
//!   [`Error::DuplicateCommit`](crate::Error::DuplicateCommit); a taken
//!   sequence or revision fails with
//!   [`Error::Concurrency`](crate::Error::Concurrency).
//! - Checkpoint reads are strictly ascending and exclude deleted streams.
//! - Every call after `dispose` fails with
//!   [`Error::Disposed`](crate::Error::Disposed); `dispose` itself never fails
//!   and may be called repeatedly.
//!
//! ## Rust Pattern: async-trait
//!
//! Callers hold engines as `Arc<dyn PersistStreams>`, so the trait has to be
//! object-safe. `#[async_trait]` boxes each returned future, which makes
//! `async fn` usable behind `dyn`.

use async_trait::async_trait;

use crate::commit::{Commit, CommitAttempt, Snapshot, StreamHead};
use crate::error::Result;
use crate::types::{BucketId, CheckpointToken, StreamId, StreamRev};

/// Operations every storage backend provides.
#[async_trait]
pub trait PersistStreams: Send + Sync {
    /// Prepares schema and indexes. Runs at most once; later calls are no-ops.
    async fn initialize(&self) -> Result<()>;

    /// Persists an attempt.
    ///
    /// Engines always return `Some`. The pipeline-aware
    /// [`EventStore`](crate::store::EventStore) returns `None` when a hook
    /// vetoes the attempt.
    async fn commit(&self, attempt: CommitAttempt) -> Result<Option<Commit>>;

    /// Every commit overlapping revisions `min..=max`, ascending by sequence.
    async fn get_from(
        &self,
        bucket_id: &BucketId,
        stream_id: &StreamId,
        min_revision: StreamRev,
        max_revision: StreamRev,
    ) -> Result<Vec<Commit>>;

    /// Global feed after `checkpoint` (exclusive), all buckets.
    async fn get_from_checkpoint(&self, checkpoint: CheckpointToken) -> Result<Vec<Commit>>;

    /// Feed of one bucket after `checkpoint` (exclusive).
    async fn get_from_bucket_checkpoint(
        &self,
        bucket_id: &BucketId,
        checkpoint: CheckpointToken,
    ) -> Result<Vec<Commit>>;

    /// Global feed in `(from, to]`.
    async fn get_from_to(&self, from: CheckpointToken, to: CheckpointToken) -> Result<Vec<Commit>>;

    /// At most `limit` commits after `checkpoint` (exclusive), all buckets
    /// when `bucket_id` is `None`.
    ///
    /// Catch-up readers use this to walk a large feed one page at a time.
    async fn get_page_from_checkpoint(
        &self,
        bucket_id: Option<&BucketId>,
        checkpoint: CheckpointToken,
        limit: usize,
    ) -> Result<Vec<Commit>>;

    /// Streams whose unsnapshotted event count is at least `max_threshold`.
    async fn get_streams_to_snapshot(
        &self,
        bucket_id: &BucketId,
        max_threshold: u64,
    ) -> Result<Vec<StreamHead>>;

    /// Most recent snapshot at or before `max_revision`.
    async fn get_snapshot(
        &self,
        bucket_id: &BucketId,
        stream_id: &StreamId,
        max_revision: StreamRev,
    ) -> Result<Option<Snapshot>>;

    /// Stores a snapshot (last write wins). True when durably stored.
    async fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool>;

    /// Commits whose dispatch marker was never set, ascending by checkpoint.
    async fn get_undispatched_commits(&self) -> Result<Vec<Commit>>;

    /// Sets the dispatch marker. Idempotent.
    async fn mark_commit_as_dispatched(&self, commit: &Commit) -> Result<()>;

    /// Removes every commit, snapshot and stream head.
    async fn purge(&self) -> Result<()>;

    /// Removes one bucket's commits, snapshots and stream heads.
    async fn purge_bucket(&self, bucket_id: &BucketId) -> Result<()>;

    /// Removes all storage structures.
    async fn drop_all(&self) -> Result<()>;

    /// Soft-deletes a stream.
    async fn delete_stream(&self, bucket_id: &BucketId, stream_id: &StreamId) -> Result<()>;

    /// Releases resources. Safe to call more than once.
    async fn dispose(&self);

    /// True once `dispose` has been called.
    fn is_disposed(&self) -> bool;
}
