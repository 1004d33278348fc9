//! # In-Memory Storage Engine
//!
//! [`InMemoryPersistence`] implements the full [`PersistStreams`] contract
//! without any I/O. It is meant for tests and for embedding where durability
//! is not needed; its observable behavior matches the SQLite engine:
//!
//! - checkpoints start at 1 and are never reused, even after purge or delete
//! - a replayed commit id is a duplicate, a taken sequence or revision is a
//!   conflict
//! - snapshots are last-write-wins and require a commit at or before their
//!   revision
//!
//! All state sits behind one `std::sync::Mutex`. No lock is held across an
//! `.await`, so the blocking mutex is fine inside async methods.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::commit::{Commit, CommitAttempt, Snapshot, StreamHead};
use crate::error::{Error, Result};
use crate::persistence::PersistStreams;
use crate::types::{BucketId, CheckpointToken, StreamId, StreamRev};

type StreamKey = (BucketId, StreamId);
type SnapshotKey = (BucketId, StreamId, StreamRev);

struct StoredCommit {
    commit: Commit,
    dispatched: bool,
}

#[derive(Default)]
struct State {
    /// Live commits in checkpoint order.
    commits: Vec<StoredCommit>,
    snapshots: BTreeMap<SnapshotKey, serde_json::Value>,
    heads: HashMap<StreamKey, StreamHead>,
    last_checkpoint: i64,
}

impl State {
    fn stream_commits<'a>(
        &'a self,
        bucket_id: &'a BucketId,
        stream_id: &'a StreamId,
    ) -> impl Iterator<Item = &'a Commit> + 'a {
        self.commits
            .iter()
            .map(|stored| &stored.commit)
            .filter(move |c| &c.bucket_id == bucket_id && &c.stream_id == stream_id)
    }

    fn conflict(&self, attempt: &CommitAttempt) -> Option<Error> {
        if self
            .stream_commits(&attempt.bucket_id, &attempt.stream_id)
            .any(|c| c.commit_id == attempt.commit_id)
        {
            return Some(Error::DuplicateCommit {
                bucket_id: attempt.bucket_id.clone(),
                stream_id: attempt.stream_id.clone(),
                commit_id: attempt.commit_id,
            });
        }

        let first = attempt.first_revision();
        if self
            .stream_commits(&attempt.bucket_id, &attempt.stream_id)
            .any(|c| c.commit_sequence >= attempt.commit_sequence || c.stream_revision >= first)
        {
            return Some(Error::Concurrency {
                bucket_id: attempt.bucket_id.clone(),
                stream_id: attempt.stream_id.clone(),
                commit_sequence: attempt.commit_sequence,
                stream_revision: attempt.stream_revision,
            });
        }
        None
    }

    fn feed(
        &self,
        bucket_id: Option<&BucketId>,
        from: CheckpointToken,
        to: Option<CheckpointToken>,
        limit: usize,
    ) -> Vec<Commit> {
        self.commits
            .iter()
            .map(|stored| &stored.commit)
            .filter(|c| c.checkpoint > from)
            .filter(|c| to.map_or(true, |to| c.checkpoint <= to))
            .filter(|c| bucket_id.map_or(true, |b| &c.bucket_id == b))
            .take(limit)
            .cloned()
            .collect()
    }
}

/// A process-local storage engine.
#[derive(Default)]
pub struct InMemoryPersistence {
    state: Mutex<State>,
    initialized: AtomicBool,
    disposed: AtomicBool,
}

impl InMemoryPersistence {
    /// Creates an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed("in-memory persistence"));
        }
        self.state
            .lock()
            .map_err(|_| Error::Storage("in-memory state lock poisoned".to_string()))
    }
}

#[async_trait]
impl PersistStreams for InMemoryPersistence {
    async fn initialize(&self) -> Result<()> {
        let _state = self.state()?;
        if !self.initialized.swap(true, Ordering::AcqRel) {
            info!("in-memory persistence initialized");
        }
        Ok(())
    }

    async fn commit(&self, attempt: CommitAttempt) -> Result<Option<Commit>> {
        attempt.validate()?;
        let mut state = self.state()?;

        if let Some(err) = state.conflict(&attempt) {
            return Err(err);
        }

        state.last_checkpoint += 1;
        let commit = Commit::from_attempt(attempt, CheckpointToken::from_raw(state.last_checkpoint));

        let head = state
            .heads
            .entry((commit.bucket_id.clone(), commit.stream_id.clone()))
            .or_insert_with(|| StreamHead {
                bucket_id: commit.bucket_id.clone(),
                stream_id: commit.stream_id.clone(),
                head_revision: StreamRev::NONE,
                snapshot_revision: StreamRev::NONE,
            });
        head.head_revision = head.head_revision.max(commit.stream_revision);

        state.commits.push(StoredCommit {
            commit: commit.clone(),
            dispatched: false,
        });

        debug!(
            bucket = %commit.bucket_id,
            stream = %commit.stream_id,
            checkpoint = %commit.checkpoint,
            "commit persisted"
        );
        Ok(Some(commit))
    }

    async fn get_from(
        &self,
        bucket_id: &BucketId,
        stream_id: &StreamId,
        min_revision: StreamRev,
        max_revision: StreamRev,
    ) -> Result<Vec<Commit>> {
        let state = self.state()?;
        let mut commits: Vec<Commit> = state
            .stream_commits(bucket_id, stream_id)
            .filter(|c| c.overlaps(min_revision, max_revision))
            .cloned()
            .collect();
        commits.sort_by_key(|c| c.commit_sequence);
        Ok(commits)
    }

    async fn get_from_checkpoint(&self, checkpoint: CheckpointToken) -> Result<Vec<Commit>> {
        Ok(self.state()?.feed(None, checkpoint, None, usize::MAX))
    }

    async fn get_from_bucket_checkpoint(
        &self,
        bucket_id: &BucketId,
        checkpoint: CheckpointToken,
    ) -> Result<Vec<Commit>> {
        Ok(self.state()?.feed(Some(bucket_id), checkpoint, None, usize::MAX))
    }

    async fn get_from_to(&self, from: CheckpointToken, to: CheckpointToken) -> Result<Vec<Commit>> {
        Ok(self.state()?.feed(None, from, Some(to), usize::MAX))
    }

    async fn get_page_from_checkpoint(
        &self,
        bucket_id: Option<&BucketId>,
        checkpoint: CheckpointToken,
        limit: usize,
    ) -> Result<Vec<Commit>> {
        Ok(self.state()?.feed(bucket_id, checkpoint, None, limit))
    }

    async fn get_streams_to_snapshot(
        &self,
        bucket_id: &BucketId,
        max_threshold: u64,
    ) -> Result<Vec<StreamHead>> {
        let state = self.state()?;
        let mut heads: Vec<StreamHead> = state
            .heads
            .values()
            .filter(|h| &h.bucket_id == bucket_id && h.unsnapshotted() >= max_threshold)
            .cloned()
            .collect();
        heads.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        Ok(heads)
    }

    async fn get_snapshot(
        &self,
        bucket_id: &BucketId,
        stream_id: &StreamId,
        max_revision: StreamRev,
    ) -> Result<Option<Snapshot>> {
        let state = self.state()?;
        let lower = (bucket_id.clone(), stream_id.clone(), StreamRev::NONE);
        let upper = (bucket_id.clone(), stream_id.clone(), max_revision);

        Ok(state
            .snapshots
            .range(lower..=upper)
            .next_back()
            .map(|((bucket_id, stream_id, revision), payload)| Snapshot {
                bucket_id: bucket_id.clone(),
                stream_id: stream_id.clone(),
                stream_revision: *revision,
                payload: payload.clone(),
            }))
    }

    async fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool> {
        let mut state = self.state()?;
        if snapshot.stream_revision > StreamRev::MAX {
            return Ok(false);
        }

        let covered = state
            .stream_commits(&snapshot.bucket_id, &snapshot.stream_id)
            .any(|c| c.first_revision() <= snapshot.stream_revision);
        if !covered {
            return Ok(false);
        }

        let key = (snapshot.bucket_id.clone(), snapshot.stream_id.clone());
        if let Some(head) = state.heads.get_mut(&key) {
            head.snapshot_revision = head.snapshot_revision.max(snapshot.stream_revision);
        }
        state.snapshots.insert(
            (snapshot.bucket_id, snapshot.stream_id, snapshot.stream_revision),
            snapshot.payload,
        );
        Ok(true)
    }

    async fn get_undispatched_commits(&self) -> Result<Vec<Commit>> {
        let state = self.state()?;
        Ok(state
            .commits
            .iter()
            .filter(|stored| !stored.dispatched)
            .map(|stored| stored.commit.clone())
            .collect())
    }

    async fn mark_commit_as_dispatched(&self, commit: &Commit) -> Result<()> {
        let mut state = self.state()?;
        if let Some(stored) = state
            .commits
            .iter_mut()
            .find(|stored| stored.commit.checkpoint == commit.checkpoint)
        {
            stored.dispatched = true;
        }
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        let mut state = self.state()?;
        state.commits.clear();
        state.snapshots.clear();
        state.heads.clear();
        info!("purged all buckets");
        Ok(())
    }

    async fn purge_bucket(&self, bucket_id: &BucketId) -> Result<()> {
        let mut state = self.state()?;
        state.commits.retain(|stored| &stored.commit.bucket_id != bucket_id);
        state.snapshots.retain(|(bucket, _, _), _| bucket != bucket_id);
        state.heads.retain(|(bucket, _), _| bucket != bucket_id);
        info!(bucket = %bucket_id, "purged bucket");
        Ok(())
    }

    async fn drop_all(&self) -> Result<()> {
        let mut state = self.state()?;
        *state = State::default();
        self.initialized.store(false, Ordering::Release);
        Ok(())
    }

    /// Removes the stream. The checkpoint counter is untouched, so its tokens
    /// are never handed out again.
    async fn delete_stream(&self, bucket_id: &BucketId, stream_id: &StreamId) -> Result<()> {
        let mut state = self.state()?;
        state.commits.retain(|stored| {
            !(&stored.commit.bucket_id == bucket_id && &stored.commit.stream_id == stream_id)
        });
        state
            .snapshots
            .retain(|(bucket, stream, _), _| !(bucket == bucket_id && stream == stream_id));
        state.heads.remove(&(bucket_id.clone(), stream_id.clone()));
        debug!(bucket = %bucket_id, stream = %stream_id, "stream deleted");
        Ok(())
    }

    async fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            info!("in-memory persistence disposed");
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}
