//! # Optimistic Concurrency Tracker
//!
//! [`OptimisticPipelineHook`] remembers the latest commit it has seen for a
//! bounded number of streams and rejects attempts that are doomed before they
//! reach storage.
//!
//! ## Screening Rules
//!
//! For an attempt against a tracked stream with head `h`:
//!
//! | Condition | Outcome |
//! |-----------|---------|
//! | `h.commit_id == attempt.commit_id` | `DuplicateCommit` |
//! | `h.seq >= attempt.seq` or `h.rev >= attempt.rev` | `Concurrency` |
//! | `h.seq < attempt.seq - 1` or `h.rev < attempt.rev - events` | `Storage` (caller skipped ahead) |
//! | otherwise | allowed |
//!
//! Untracked streams are always allowed; the storage engine's unique indexes
//! stay the final authority. The tracker only saves a round trip.
//!
//! ## Tracking
//!
//! Heads are learned from successful writes (`post_commit`) and from reads
//! (`select`), so a process that only reads still screens correctly. An older
//! commit never replaces a newer head.
//!
//! ## Rust Pattern: one lock, one owner
//!
//! The eviction order and the lookup map are the same `LruCache`, behind a
//! single `Mutex`. Nothing outside this struct can reach either.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use lru::LruCache;
use tracing::warn;

use crate::commit::{Commit, CommitAttempt};
use crate::error::{Error, Result};
use crate::pipeline::PipelineHook;
use crate::types::{BucketId, StreamId};

/// Default number of stream heads kept.
pub const DEFAULT_MAX_STREAMS_TO_TRACK: usize = 100;

type StreamKey = (BucketId, StreamId);

/// LRU stream-head cache used as a pipeline hook.
pub struct OptimisticPipelineHook {
    heads: Mutex<LruCache<StreamKey, Commit>>,
}

impl Default for OptimisticPipelineHook {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimisticPipelineHook {
    /// Tracks up to [`DEFAULT_MAX_STREAMS_TO_TRACK`] streams.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_STREAMS_TO_TRACK)
    }

    /// Tracks up to `max_streams` streams (at least one).
    pub fn with_capacity(max_streams: usize) -> Self {
        let capacity = NonZeroUsize::new(max_streams).unwrap_or(NonZeroUsize::MIN);
        Self {
            heads: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LruCache<StreamKey, Commit>>> {
        self.heads
            .lock()
            .map_err(|_| Error::Storage("stream head tracker lock poisoned".to_string()))
    }

    /// Records `commit` as the head of its stream unless a newer one is known.
    pub fn track(&self, commit: &Commit) -> Result<()> {
        let mut heads = self.lock()?;
        let key = (commit.bucket_id.clone(), commit.stream_id.clone());

        let newer = heads
            .peek(&key)
            .map_or(true, |head| head.stream_revision < commit.stream_revision);
        if newer {
            heads.put(key, commit.clone());
        }
        Ok(())
    }

    /// The tracked head of a stream, without touching its LRU position.
    pub fn head(&self, bucket_id: &BucketId, stream_id: &StreamId) -> Option<Commit> {
        let heads = self.lock().ok()?;
        heads.peek(&(bucket_id.clone(), stream_id.clone())).cloned()
    }

    /// True when the stream has a tracked head.
    pub fn contains(&self, bucket_id: &BucketId, stream_id: &StreamId) -> bool {
        self.head(bucket_id, stream_id).is_some()
    }

    /// Number of tracked streams.
    pub fn len(&self) -> usize {
        self.lock().map(|heads| heads.len()).unwrap_or(0)
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn screen(head: &Commit, attempt: &CommitAttempt) -> Result<()> {
        if head.commit_id == attempt.commit_id {
            return Err(Error::DuplicateCommit {
                bucket_id: attempt.bucket_id.clone(),
                stream_id: attempt.stream_id.clone(),
                commit_id: attempt.commit_id,
            });
        }

        if head.commit_sequence >= attempt.commit_sequence
            || head.stream_revision >= attempt.stream_revision
        {
            return Err(Error::Concurrency {
                bucket_id: attempt.bucket_id.clone(),
                stream_id: attempt.stream_id.clone(),
                commit_sequence: attempt.commit_sequence,
                stream_revision: attempt.stream_revision,
            });
        }

        let expected_sequence = attempt.commit_sequence.as_raw().saturating_sub(1);
        let expected_revision = attempt
            .stream_revision
            .as_raw()
            .saturating_sub(attempt.events.len() as u64);
        if head.commit_sequence.as_raw() < expected_sequence
            || head.stream_revision.as_raw() < expected_revision
        {
            return Err(Error::Storage(format!(
                "attempt on '{}/{}' at sequence {} skips past the known head (sequence {}, revision {})",
                attempt.bucket_id,
                attempt.stream_id,
                attempt.commit_sequence,
                head.commit_sequence,
                head.stream_revision
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl PipelineHook for OptimisticPipelineHook {
    fn name(&self) -> &'static str {
        "optimistic-tracker"
    }

    fn select(&self, commit: Commit) -> Option<Commit> {
        if let Err(e) = self.track(&commit) {
            warn!(error = %e, "failed to track stream head");
        }
        Some(commit)
    }

    fn pre_commit(&self, attempt: &CommitAttempt) -> Result<bool> {
        let heads = self.lock()?;
        if let Some(head) = heads.peek(&(attempt.bucket_id.clone(), attempt.stream_id.clone())) {
            Self::screen(head, attempt)?;
        }
        Ok(true)
    }

    async fn post_commit(&self, commit: &Commit) -> Result<()> {
        self.track(commit)
    }

    fn on_purge(&self, bucket_id: Option<&BucketId>) {
        let Ok(mut heads) = self.lock() else { return };
        match bucket_id {
            None => heads.clear(),
            Some(bucket_id) => {
                let keys: Vec<StreamKey> = heads
                    .iter()
                    .filter(|(key, _)| &key.0 == bucket_id)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in keys {
                    heads.pop(&key);
                }
            }
        }
    }

    fn on_delete_stream(&self, bucket_id: &BucketId, stream_id: &StreamId) {
        if let Ok(mut heads) = self.lock() {
            heads.pop(&(bucket_id.clone(), stream_id.clone()));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{EventMessage, Payload};
    use crate::types::{CheckpointToken, CommitId, CommitSequence, StreamRev};
    use serde_json::json;

    fn attempt(stream: &str, sequence: u64, revision: u64, events: usize) -> CommitAttempt {
        CommitAttempt::new(
            "default",
            stream,
            StreamRev::from_raw(revision),
            CommitId::new(),
            CommitSequence::from_raw(sequence),
            (0..events)
                .map(|i| EventMessage::new(Payload::new("E", json!(i))))
                .collect(),
        )
    }

    fn commit(stream: &str, sequence: u64, revision: u64, events: usize) -> Commit {
        Commit::from_attempt(attempt(stream, sequence, revision, events), CheckpointToken::from_raw(1))
    }

    #[test]
    fn test_untracked_stream_is_allowed() {
        let tracker = OptimisticPipelineHook::new();
        assert!(tracker.pre_commit(&attempt("s", 5, 9, 1)).unwrap());
    }

    #[test]
    fn test_replayed_head_is_duplicate() {
        let tracker = OptimisticPipelineHook::new();
        let head = commit("s", 1, 2, 2);
        tracker.track(&head).unwrap();

        let mut replay = attempt("s", 1, 2, 2);
        replay.commit_id = head.commit_id;
        assert!(matches!(
            tracker.pre_commit(&replay),
            Err(Error::DuplicateCommit { .. })
        ));
    }

    #[test]
    fn test_stale_attempt_is_concurrency() {
        let tracker = OptimisticPipelineHook::new();
        tracker.track(&commit("s", 2, 4, 2)).unwrap();

        assert!(matches!(
            tracker.pre_commit(&attempt("s", 2, 5, 1)),
            Err(Error::Concurrency { .. })
        ));
        assert!(matches!(
            tracker.pre_commit(&attempt("s", 3, 4, 1)),
            Err(Error::Concurrency { .. })
        ));
    }

    #[test]
    fn test_gap_is_storage_error() {
        let tracker = OptimisticPipelineHook::new();
        tracker.track(&commit("s", 1, 2, 2)).unwrap();

        assert!(matches!(
            tracker.pre_commit(&attempt("s", 3, 3, 1)),
            Err(Error::Storage(_))
        ));
        assert!(matches!(
            tracker.pre_commit(&attempt("s", 2, 5, 1)),
            Err(Error::Storage(_))
        ));
        assert!(tracker.pre_commit(&attempt("s", 2, 4, 2)).unwrap());
    }

    #[test]
    fn test_older_commit_does_not_replace_head() {
        let tracker = OptimisticPipelineHook::new();
        let newer = commit("s", 2, 4, 2);
        tracker.track(&newer).unwrap();
        tracker.track(&commit("s", 1, 2, 2)).unwrap();

        let head = tracker
            .head(&BucketId::default(), &StreamId::new("s"))
            .unwrap();
        assert_eq!(head.commit_id, newer.commit_id);
    }

    #[test]
    fn test_least_recently_tracked_is_evicted() {
        let tracker = OptimisticPipelineHook::with_capacity(2);
        tracker.track(&commit("a", 1, 1, 1)).unwrap();
        tracker.track(&commit("b", 1, 1, 1)).unwrap();
        tracker.track(&commit("a", 2, 2, 1)).unwrap();
        tracker.track(&commit("c", 1, 1, 1)).unwrap();

        let bucket = BucketId::default();
        assert_eq!(tracker.len(), 2);
        assert!(tracker.contains(&bucket, &StreamId::new("a")));
        assert!(!tracker.contains(&bucket, &StreamId::new("b")));
        assert!(tracker.contains(&bucket, &StreamId::new("c")));
    }

    #[test]
    fn test_select_tracks_and_passes_through() {
        let tracker = OptimisticPipelineHook::new();
        let read = commit("s", 1, 1, 1);

        assert_eq!(tracker.select(read.clone()), Some(read));
        assert!(tracker.contains(&BucketId::default(), &StreamId::new("s")));
    }

    #[test]
    fn test_purge_and_delete_forget_heads() {
        let tracker = OptimisticPipelineHook::new();
        tracker.track(&commit("a", 1, 1, 1)).unwrap();
        tracker.track(&commit("b", 1, 1, 1)).unwrap();

        tracker.on_delete_stream(&BucketId::default(), &StreamId::new("a"));
        assert_eq!(tracker.len(), 1);

        tracker.on_purge(Some(&BucketId::new("other")));
        assert_eq!(tracker.len(), 1);

        tracker.on_purge(Some(&BucketId::default()));
        assert!(tracker.is_empty());
    }
}
