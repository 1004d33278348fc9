//! # Commit Pipeline
//!
//! An ordered chain of interceptors around every write and every read.
//!
//! ```text
//!   write:  attempt ─► pre_commit(h1) ─► pre_commit(h2) ─► engine ─► post_commit(h1, h2)
//!                            │ false           │ false
//!                            └──── veto ───────┘ (attempt silently dropped)
//!
//!   read:   commit ─► select(h1) ─► select(h2) ─► caller
//!                          │ None        │ None
//!                          └── omitted ──┘
//! ```
//!
//! ## Failure Isolation
//!
//! - `pre_commit` errors propagate: the attempt never reached storage
//! - `post_commit` errors are logged and swallowed: the commit is already
//!   durable and the writer must not be told otherwise
//! - `select` has no error channel; returning `None` suppresses the commit
//!
//! ## Rust Pattern: default trait methods
//!
//! Most hooks care about one or two extension points. Every method has a
//! pass-through default, so an implementation only overrides what it needs.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::commit::{Commit, CommitAttempt};
use crate::error::Result;
use crate::types::{BucketId, StreamId};

/// One interceptor in the commit pipeline.
#[async_trait]
pub trait PipelineHook: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str {
        "hook"
    }

    /// Read-time filter and transform. `None` drops the commit.
    fn select(&self, commit: Commit) -> Option<Commit> {
        Some(commit)
    }

    /// Veto point before storage. `Ok(false)` aborts silently; an error
    /// aborts and propagates to the writer.
    fn pre_commit(&self, _attempt: &CommitAttempt) -> Result<bool> {
        Ok(true)
    }

    /// Notification after a durable commit.
    async fn post_commit(&self, _commit: &Commit) -> Result<()> {
        Ok(())
    }

    /// All buckets (`None`) or one bucket was purged.
    fn on_purge(&self, _bucket_id: Option<&BucketId>) {}

    /// A stream was deleted.
    fn on_delete_stream(&self, _bucket_id: &BucketId, _stream_id: &StreamId) {}
}

/// Runs hooks in registration order.
#[derive(Clone, Default)]
pub struct Pipeline {
    hooks: Vec<Arc<dyn PipelineHook>>,
}

impl Pipeline {
    /// A pipeline over `hooks`, in order.
    pub fn new(hooks: Vec<Arc<dyn PipelineHook>>) -> Self {
        Self { hooks }
    }

    /// Appends a hook (builder style).
    pub fn with_hook(mut self, hook: Arc<dyn PipelineHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Number of hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// True when no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Passes a commit through every hook. Stops at the first `None`.
    pub fn select(&self, commit: Commit) -> Option<Commit> {
        self.hooks
            .iter()
            .try_fold(commit, |commit, hook| hook.select(commit))
    }

    /// [`select`](Self::select) over a batch, dropping suppressed commits.
    pub fn select_all(&self, commits: Vec<Commit>) -> Vec<Commit> {
        if self.hooks.is_empty() {
            return commits;
        }
        commits
            .into_iter()
            .filter_map(|commit| self.select(commit))
            .collect()
    }

    /// Asks every hook whether the attempt may proceed.
    ///
    /// Returns `Ok(false)` at the first veto without consulting later hooks.
    pub fn pre_commit(&self, attempt: &CommitAttempt) -> Result<bool> {
        for hook in &self.hooks {
            if !hook.pre_commit(attempt)? {
                debug!(
                    hook = hook.name(),
                    stream = %attempt.stream_id,
                    sequence = %attempt.commit_sequence,
                    "attempt vetoed"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Notifies every hook. Failures are logged, never returned.
    pub async fn post_commit(&self, commit: &Commit) {
        for hook in &self.hooks {
            if let Err(e) = hook.post_commit(commit).await {
                warn!(
                    hook = hook.name(),
                    checkpoint = %commit.checkpoint,
                    error = %e,
                    "post-commit hook failed"
                );
            }
        }
    }

    /// Tells every hook about a purge.
    pub fn on_purge(&self, bucket_id: Option<&BucketId>) {
        for hook in &self.hooks {
            hook.on_purge(bucket_id);
        }
    }

    /// Tells every hook about a deleted stream.
    pub fn on_delete_stream(&self, bucket_id: &BucketId, stream_id: &StreamId) {
        for hook in &self.hooks {
            hook.on_delete_stream(bucket_id, stream_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{EventMessage, Payload};
    use crate::error::Error;
    use crate::types::{CheckpointToken, CommitId, CommitSequence, StreamRev};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Veto;
    impl PipelineHook for Veto {
        fn pre_commit(&self, _attempt: &CommitAttempt) -> Result<bool> {
            Ok(false)
        }
        fn select(&self, _commit: Commit) -> Option<Commit> {
            None
        }
    }

    #[derive(Default)]
    struct Counting {
        pre: AtomicUsize,
        selected: AtomicUsize,
        posted: AtomicUsize,
    }

    #[async_trait]
    impl PipelineHook for Counting {
        fn select(&self, commit: Commit) -> Option<Commit> {
            self.selected.fetch_add(1, Ordering::SeqCst);
            Some(commit)
        }
        fn pre_commit(&self, _attempt: &CommitAttempt) -> Result<bool> {
            self.pre.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
        async fn post_commit(&self, _commit: &Commit) -> Result<()> {
            self.posted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;
    #[async_trait]
    impl PipelineHook for Failing {
        async fn post_commit(&self, _commit: &Commit) -> Result<()> {
            Err(Error::Storage("bus down".into()))
        }
    }

    fn attempt() -> CommitAttempt {
        CommitAttempt::new(
            "default",
            "s",
            StreamRev::FIRST,
            CommitId::new(),
            CommitSequence::FIRST,
            vec![EventMessage::new(Payload::new("E", json!(null)))],
        )
    }

    #[test]
    fn test_veto_short_circuits() {
        let counting = Arc::new(Counting::default());
        let pipeline = Pipeline::default()
            .with_hook(Arc::new(Veto))
            .with_hook(counting.clone());

        assert!(!pipeline.pre_commit(&attempt()).unwrap());
        assert_eq!(counting.pre.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_select_none_omits_commit() {
        let counting = Arc::new(Counting::default());
        let pipeline = Pipeline::default()
            .with_hook(Arc::new(Veto))
            .with_hook(counting.clone());
        let commit = Commit::from_attempt(attempt(), CheckpointToken::from_raw(1));

        assert!(pipeline.select_all(vec![commit]).is_empty());
        assert_eq!(counting.selected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_post_commit_failure_is_isolated() {
        let counting = Arc::new(Counting::default());
        let failing: Arc<dyn PipelineHook> = Arc::new(Failing);
        let pipeline = Pipeline::new(vec![failing, counting.clone()]);
        let commit = Commit::from_attempt(attempt(), CheckpointToken::from_raw(1));

        pipeline.post_commit(&commit).await;
        assert_eq!(counting.posted.load(Ordering::SeqCst), 1);
    }
}
