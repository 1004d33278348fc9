//! # Event Store
//!
//! [`EventStore`] is the entry point applications hold. It wraps a storage
//! engine in the commit [`Pipeline`] and hands out [`EventStream`]s.
//!
//! ```text
//!   EventStore ──────────────────────────────────────────────┐
//!   │ commit:  validate → pre_commit hooks → engine → post_commit hooks
//!   │ reads:   engine → select hooks (every read path, feeds included)
//!   │ purge / delete: engine → hook notifications
//!   └──────────────────────────────────────────────────────────┘
//! ```
//!
//! `EventStore` itself implements [`PersistStreams`], so anything that takes
//! an engine (streams, polling clients, dispatch schedulers) can take the
//! store instead and get the hooks for free.
//!
//! ## Rust Pattern: cheap `Clone`
//!
//! The store is an `Arc` around its parts. Clones share the engine and the
//! hooks, so passing a store to a spawned task is a pointer copy.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::commit::{Commit, CommitAttempt, Snapshot, StreamHead};
use crate::error::Result;
use crate::persistence::PersistStreams;
use crate::pipeline::{Pipeline, PipelineHook};
use crate::stream::EventStream;
use crate::types::{BucketId, CheckpointToken, StreamId, StreamRev};

struct Inner {
    persistence: Arc<dyn PersistStreams>,
    pipeline: Pipeline,
}

/// A storage engine plus its commit pipeline.
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<Inner>,
}

impl EventStore {
    /// Wraps `persistence` with the given hooks, in order.
    pub fn new(persistence: Arc<dyn PersistStreams>, hooks: Vec<Arc<dyn PipelineHook>>) -> Self {
        Self::with_pipeline(persistence, Pipeline::new(hooks))
    }

    /// Wraps `persistence` with an existing pipeline.
    pub fn with_pipeline(persistence: Arc<dyn PersistStreams>, pipeline: Pipeline) -> Self {
        Self {
            inner: Arc::new(Inner {
                persistence,
                pipeline,
            }),
        }
    }

    /// The engine without the pipeline.
    pub fn advanced(&self) -> &Arc<dyn PersistStreams> {
        &self.inner.persistence
    }

    /// The hook chain.
    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    fn as_persistence(&self) -> Arc<dyn PersistStreams> {
        Arc::new(self.clone())
    }

    /// A new, empty stream.
    pub fn create_stream(
        &self,
        bucket_id: impl Into<BucketId>,
        stream_id: impl Into<StreamId>,
    ) -> EventStream {
        EventStream::create(self.as_persistence(), bucket_id, stream_id)
    }

    /// Opens a stream over `min_revision..=max_revision`.
    ///
    /// Pass [`StreamRev::NONE`] as the minimum to open a stream that may not
    /// exist yet.
    pub async fn open_stream(
        &self,
        bucket_id: impl Into<BucketId>,
        stream_id: impl Into<StreamId>,
        min_revision: StreamRev,
        max_revision: StreamRev,
    ) -> Result<EventStream> {
        EventStream::open(
            self.as_persistence(),
            bucket_id,
            stream_id,
            min_revision,
            max_revision,
        )
        .await
    }

    /// Opens a stream from a snapshot, loading events up to `max_revision`.
    pub async fn open_stream_from_snapshot(
        &self,
        snapshot: &Snapshot,
        max_revision: StreamRev,
    ) -> Result<EventStream> {
        EventStream::open_from_snapshot(self.as_persistence(), snapshot, max_revision).await
    }
}

#[async_trait]
impl PersistStreams for EventStore {
    async fn initialize(&self) -> Result<()> {
        self.inner.persistence.initialize().await
    }

    /// Runs the attempt through the pipeline.
    ///
    /// Returns `Ok(None)` when a hook vetoes the attempt.
    async fn commit(&self, attempt: CommitAttempt) -> Result<Option<Commit>> {
        attempt.validate()?;

        if !self.inner.pipeline.pre_commit(&attempt)? {
            return Ok(None);
        }

        let committed = self.inner.persistence.commit(attempt).await?;
        if let Some(commit) = &committed {
            self.inner.pipeline.post_commit(commit).await;
        } else {
            debug!("engine declined the attempt");
        }
        Ok(committed)
    }

    async fn get_from(
        &self,
        bucket_id: &BucketId,
        stream_id: &StreamId,
        min_revision: StreamRev,
        max_revision: StreamRev,
    ) -> Result<Vec<Commit>> {
        let commits = self
            .inner
            .persistence
            .get_from(bucket_id, stream_id, min_revision, max_revision)
            .await?;
        Ok(self.inner.pipeline.select_all(commits))
    }

    async fn get_from_checkpoint(&self, checkpoint: CheckpointToken) -> Result<Vec<Commit>> {
        let commits = self.inner.persistence.get_from_checkpoint(checkpoint).await?;
        Ok(self.inner.pipeline.select_all(commits))
    }

    async fn get_from_bucket_checkpoint(
        &self,
        bucket_id: &BucketId,
        checkpoint: CheckpointToken,
    ) -> Result<Vec<Commit>> {
        let commits = self
            .inner
            .persistence
            .get_from_bucket_checkpoint(bucket_id, checkpoint)
            .await?;
        Ok(self.inner.pipeline.select_all(commits))
    }

    async fn get_from_to(&self, from: CheckpointToken, to: CheckpointToken) -> Result<Vec<Commit>> {
        let commits = self.inner.persistence.get_from_to(from, to).await?;
        Ok(self.inner.pipeline.select_all(commits))
    }

    /// Pages hidden entirely by a select hook are skipped, so an empty result
    /// means the feed is exhausted.
    async fn get_page_from_checkpoint(
        &self,
        bucket_id: Option<&BucketId>,
        checkpoint: CheckpointToken,
        limit: usize,
    ) -> Result<Vec<Commit>> {
        let mut from = checkpoint;
        loop {
            let page = self
                .inner
                .persistence
                .get_page_from_checkpoint(bucket_id, from, limit)
                .await?;
            let full = limit > 0 && page.len() >= limit;
            let Some(last) = page.last().map(|c| c.checkpoint) else {
                return Ok(page);
            };

            let selected = self.inner.pipeline.select_all(page);
            if !selected.is_empty() || !full {
                return Ok(selected);
            }
            from = last;
        }
    }

    async fn get_streams_to_snapshot(
        &self,
        bucket_id: &BucketId,
        max_threshold: u64,
    ) -> Result<Vec<StreamHead>> {
        self.inner
            .persistence
            .get_streams_to_snapshot(bucket_id, max_threshold)
            .await
    }

    async fn get_snapshot(
        &self,
        bucket_id: &BucketId,
        stream_id: &StreamId,
        max_revision: StreamRev,
    ) -> Result<Option<Snapshot>> {
        self.inner
            .persistence
            .get_snapshot(bucket_id, stream_id, max_revision)
            .await
    }

    async fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool> {
        self.inner.persistence.add_snapshot(snapshot).await
    }

    async fn get_undispatched_commits(&self) -> Result<Vec<Commit>> {
        let commits = self.inner.persistence.get_undispatched_commits().await?;
        Ok(self.inner.pipeline.select_all(commits))
    }

    async fn mark_commit_as_dispatched(&self, commit: &Commit) -> Result<()> {
        self.inner.persistence.mark_commit_as_dispatched(commit).await
    }

    async fn purge(&self) -> Result<()> {
        self.inner.persistence.purge().await?;
        self.inner.pipeline.on_purge(None);
        Ok(())
    }

    async fn purge_bucket(&self, bucket_id: &BucketId) -> Result<()> {
        self.inner.persistence.purge_bucket(bucket_id).await?;
        self.inner.pipeline.on_purge(Some(bucket_id));
        Ok(())
    }

    async fn drop_all(&self) -> Result<()> {
        self.inner.persistence.drop_all().await?;
        self.inner.pipeline.on_purge(None);
        Ok(())
    }

    async fn delete_stream(&self, bucket_id: &BucketId, stream_id: &StreamId) -> Result<()> {
        self.inner
            .persistence
            .delete_stream(bucket_id, stream_id)
            .await?;
        self.inner.pipeline.on_delete_stream(bucket_id, stream_id);
        Ok(())
    }

    async fn dispose(&self) {
        self.inner.persistence.dispose().await;
    }

    fn is_disposed(&self) -> bool {
        self.inner.persistence.is_disposed()
    }
}

// =============================================================================
// Tests
// =============================================================================
