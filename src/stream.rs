//! # Event Stream Reconstruction
//!
//! An [`EventStream`] is the caller's working copy of one stream: the events
//! already committed (within a revision window) plus the events the caller
//! has added but not yet committed.
//!
//! ## Reconstruction
//!
//! Commits arrive ascending by commit sequence, each covering a run of
//! revisions. For a window `[min, max]`:
//!
//! ```text
//!   commit:      [1 2] [3 4] [5 6] [7 8]
//!   window 3..5:        ^^^^^ ^
//!   committed:          3 4   5           stream_revision = 5
//!                                          commit_sequence = 3
//! ```
//!
//! - a commit starting past `max` ends reconstruction
//! - events below `min` are skipped, events above `max` end the commit
//! - the last commit sequence and copied revision become the point the next
//!   commit is built from
//!
//! ## Conflict Recovery
//!
//! When `commit_changes` loses a race, the stream pulls in every commit after
//! its current revision before returning [`Error::Concurrency`]. The caller
//! re-applies its logic against the refreshed stream and commits again;
//! uncommitted events are kept so nothing has to be re-added.
//!
//! ## Ownership
//!
//! An `EventStream` belongs to one caller. Mutating methods take `&mut self`,
//! so the borrow checker rules out sharing one across tasks.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::commit::{Commit, CommitAttempt, EventMessage, Snapshot};
use crate::error::{Error, Result};
use crate::persistence::PersistStreams;
use crate::types::{BucketId, CommitId, CommitSequence, Headers, StreamId, StreamRev};

/// A caller-owned view of one stream.
pub struct EventStream {
    persistence: Arc<dyn PersistStreams>,
    bucket_id: BucketId,
    stream_id: StreamId,
    stream_revision: StreamRev,
    commit_sequence: CommitSequence,
    committed: Vec<EventMessage>,
    committed_headers: Headers,
    uncommitted: Vec<EventMessage>,
    uncommitted_headers: Headers,
    identifiers: HashSet<CommitId>,
    disposed: bool,
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("bucket_id", &self.bucket_id)
            .field("stream_id", &self.stream_id)
            .field("stream_revision", &self.stream_revision)
            .field("commit_sequence", &self.commit_sequence)
            .field("committed", &self.committed.len())
            .field("uncommitted", &self.uncommitted.len())
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl EventStream {
    /// A new, empty stream. Nothing is read from storage.
    pub fn create(
        persistence: Arc<dyn PersistStreams>,
        bucket_id: impl Into<BucketId>,
        stream_id: impl Into<StreamId>,
    ) -> Self {
        Self {
            persistence,
            bucket_id: bucket_id.into(),
            stream_id: stream_id.into(),
            stream_revision: StreamRev::NONE,
            commit_sequence: CommitSequence::NONE,
            committed: Vec::new(),
            committed_headers: Headers::new(),
            uncommitted: Vec::new(),
            uncommitted_headers: Headers::new(),
            identifiers: HashSet::new(),
            disposed: false,
        }
    }

    /// Loads the events in `min_revision..=max_revision`.
    ///
    /// # Errors
    ///
    /// [`Error::StreamNotFound`] when `min_revision` is above zero and no
    /// event falls in the window.
    pub async fn open(
        persistence: Arc<dyn PersistStreams>,
        bucket_id: impl Into<BucketId>,
        stream_id: impl Into<StreamId>,
        min_revision: StreamRev,
        max_revision: StreamRev,
    ) -> Result<Self> {
        let mut stream = Self::create(persistence, bucket_id, stream_id);

        let commits = stream
            .persistence
            .get_from(&stream.bucket_id, &stream.stream_id, min_revision, max_revision)
            .await?;
        stream.populate(min_revision, max_revision, commits);

        if !min_revision.is_none() && stream.committed.is_empty() {
            return Err(Error::StreamNotFound {
                bucket_id: stream.bucket_id,
                stream_id: stream.stream_id,
            });
        }
        Ok(stream)
    }

    /// Loads the events after `snapshot` up to `max_revision`.
    ///
    /// The snapshot stands in for everything at or before its revision.
    pub async fn open_from_snapshot(
        persistence: Arc<dyn PersistStreams>,
        snapshot: &Snapshot,
        max_revision: StreamRev,
    ) -> Result<Self> {
        let mut stream = Self::create(
            persistence,
            snapshot.bucket_id.clone(),
            snapshot.stream_id.clone(),
        );

        let commits = stream
            .persistence
            .get_from(
                &stream.bucket_id,
                &stream.stream_id,
                snapshot.stream_revision,
                max_revision,
            )
            .await?;
        stream.populate(snapshot.stream_revision.next(), max_revision, commits);
        stream.stream_revision = snapshot
            .stream_revision
            .add(stream.committed.len() as u64);
        Ok(stream)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The stream's bucket.
    pub fn bucket_id(&self) -> &BucketId {
        &self.bucket_id
    }

    /// The stream's id.
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Revision of the last committed event seen.
    pub fn stream_revision(&self) -> StreamRev {
        self.stream_revision
    }

    /// Sequence of the last commit seen.
    pub fn commit_sequence(&self) -> CommitSequence {
        self.commit_sequence
    }

    /// Committed events inside the loaded window, in revision order.
    pub fn committed_events(&self) -> &[EventMessage] {
        &self.committed
    }

    /// Headers merged from every loaded commit; later commits win.
    pub fn committed_headers(&self) -> &Headers {
        &self.committed_headers
    }

    /// Events added since the last commit.
    pub fn uncommitted_events(&self) -> &[EventMessage] {
        &self.uncommitted
    }

    /// Headers for the next commit.
    pub fn uncommitted_headers(&self) -> &Headers {
        &self.uncommitted_headers
    }

    /// Mutable headers for the next commit.
    pub fn uncommitted_headers_mut(&mut self) -> &mut Headers {
        &mut self.uncommitted_headers
    }

    /// True when there are uncommitted events.
    pub fn has_changes(&self) -> bool {
        !self.disposed && !self.uncommitted.is_empty()
    }

    /// True once disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Queues an event for the next commit.
    pub fn add(&mut self, event: EventMessage) -> Result<()> {
        self.ensure_open()?;
        self.uncommitted.push(event);
        Ok(())
    }

    /// Drops uncommitted events and headers.
    pub fn clear_changes(&mut self) {
        self.uncommitted.clear();
        self.uncommitted_headers.clear();
    }

    /// Commits the uncommitted events under `commit_id`.
    ///
    /// Nothing to commit is a no-op. A pipeline veto discards the changes
    /// without an error.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateCommit`] when `commit_id` is already part of this
    ///   stream
    /// - [`Error::Concurrency`] when another writer got there first; the
    ///   stream has been refreshed and the changes are kept
    pub async fn commit_changes(&mut self, commit_id: CommitId) -> Result<()> {
        self.ensure_open()?;

        if self.identifiers.contains(&commit_id) {
            return Err(Error::DuplicateCommit {
                bucket_id: self.bucket_id.clone(),
                stream_id: self.stream_id.clone(),
                commit_id,
            });
        }

        if !self.has_changes() {
            return Ok(());
        }

        let attempt = self.build_attempt(commit_id);
        let target = attempt.stream_revision;

        match self.persistence.commit(attempt).await {
            Ok(committed) => {
                debug!(
                    stream = %self.stream_id,
                    revision = %target,
                    vetoed = committed.is_none(),
                    "changes committed"
                );
                self.populate(self.stream_revision.next(), target, committed.into_iter());
                self.clear_changes();
                Ok(())
            }
            Err(err @ Error::Concurrency { .. }) => {
                info!(
                    stream = %self.stream_id,
                    revision = %self.stream_revision,
                    "concurrent write detected, refreshing stream"
                );
                let from = self.stream_revision.next();
                match self
                    .persistence
                    .get_from(&self.bucket_id, &self.stream_id, from, StreamRev::MAX)
                    .await
                {
                    Ok(commits) => self.populate(from, StreamRev::MAX, commits),
                    Err(refresh) => {
                        warn!(stream = %self.stream_id, error = %refresh, "refresh after conflict failed")
                    }
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Marks the stream unusable. Safe to call more than once.
    pub fn dispose(&mut self) {
        self.disposed = true;
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn ensure_open(&self) -> Result<()> {
        if self.disposed {
            return Err(Error::Disposed("event stream"));
        }
        Ok(())
    }

    fn build_attempt(&self, commit_id: CommitId) -> CommitAttempt {
        CommitAttempt::new(
            self.bucket_id.clone(),
            self.stream_id.clone(),
            self.stream_revision.add(self.uncommitted.len() as u64),
            commit_id,
            self.commit_sequence.next(),
            self.uncommitted.clone(),
        )
        .with_headers(self.uncommitted_headers.clone())
    }

    fn populate(
        &mut self,
        min_revision: StreamRev,
        max_revision: StreamRev,
        commits: impl IntoIterator<Item = Commit>,
    ) {
        for commit in commits {
            self.identifiers.insert(commit.commit_id);
            self.commit_sequence = commit.commit_sequence;

            let mut current = commit.first_revision();
            if current > max_revision {
                return;
            }

            self.committed_headers.extend(commit.headers);

            for event in commit.events {
                if current > max_revision {
                    break;
                }
                if current >= min_revision {
                    self.committed.push(event);
                    self.stream_revision = current;
                }
                current = current.next();
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
