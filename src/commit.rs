//! # Commit Model
//!
//! Immutable value records for proposed and persisted batches of events.
//!
//! ```text
//!   CommitAttempt ──(storage engine)──► Commit
//!   ─────────────                      ──────
//!   bucket / stream                    same fields
//!   stream_revision (last event)       + checkpoint token
//!   commit_sequence
//!   commit_id
//!   events: [EventMessage; n ≥ 1]
//! ```
//!
//! A commit holding `n` events that ends at revision `r` covers revisions
//! `r - n + 1 ..= r`. Everything that reasons about revision windows goes
//! through [`CommitAttempt::first_revision`] / [`Commit::first_revision`].

use serde::{Deserialize, Serialize};

use crate::codec::current_time_ms;
use crate::error::{Error, Result};
use crate::types::{
    BucketId, CheckpointToken, CommitId, CommitSequence, Headers, StreamId, StreamRev,
};

// =============================================================================
// Events
// =============================================================================

/// The body of one event: a kind name plus untyped data.
///
/// `kind` names the shape of `data`. Upconverters are registered per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Name of the event shape, e.g. `"OrderPlaced.v1"`.
    pub kind: String,
    /// The event data.
    pub data: serde_json::Value,
}

impl Payload {
    /// Creates a payload.
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// One domain event together with its headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Event-level headers.
    pub headers: Headers,
    /// The event body.
    pub body: Payload,
}

impl EventMessage {
    /// Creates an event with no headers.
    pub fn new(body: Payload) -> Self {
        Self {
            headers: Headers::new(),
            body,
        }
    }

    /// Adds a header (builder style).
    pub fn with_header(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.headers.insert(key.into(), value);
        self
    }
}

// =============================================================================
// Commit Attempt
// =============================================================================

/// A proposed, not-yet-durable unit of work against one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitAttempt {
    /// Namespace of the stream.
    pub bucket_id: BucketId,
    /// The target stream.
    pub stream_id: StreamId,
    /// Revision of the last event in this attempt.
    pub stream_revision: StreamRev,
    /// Idempotence key.
    pub commit_id: CommitId,
    /// Ordinal of this commit within the stream.
    pub commit_sequence: CommitSequence,
    /// Wall-clock milliseconds since the Unix epoch. Informational only.
    pub commit_stamp_ms: u64,
    /// Commit-level headers.
    pub headers: Headers,
    /// The events, in revision order.
    pub events: Vec<EventMessage>,
}

impl CommitAttempt {
    /// Creates an attempt stamped with the current time and no headers.
    pub fn new(
        bucket_id: impl Into<BucketId>,
        stream_id: impl Into<StreamId>,
        stream_revision: StreamRev,
        commit_id: CommitId,
        commit_sequence: CommitSequence,
        events: Vec<EventMessage>,
    ) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            stream_id: stream_id.into(),
            stream_revision,
            commit_id,
            commit_sequence,
            commit_stamp_ms: current_time_ms(),
            headers: Headers::new(),
            events,
        }
    }

    /// Replaces the commit headers (builder style).
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Revision of the first event in this attempt.
    pub fn first_revision(&self) -> StreamRev {
        first_revision(self.stream_revision, self.events.len())
    }

    /// True when there is nothing to persist.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Checks the attempt against the commit model.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidAttempt`] for blank ids, a nil commit id, a zero
    /// sequence or revision, no events, a revision smaller than the number
    /// of events, or a sequence or revision above the storable maximum.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_id.as_str().trim().is_empty() {
            return Err(Error::InvalidAttempt("bucket id is blank".into()));
        }
        if self.stream_id.as_str().trim().is_empty() {
            return Err(Error::InvalidAttempt("stream id is blank".into()));
        }
        if self.commit_id.is_nil() {
            return Err(Error::InvalidAttempt("commit id is nil".into()));
        }
        if self.commit_sequence == CommitSequence::NONE {
            return Err(Error::InvalidAttempt("commit sequence must be at least 1".into()));
        }
        if self.stream_revision.is_none() {
            return Err(Error::InvalidAttempt("stream revision must be at least 1".into()));
        }
        if self.commit_sequence > CommitSequence::MAX {
            return Err(Error::InvalidAttempt(format!(
                "commit sequence {} exceeds {}",
                self.commit_sequence,
                CommitSequence::MAX
            )));
        }
        if self.stream_revision > StreamRev::MAX {
            return Err(Error::InvalidAttempt(format!(
                "stream revision {} exceeds {}",
                self.stream_revision,
                StreamRev::MAX
            )));
        }
        if self.events.is_empty() {
            return Err(Error::InvalidAttempt("attempt has no events".into()));
        }
        if self.stream_revision.as_raw() < self.events.len() as u64 {
            return Err(Error::InvalidAttempt(format!(
                "stream revision {} is smaller than the event count {}",
                self.stream_revision,
                self.events.len()
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Commit
// =============================================================================

/// The durable counterpart of a [`CommitAttempt`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// Namespace of the stream.
    pub bucket_id: BucketId,
    /// The stream.
    pub stream_id: StreamId,
    /// Revision of the last event in this commit.
    pub stream_revision: StreamRev,
    /// Idempotence key.
    pub commit_id: CommitId,
    /// Ordinal of this commit within the stream.
    pub commit_sequence: CommitSequence,
    /// Wall-clock milliseconds since the Unix epoch.
    pub commit_stamp_ms: u64,
    /// Commit-level headers.
    pub headers: Headers,
    /// The events, in revision order.
    pub events: Vec<EventMessage>,
    /// Position in the global feed.
    pub checkpoint: CheckpointToken,
}

impl Commit {
    /// Builds the durable commit for an attempt.
    pub fn from_attempt(attempt: CommitAttempt, checkpoint: CheckpointToken) -> Self {
        Self {
            bucket_id: attempt.bucket_id,
            stream_id: attempt.stream_id,
            stream_revision: attempt.stream_revision,
            commit_id: attempt.commit_id,
            commit_sequence: attempt.commit_sequence,
            commit_stamp_ms: attempt.commit_stamp_ms,
            headers: attempt.headers,
            events: attempt.events,
            checkpoint,
        }
    }

    /// Revision of the first event in this commit.
    pub fn first_revision(&self) -> StreamRev {
        first_revision(self.stream_revision, self.events.len())
    }

    /// True when this commit covers any revision in `min..=max`.
    pub fn overlaps(&self, min: StreamRev, max: StreamRev) -> bool {
        self.stream_revision >= min && self.first_revision() <= max
    }
}

fn first_revision(last: StreamRev, count: usize) -> StreamRev {
    StreamRev::from_raw(last.as_raw().saturating_add(1).saturating_sub(count as u64))
}

// =============================================================================
// Snapshots and Heads
// =============================================================================

/// A materialized state capture of a stream at a given revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Namespace of the stream.
    pub bucket_id: BucketId,
    /// The stream.
    pub stream_id: StreamId,
    /// Revision the snapshot reflects.
    pub stream_revision: StreamRev,
    /// Opaque snapshot state.
    pub payload: serde_json::Value,
}

impl Snapshot {
    /// Creates a snapshot.
    pub fn new(
        bucket_id: impl Into<BucketId>,
        stream_id: impl Into<StreamId>,
        stream_revision: StreamRev,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            stream_id: stream_id.into(),
            stream_revision,
            payload,
        }
    }
}

/// Materialized summary of a stream, used to find snapshot candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHead {
    /// Namespace of the stream.
    pub bucket_id: BucketId,
    /// The stream.
    pub stream_id: StreamId,
    /// Highest committed revision.
    pub head_revision: StreamRev,
    /// Highest revision with a snapshot, or [`StreamRev::NONE`].
    pub snapshot_revision: StreamRev,
}

impl StreamHead {
    /// Number of events committed since the latest snapshot.
    pub fn unsnapshotted(&self) -> u64 {
        self.head_revision
            .as_raw()
            .saturating_sub(self.snapshot_revision.as_raw())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(n: u64) -> EventMessage {
        EventMessage::new(Payload::new("Counted", json!({ "n": n })))
    }

    fn attempt(revision: u64, sequence: u64, count: usize) -> CommitAttempt {
        CommitAttempt::new(
            "default",
            "stream-1",
            StreamRev::from_raw(revision),
            CommitId::new(),
            CommitSequence::from_raw(sequence),
            (0..count as u64).map(event).collect(),
        )
    }

    #[test]
    fn test_first_revision() {
        assert_eq!(attempt(7, 3, 3).first_revision(), StreamRev::from_raw(5));
        assert_eq!(attempt(1, 1, 1).first_revision(), StreamRev::FIRST);
        assert_eq!(attempt(u64::MAX, 1, 1).first_revision(), StreamRev::from_raw(u64::MAX));
    }

    #[test]
    fn test_validate_accepts_well_formed_attempt() {
        assert!(attempt(2, 1, 2).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_malformed_attempts() {
        assert!(matches!(attempt(0, 1, 1).validate(), Err(Error::InvalidAttempt(_))));
        assert!(matches!(attempt(1, 0, 1).validate(), Err(Error::InvalidAttempt(_))));
        assert!(matches!(attempt(1, 1, 0).validate(), Err(Error::InvalidAttempt(_))));
        assert!(matches!(attempt(1, 1, 2).validate(), Err(Error::InvalidAttempt(_))));

        assert!(matches!(
            attempt(u64::MAX, 1, 1).validate(),
            Err(Error::InvalidAttempt(_))
        ));
        assert!(matches!(
            attempt(1, u64::MAX, 1).validate(),
            Err(Error::InvalidAttempt(_))
        ));
        assert!(attempt(i64::MAX as u64, i64::MAX as u64, 1).validate().is_ok());

        let mut blank = attempt(1, 1, 1);
        blank.stream_id = StreamId::new("  ");
        assert!(matches!(blank.validate(), Err(Error::InvalidAttempt(_))));
    }

    #[test]
    fn test_commit_overlap() {
        let commit = Commit::from_attempt(attempt(4, 2, 2), CheckpointToken::from_raw(2));
        // covers revisions 3..=4
        assert!(commit.overlaps(StreamRev::from_raw(3), StreamRev::from_raw(5)));
        assert!(commit.overlaps(StreamRev::from_raw(4), StreamRev::from_raw(4)));
        assert!(!commit.overlaps(StreamRev::from_raw(5), StreamRev::MAX));
        assert!(!commit.overlaps(StreamRev::FIRST, StreamRev::from_raw(2)));
    }

    #[test]
    fn test_unsnapshotted_count() {
        let head = StreamHead {
            bucket_id: BucketId::default(),
            stream_id: StreamId::new("s"),
            head_revision: StreamRev::from_raw(12),
            snapshot_revision: StreamRev::from_raw(5),
        };
        assert_eq!(head.unsnapshotted(), 7);
    }
}
