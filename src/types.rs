//! # Domain Types for SpiteStore
//!
//! This module defines the identifiers and counters used throughout
//! SpiteStore: buckets, streams, revisions, commit sequences, commit ids and
//! checkpoint tokens.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Every counter in the commit model is a `u64` or `i64` underneath, and they
//! are trivially confused: a commit sequence of 3 says nothing about the
//! stream revision, and neither says anything about the global checkpoint.
//! Wrapping each in its own single-field struct makes those mix-ups a compile
//! error.
//!
//! ```rust
//! use spitestore::types::{CommitSequence, StreamRev};
//!
//! fn example(seq: CommitSequence, rev: StreamRev) {
//!     // seq == rev  // Won't compile
//! }
//! ```
//!
//! ## Invariants
//!
//! - [`StreamRev`]: 1-based, strictly increasing per stream, no gaps
//! - [`CommitSequence`]: 1-based, increases by exactly one per commit
//! - [`CheckpointToken`]: strictly increasing across the whole store, never reused
//! - [`StreamHash`]: deterministic hash of [`StreamId`], picks the stream's reader shard

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Event and commit headers.
///
/// Values are untyped JSON so nulls, numbers, strings and nested objects all
/// survive a serialization round trip.
pub type Headers = HashMap<String, serde_json::Value>;

// =============================================================================
// Buckets
// =============================================================================

/// A namespace partition under which stream ids are scoped.
///
/// Two streams with the same [`StreamId`] in different buckets are unrelated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketId(String);

impl BucketId {
    /// Name of the bucket used when the caller does not pick one.
    pub const DEFAULT: &'static str = "default";

    /// Creates a bucket id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BucketId {
    fn default() -> Self {
        Self::new(Self::DEFAULT)
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BucketId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for BucketId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Stream Identification
// =============================================================================

/// A human-readable identifier for an event stream.
///
/// # What is a Stream?
///
/// In event sourcing, a stream is the event history of a single entity, e.g.
/// `"order-abc-123"`. Streams are scoped by a [`BucketId`].
///
/// # Rust Pattern: impl Into<String>
///
/// `StreamId::new` accepts both `&str` and `String`, so call sites never need
/// an explicit `.to_string()`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Creates a new stream ID from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this stream ID.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Computes the XXH3 hash of this stream ID.
    ///
    /// The hash is stored next to every commit row for indexed lookups and
    /// selects the reader shard that serves the stream. XXH3 is formally
    /// specified, so the same id hashes identically on every platform.
    pub fn hash(&self) -> StreamHash {
        // xxh3_64 produces a u64, we cast to i64 for SQLite INTEGER storage
        StreamHash(xxhash_rust::xxh3::xxh3_64(self.0.as_bytes()) as i64)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A hash of a [`StreamId`].
///
/// Stored as INTEGER in SQLite (8 bytes, signed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHash(i64);

impl StreamHash {
    /// Creates a StreamHash from a raw integer value.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw integer value for database storage.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for StreamHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// =============================================================================
// Revisions and Sequences
// =============================================================================

/// A revision number within a stream: the 1-based position of one event.
///
/// # Relationship to Commits
///
/// A commit carries the revision of its *last* event. A commit holding three
/// events that ends at revision 7 covers revisions 5, 6 and 7.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StreamRev(u64);

impl StreamRev {
    /// Revision of an empty stream.
    pub const NONE: StreamRev = StreamRev(0);

    /// Revision of the first event.
    pub const FIRST: StreamRev = StreamRev(1);

    /// Upper bound used for open-ended range reads.
    ///
    /// Capped at `i64::MAX` so it still fits an SQLite INTEGER.
    pub const MAX: StreamRev = StreamRev(i64::MAX as u64);

    /// Creates a StreamRev from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns true for [`StreamRev::NONE`].
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// Returns the next revision.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Adds an offset to this revision.
    pub fn add(&self, count: u64) -> Self {
        Self(self.0.saturating_add(count))
    }

    /// Returns the value bound as an SQLite INTEGER, clamped to [`StreamRev::MAX`].
    pub fn to_sql(&self) -> i64 {
        self.0.min(Self::MAX.0) as i64
    }
}

impl fmt::Display for StreamRev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The 1-based ordinal of a commit within its stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CommitSequence(u64);

impl CommitSequence {
    /// Sequence of a stream that has no commits yet.
    pub const NONE: CommitSequence = CommitSequence(0);

    /// Sequence of the first commit.
    pub const FIRST: CommitSequence = CommitSequence(1);

    /// Largest sequence an SQLite INTEGER can hold.
    pub const MAX: CommitSequence = CommitSequence(i64::MAX as u64);

    /// Creates a CommitSequence from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the next sequence.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for CommitSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Commit Identity
// =============================================================================

/// Globally unique identifier of one commit attempt.
///
/// Replaying an attempt with the same id is detected as a duplicate rather
/// than a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(Uuid);

impl CommitId {
    /// Creates a fresh random commit id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the wrapped UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// True for the all-zero UUID, which is never a valid commit id.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for CommitId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CommitId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Storage(format!("invalid commit id '{}': {}", s, e)))
    }
}

// =============================================================================
// Checkpoints
// =============================================================================

/// A position in the global commit feed.
///
/// # Invariants
///
/// - Assigned by the storage engine when a commit becomes durable
/// - Strictly increases across all buckets and streams
/// - Never reused, even after a stream is deleted
/// - [`CheckpointToken::START`] (0) means "from the beginning"
///
/// # Portability
///
/// The token is an `i64` internally but crosses API boundaries as a string:
/// it implements `Display`/`FromStr` and serializes as a JSON string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CheckpointToken(i64);

impl CheckpointToken {
    /// Token that precedes every commit.
    pub const START: CheckpointToken = CheckpointToken(0);

    /// Creates a token from a raw value.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> i64 {
        self.0
    }

    /// Returns the token immediately after this one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for CheckpointToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CheckpointToken {
    type Err = Error;

    /// Parses a token. An empty string is the start of the feed.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Self::START);
        }
        trimmed
            .parse::<i64>()
            .map(Self)
            .map_err(|e| Error::Storage(format!("invalid checkpoint token '{}': {}", s, e)))
    }
}

impl From<CheckpointToken> for String {
    fn from(token: CheckpointToken) -> Self {
        token.to_string()
    }
}

impl TryFrom<String> for CheckpointToken {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_hash_is_deterministic() {
        let a = StreamId::new("order-1");
        let b = StreamId::from("order-1".to_string());
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), StreamId::new("order-2").hash());
    }

    #[test]
    fn test_default_bucket() {
        assert_eq!(BucketId::default().as_str(), "default");
    }

    #[test]
    fn test_revision_arithmetic() {
        assert!(StreamRev::NONE.is_none());
        assert_eq!(StreamRev::NONE.next(), StreamRev::FIRST);
        assert_eq!(StreamRev::from_raw(4).add(3).as_raw(), 7);
        assert_eq!(StreamRev::MAX.next(), StreamRev::from_raw(i64::MAX as u64 + 1));
        assert_eq!(CommitSequence::NONE.next(), CommitSequence::FIRST);
    }

    #[test]
    fn test_revision_sql_value_is_clamped() {
        assert_eq!(StreamRev::from_raw(9).to_sql(), 9);
        assert_eq!(StreamRev::MAX.to_sql(), i64::MAX);
        assert_eq!(StreamRev::from_raw(u64::MAX).to_sql(), i64::MAX);
    }

    #[test]
    fn test_checkpoint_parses_from_string() {
        let token: CheckpointToken = "42".parse().unwrap();
        assert_eq!(token.as_raw(), 42);
        assert_eq!(token.to_string(), "42");
        assert_eq!("".parse::<CheckpointToken>().unwrap(), CheckpointToken::START);
        assert!("forty-two".parse::<CheckpointToken>().is_err());
    }

    #[test]
    fn test_checkpoint_serializes_as_string() {
        let token = CheckpointToken::from_raw(17);
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, "\"17\"");

        let back: CheckpointToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back, token);
    }

    #[test]
    fn test_checkpoint_ordering() {
        assert!(CheckpointToken::START < CheckpointToken::from_raw(1));
        assert_eq!(CheckpointToken::from_raw(1).next().as_raw(), 2);
    }

    #[test]
    fn test_commit_id_round_trip() {
        let id = CommitId::new();
        let parsed: CommitId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(!id.is_nil());
        assert!(CommitId::from_uuid(Uuid::nil()).is_nil());
    }
}
