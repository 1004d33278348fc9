//! # Error Handling for SpiteStore
//!
//! This module defines the error types used throughout SpiteStore. A single
//! error enum ([`Error`]) represents every failure mode, and [`ErrorKind`]
//! collapses those variants onto the small set of categories callers actually
//! branch on.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations.
//! This provides:
//! - Automatic `Display` implementation from the `#[error(...)]` attributes
//! - Automatic `From` implementations from the `#[from]` attributes
//! - Proper error source chaining via `#[source]`
//!
//! ## Error Categories
//!
//! | Kind | Examples | Typical Response |
//! |------|----------|------------------|
//! | Concurrency | Another writer took the sequence | Reload stream, reapply, retry |
//! | Duplicate | Same commit id replayed | Treat as already applied |
//! | Unavailable | Database busy, cannot open file | Retry with backoff |
//! | Generic | Corrupt row, SQL error, gap in attempt | Log and investigate |
//! | NotFound | Explicit range on an empty stream | Surface to caller |
//! | Disposed | Call after `dispose()` | Programming error |
//!
//! Backend adapters translate their native failures into these kinds at their
//! boundary; nothing above the storage layer inspects SQLite error codes.

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::types::{BucketId, CommitId, CommitSequence, StreamId, StreamRev};

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in SpiteStore operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Conflict Errors (Client can retry with updated data)
    // =========================================================================

    /// Optimistic concurrency conflict: a competing writer already claimed
    /// this commit sequence or stream revision.
    ///
    /// # Recovery
    ///
    /// 1. Re-read the stream (an [`EventStream`](crate::stream::EventStream)
    ///    refreshes itself automatically when this is raised by
    ///    `commit_changes`)
    /// 2. Re-apply business logic with new data
    /// 3. Retry with the next commit sequence
    #[error(
        "concurrency conflict on stream '{bucket_id}/{stream_id}': \
         commit sequence {commit_sequence} / revision {stream_revision} already taken"
    )]
    Concurrency {
        /// Bucket of the contested stream
        bucket_id: BucketId,
        /// The contested stream
        stream_id: StreamId,
        /// Commit sequence the losing attempt tried to claim
        commit_sequence: CommitSequence,
        /// Stream revision the losing attempt tried to claim
        stream_revision: StreamRev,
    },

    // =========================================================================
    // Idempotency (Not an error, but a signal the work is already done)
    // =========================================================================

    /// The exact same commit was already persisted for this stream.
    ///
    /// This happens when a client retries after a timeout although the
    /// original attempt succeeded. Callers should treat the attempt as applied.
    #[error("duplicate commit '{commit_id}' on stream '{bucket_id}/{stream_id}'")]
    DuplicateCommit {
        /// Bucket of the stream
        bucket_id: BucketId,
        /// The stream the commit belongs to
        stream_id: StreamId,
        /// The replayed commit id
        commit_id: CommitId,
    },

    // =========================================================================
    // Storage Errors
    // =========================================================================

    /// General engine fault. Not assumed recoverable without intervention.
    ///
    /// Also raised for malformed attempts that reference revisions beyond any
    /// observed stream head.
    #[error("storage error: {0}")]
    Storage(String),

    /// Transient connectivity fault; safe to retry with backoff.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// SQLite operation failed.
    ///
    /// # Rust Pattern: #[from]
    ///
    /// The `#[from]` attribute generates `impl From<rusqlite::Error> for Error`,
    /// which lets `?` convert rusqlite errors automatically. [`Error::kind`]
    /// classifies the wrapped error code as unavailable or generic.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Headers, bodies or snapshot payloads failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Schema version mismatch, bad configuration, or an internal channel
    /// that has gone away.
    #[error("schema error: {0}")]
    Schema(String),

    // =========================================================================
    // Caller Errors
    // =========================================================================

    /// An explicit revision range was requested on a stream with no commits.
    #[error("stream '{bucket_id}/{stream_id}' not found")]
    StreamNotFound {
        /// Bucket of the stream
        bucket_id: BucketId,
        /// The missing stream
        stream_id: StreamId,
    },

    /// The attempt violates the commit model (empty, blank ids, zero sequence).
    #[error("invalid commit attempt: {0}")]
    InvalidAttempt(String),

    /// The component was disposed before this call.
    #[error("{0} has been disposed")]
    Disposed(&'static str),

    /// A broadcast subscriber fell behind and missed commits.
    #[error("subscription lagged: {0} commits skipped")]
    SubscriptionLagged(u64),
}

// =============================================================================
// Error Kinds
// =============================================================================

/// Coarse classification of an [`Error`].
///
/// Callers that only care about "retry or not" should match on this instead of
/// the full enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A competing writer won.
    Concurrency,
    /// The same commit was replayed.
    Duplicate,
    /// Transient storage fault.
    Unavailable,
    /// Any other fault.
    Generic,
    /// Stream has no commits in the requested range.
    NotFound,
    /// Used after dispose.
    Disposed,
}

impl Error {
    /// Returns the coarse kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Concurrency { .. } => ErrorKind::Concurrency,
            Error::DuplicateCommit { .. } => ErrorKind::Duplicate,
            Error::StorageUnavailable(_) => ErrorKind::Unavailable,
            Error::Sqlite(err) if is_unavailable_code(err) => ErrorKind::Unavailable,
            Error::StreamNotFound { .. } => ErrorKind::NotFound,
            Error::Disposed(_) => ErrorKind::Disposed,
            _ => ErrorKind::Generic,
        }
    }

    /// True when retrying (possibly after reloading state) can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Concurrency | ErrorKind::Unavailable)
    }

    /// True for every engine-level fault, including transient ones.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::StorageUnavailable(_) | Error::Sqlite(_)
        )
    }
}

/// SQLite codes that mean "try again later" rather than "something is wrong".
fn is_unavailable_code(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
        ),
        _ => false,
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
