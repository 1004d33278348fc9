//! # Commit Row Encoding and Decoding
//!
//! Converts commits and snapshots to the column values stored by the SQLite
//! engine and back. Headers and event lists go through the configured
//! [`Serializer`]; identifiers, revisions and checkpoints live in their own
//! columns so they can be indexed.
//!
//! ## Row Format
//!
//! ```text
//! commits row:  ... | headers BLOB | payload BLOB | checksum BLOB
//!                     ser(headers)   ser(events)    xxh3(headers ‖ payload)
//!
//! snapshots row: ... | payload BLOB | checksum BLOB
//!                      ser(payload)   xxh3(payload)
//! ```
//!
//! The checksum is verified on every read; a mismatch means the row was
//! modified outside SpiteStore or the file is damaged.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::commit::{Commit, CommitAttempt, EventMessage, Snapshot};
use crate::error::{Error, Result};
use crate::serialization::{deserialize_value, serialize_value, Serializer};
use crate::types::{
    BucketId, CheckpointToken, CommitId, CommitSequence, Headers, StreamId, StreamRev,
};

// =============================================================================
// Encoded Forms
// =============================================================================

/// Serialized blobs of one commit.
#[derive(Debug, Clone)]
pub struct EncodedCommit {
    /// Serialized commit headers.
    pub headers: Vec<u8>,
    /// Serialized event list.
    pub payload: Vec<u8>,
    /// XXH3 over `headers ‖ payload`.
    pub checksum: Vec<u8>,
}

/// Raw column values of one `commits` row.
#[derive(Debug, Clone)]
pub struct CommitRow {
    pub bucket_id: String,
    pub stream_id: String,
    pub stream_revision: i64,
    pub commit_id: String,
    pub commit_sequence: i64,
    pub commit_stamp_ms: i64,
    pub checkpoint: i64,
    pub headers: Vec<u8>,
    pub payload: Vec<u8>,
    pub checksum: Vec<u8>,
}

// =============================================================================
// Encoding
// =============================================================================

/// Encodes the blob columns of an attempt.
pub fn encode_commit(attempt: &CommitAttempt, serializer: &dyn Serializer) -> Result<EncodedCommit> {
    let headers = serialize_value(serializer, &attempt.headers)?;
    let payload = serialize_value(serializer, &attempt.events)?;
    let checksum = commit_checksum(&headers, &payload);

    Ok(EncodedCommit {
        headers,
        payload,
        checksum,
    })
}

/// Encodes a snapshot payload, returning `(blob, checksum)`.
pub fn encode_snapshot(snapshot: &Snapshot, serializer: &dyn Serializer) -> Result<(Vec<u8>, Vec<u8>)> {
    let blob = serializer.serialize(&snapshot.payload)?;
    let checksum = compute_checksum(&blob);
    Ok((blob, checksum))
}

// =============================================================================
// Decoding
// =============================================================================

/// Decodes a `commits` row, verifying its checksum.
pub fn decode_commit(row: CommitRow, serializer: &dyn Serializer) -> Result<Commit> {
    let expected = commit_checksum(&row.headers, &row.payload);
    if expected != row.checksum {
        return Err(Error::Storage(format!(
            "checksum mismatch for commit at checkpoint {}",
            row.checkpoint
        )));
    }

    let headers: Headers = deserialize_value(serializer, &row.headers)?;
    let events: Vec<EventMessage> = deserialize_value(serializer, &row.payload)?;

    Ok(Commit {
        bucket_id: BucketId::new(row.bucket_id),
        stream_id: StreamId::new(row.stream_id),
        stream_revision: StreamRev::from_raw(row.stream_revision as u64),
        commit_id: row.commit_id.parse::<CommitId>()?,
        commit_sequence: CommitSequence::from_raw(row.commit_sequence as u64),
        commit_stamp_ms: row.commit_stamp_ms as u64,
        headers,
        events,
        checkpoint: CheckpointToken::from_raw(row.checkpoint),
    })
}

/// Decodes a snapshot payload blob, verifying its checksum.
pub fn decode_snapshot_payload(
    blob: &[u8],
    checksum: &[u8],
    serializer: &dyn Serializer,
) -> Result<serde_json::Value> {
    if compute_checksum(blob) != checksum {
        return Err(Error::Storage("checksum mismatch for snapshot".to_string()));
    }
    serializer.deserialize(blob)
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Computes a checksum for a blob.
///
/// Uses XXH3-64 for consistency with stream hashing.
pub fn compute_checksum(data: &[u8]) -> Vec<u8> {
    let hash = xxhash_rust::xxh3::xxh3_64(data);
    hash.to_le_bytes().to_vec()
}

fn commit_checksum(headers: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut hasher = xxhash_rust::xxh3::Xxh3::new();
    hasher.update(headers);
    hasher.update(payload);
    hasher.digest().to_le_bytes().to_vec()
}

/// Returns the current time in milliseconds since Unix epoch.
///
/// A clock set before 1970 reads as 0.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
