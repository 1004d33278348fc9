//! # SpiteStore - Commit Log Storage Core
//!
//! SpiteStore is an append-only commit log for event sourcing. It provides:
//!
//! - **Streams of commits**: each commit is an atomic batch of events for one
//!   stream, identified by bucket and stream id
//! - **Optimistic concurrency**: writers claim a commit sequence and a stream
//!   revision; the storage engine is the only arbiter of who wins
//! - **Idempotent writes**: replaying a commit id is reported as a duplicate,
//!   never stored twice
//! - **A global feed**: every commit gets a checkpoint token that strictly
//!   increases across all buckets
//! - **Snapshots**: materialized state at a revision, so streams can be
//!   loaded without their whole history
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          EventStore                             │
//! │         EventStream (reconstruct, buffer, commit changes)       │
//! │   Pipeline: tracker ─ upconverter ─ dispatch ─ user hooks       │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ PersistStreams
//!               ┌───────────────┴────────────────┐
//!               ▼                                ▼
//! ┌───────────────────────────────┐  ┌─────────────────────────────┐
//! │       SqlitePersistence       │  │     InMemoryPersistence     │
//! │  writer thread (group commit) │  │   process-local, no I/O     │
//! │  reader pool (replicas)       │  │                             │
//! └───────────────┬───────────────┘  └─────────────────────────────┘
//!                 ▼
//!              SQLite
//!
//!  PollingClient ──► CommitSequencer ──► handler / CommitBroadcaster ──► subscribers
//! ```
//!
//! ## Core Invariants
//!
//! 1. **One winner per position**: at most one commit exists per
//!    `(bucket, stream, commit_sequence)` and per covered stream revision
//! 2. **Commit ids are unique per stream**: a replay is a duplicate, not a conflict
//! 3. **Checkpoints strictly increase** and are never reused
//! 4. **Buckets are isolated**: no read, purge or delete crosses a bucket
//! 5. **A commit is atomic**: all of its events are visible, or none are
//!
//! ## Module Organization
//!
//! - [`error`]: Error enum and error kinds
//! - [`types`], [`commit`]: Identifiers and the commit data model
//! - [`persistence`]: The storage engine contract
//! - [`sqlite`], [`memory`]: The two engines
//! - [`pipeline`], [`tracker`], [`upconvert`], [`dispatch`]: Commit hooks
//! - [`stream`], [`store`]: Application-facing API
//! - [`polling`], [`sequencer`], [`observe`]: Tailing the global feed

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for storage operations.
///
/// A single error enum, plus [`ErrorKind`](error::ErrorKind) for callers that
/// only care about the category (conflict, duplicate, transient, ...).
pub mod error;

/// Identifier newtypes: buckets, streams, revisions, sequences, checkpoints.
pub mod types;

/// Events, commit attempts, commits, snapshots and stream heads.
pub mod commit;

/// The serializer contract and its JSON implementation.
pub mod serialization;

/// Row encoding with integrity checksums.
pub mod codec;

/// SQLite DDL and database initialization.
pub mod schema;

/// Master and replica connection factories.
pub mod connection;

/// Configuration for the SQLite engine and the polling client.
pub mod config;

/// The storage engine contract every backend implements.
pub mod persistence;

/// Batch writer with group commit.
///
/// Attempts are collected over a short window (default 10ms) and executed
/// inside one transaction, each in its own SAVEPOINT, so a conflict in one
/// attempt does not affect the others in the batch.
pub mod writer;

/// Read queries and the per-shard reader loop.
pub mod reader;

/// The SQLite storage engine.
pub mod sqlite;

/// The in-memory storage engine.
pub mod memory;

/// Commit pipeline hooks and the runner that applies them.
pub mod pipeline;

/// Optimistic concurrency tracking of recent stream heads.
pub mod tracker;

/// Read-time event upconversion.
pub mod upconvert;

/// Event stream reconstruction and change buffering.
pub mod stream;

/// The store: an engine wrapped in its pipeline.
pub mod store;

/// Time source abstraction.
pub mod clock;

/// Checkpoint polling client.
pub mod polling;

/// Gap-tolerant ordering for polled commits.
pub mod sequencer;

/// Broadcast subscriptions on top of polling.
pub mod observe;

/// Dispatch of durable commits to a downstream bus.
pub mod dispatch;

// =============================================================================
// Re-exports
// =============================================================================
// Users can write `use spitestore::Error` instead of `use spitestore::error::Error`.

pub use error::{Error, ErrorKind, Result};
pub use types::{
    BucketId, CheckpointToken, CommitId, CommitSequence, Headers, StreamHash, StreamId, StreamRev,
};
pub use commit::{Commit, CommitAttempt, EventMessage, Payload, Snapshot, StreamHead};
pub use serialization::{JsonSerializer, Serializer};
pub use schema::Database;
pub use connection::{ConnectionFactory, ShardId, SqliteConnectionFactory};
pub use config::{PollingConfig, SqliteConfig};
pub use persistence::PersistStreams;
pub use writer::{spawn_batch_writer, BatchWriterHandle, WriterConfig};
pub use sqlite::SqlitePersistence;
pub use memory::InMemoryPersistence;
pub use pipeline::{Pipeline, PipelineHook};
pub use tracker::OptimisticPipelineHook;
pub use upconvert::{ConverterMap, EventUpconverterHook};
pub use stream::EventStream;
pub use store::EventStore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use polling::{CommitHandler, HandlingResult, PollingClient, PollingStatus};
pub use sequencer::CommitSequencer;
pub use observe::{CommitBroadcaster, ObservableClient, Observer, ObserverHandle, Subscription};
pub use dispatch::{
    AsyncDispatchScheduler, DispatchSchedulerHook, Dispatcher, ScheduleDispatches,
    SyncDispatchScheduler,
};
