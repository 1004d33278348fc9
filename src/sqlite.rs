//! # SQLite Storage Engine
//!
//! [`SqlitePersistence`] assembles the SQLite engine from its parts: one
//! writer thread doing group commit, a pool of read-only reader threads, and
//! a [`ConnectionFactory`] that opens every connection.
//!
//! ## The SQLite Challenge
//!
//! SQLite's `Connection` type uses `RefCell` internally, making it `!Sync`.
//! We can't share a connection across threads, even with `Arc`.
//!
//! Our solution: **Dedicated threads with async channels**
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Async Tasks                                  │
//! └────────────────────────────────┬────────────────────────────────────────┘
//!                    ┌─────────────┴─────────────┐
//!                    │                           │
//!                    ▼                           ▼
//!            ┌───────────────┐         ┌─────────────────────┐
//!            │ BatchWriter   │         │     Reader Pool     │
//!            │  (1 thread)   │         │ (N threads, 1 shard │
//!            │   master      │         │  and replica each)  │
//!            └───────┬───────┘         └──────────┬──────────┘
//!                    └─────────────┬──────────────┘
//!                                  ▼
//!                          ┌─────────────┐
//!                          │   SQLite    │
//!                          │   (WAL)     │
//!                          └─────────────┘
//! ```
//!
//! ## Read Routing
//!
//! Reads of one stream (`get_from`, `get_snapshot`) go to the shard its
//! [`StreamHash`](crate::types::StreamHash) maps to. Feed and maintenance
//! reads rotate across the shards.
//!
//! ## Lifecycle
//!
//! - `open` spawns the threads but does not touch the schema
//! - `initialize` creates the schema once; every other operation initializes
//!   lazily if the caller skipped it
//! - `drop_all` removes the schema and clears the initialized flag
//! - `dispose` stops every thread; later calls fail with `Error::Disposed`

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};

use crate::commit::{Commit, CommitAttempt, Snapshot, StreamHead};
use crate::config::SqliteConfig;
use crate::connection::{ConnectionFactory, ShardId, SqliteConnectionFactory};
use crate::error::{Error, Result};
use crate::persistence::PersistStreams;
use crate::reader::{self, ReadRequest};
use crate::serialization::{JsonSerializer, Serializer};
use crate::types::{BucketId, CheckpointToken, StreamId, StreamRev};
use crate::writer::{spawn_batch_writer, BatchWriterHandle};

/// Size of each reader's request channel.
const READ_CHANNEL_SIZE: usize = 1024;

/// The SQLite-backed storage engine.
///
/// # Thread Safety
///
/// `SqlitePersistence` is `Send + Sync`; share it behind an `Arc`. All
/// callers feed the same writer thread and reader pool.
pub struct SqlitePersistence {
    /// Batch writer handle for write operations with group commit.
    writer: BatchWriterHandle,

    /// One request channel per reader shard, indexed by [`ShardId`].
    readers: Vec<mpsc::Sender<ReadRequest>>,

    /// Rotation counter for reads that are not tied to a stream.
    next_reader: AtomicUsize,

    /// Handles to the reader threads (for shutdown).
    reader_handles: Mutex<Vec<JoinHandle<()>>>,

    initialized: AtomicBool,
    /// Serializes schema creation and teardown.
    init_lock: Mutex<()>,
    /// Times the schema has been created by this engine.
    schema_runs: AtomicUsize,
    disposed: AtomicBool,
}

impl SqlitePersistence {
    /// Opens the database described by `config` with JSON serialization.
    pub async fn open(config: SqliteConfig) -> Result<Self> {
        let factory = Arc::new(SqliteConnectionFactory::new(&config.path, config.busy_timeout));
        Self::open_with(config, factory, Arc::new(JsonSerializer)).await
    }

    /// Opens the engine with an explicit connection factory and serializer.
    pub async fn open_with(
        config: SqliteConfig,
        factory: Arc<dyn ConnectionFactory>,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Self> {
        config.validate()?;

        // The master connection creates the file; replicas need it to exist.
        let master = factory.open_master(None)?;
        let writer = spawn_batch_writer(master, Arc::clone(&serializer), config.writer.clone())?;

        let reader_count = config.reader_threads;
        let mut readers = Vec::with_capacity(reader_count);
        let mut reader_handles = Vec::with_capacity(reader_count);

        for i in 0..reader_count {
            let conn = factory.open_replica(Some(ShardId::new(i)))?;
            let (tx, rx) = mpsc::channel(READ_CHANNEL_SIZE);
            let serializer = Arc::clone(&serializer);
            let page_size = config.page_size;

            let handle = thread::Builder::new()
                .name(format!("spitestore-reader-{}", i))
                .spawn(move || reader::run_reader(conn, serializer, page_size, rx))
                .map_err(|e| Error::Schema(format!("failed to spawn reader thread: {}", e)))?;

            readers.push(tx);
            reader_handles.push(handle);
        }

        info!(
            path = %config.path.display(),
            readers = reader_count,
            page_size = config.page_size,
            "sqlite persistence opened"
        );

        Ok(Self {
            writer,
            readers,
            next_reader: AtomicUsize::new(0),
            reader_handles: Mutex::new(reader_handles),
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            schema_runs: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    /// Returns the number of reader threads in the pool.
    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// The reader shard that serves reads of `stream_id`.
    pub fn shard_for(&self, stream_id: &StreamId) -> ShardId {
        ShardId::for_stream(stream_id.hash(), self.readers.len())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed("sqlite persistence"));
        }
        Ok(())
    }

    /// Fails when disposed, initializes the schema on first use.
    async fn ready(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.initialized.load(Ordering::Acquire) {
            self.initialize().await?;
        }
        Ok(())
    }

    /// Sends a read request to a shard and awaits its response.
    ///
    /// Stream-scoped reads pass the stream and stick to its shard; the rest
    /// rotate.
    async fn read<T>(
        &self,
        stream_id: Option<&StreamId>,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> ReadRequest,
    ) -> Result<T> {
        self.ready().await?;
        let shard = match stream_id {
            Some(stream_id) => self.shard_for(stream_id),
            None => {
                let next = self.next_reader.fetch_add(1, Ordering::Relaxed);
                ShardId::new(next % self.readers.len().max(1))
            }
        };
        let reader = self
            .readers
            .get(shard.index())
            .ok_or_else(|| Error::Storage("reader pool is empty".to_string()))?;
        let (response_tx, response_rx) = oneshot::channel();

        reader
            .send(make(response_tx))
            .await
            .map_err(|_| Error::Storage("reader pool has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Storage("reader dropped response".to_string()))?
    }
}

#[async_trait]
impl PersistStreams for SqlitePersistence {
    async fn initialize(&self) -> Result<()> {
        self.ensure_open()?;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        self.writer.initialize().await?;
        let runs = self.schema_runs.fetch_add(1, Ordering::AcqRel) + 1;
        self.initialized.store(true, Ordering::Release);
        debug!(runs, "schema initialized");
        Ok(())
    }

    async fn commit(&self, attempt: CommitAttempt) -> Result<Option<Commit>> {
        attempt.validate()?;
        self.ready().await?;

        let commit = self.writer.commit(attempt).await?;
        debug!(
            bucket = %commit.bucket_id,
            stream = %commit.stream_id,
            sequence = %commit.commit_sequence,
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
        self.read(Some(stream_id), |response| ReadRequest::StreamCommits {
            bucket_id: bucket_id.clone(),
            stream_id: stream_id.clone(),
            min_revision,
            max_revision,
            response,
        })
        .await
    }

    async fn get_from_checkpoint(&self, checkpoint: CheckpointToken) -> Result<Vec<Commit>> {
        self.read(None, |response| ReadRequest::CheckpointCommits {
            bucket_id: None,
            from: checkpoint,
            to: None,
            response,
        })
        .await
    }

    async fn get_from_bucket_checkpoint(
        &self,
        bucket_id: &BucketId,
        checkpoint: CheckpointToken,
    ) -> Result<Vec<Commit>> {
        self.read(None, |response| ReadRequest::CheckpointCommits {
            bucket_id: Some(bucket_id.clone()),
            from: checkpoint,
            to: None,
            response,
        })
        .await
    }

    async fn get_from_to(&self, from: CheckpointToken, to: CheckpointToken) -> Result<Vec<Commit>> {
        self.read(None, |response| ReadRequest::CheckpointCommits {
            bucket_id: None,
            from,
            to: Some(to),
            response,
        })
        .await
    }

    async fn get_page_from_checkpoint(
        &self,
        bucket_id: Option<&BucketId>,
        checkpoint: CheckpointToken,
        limit: usize,
    ) -> Result<Vec<Commit>> {
        self.read(None, |response| ReadRequest::CheckpointPage {
            bucket_id: bucket_id.cloned(),
            from: checkpoint,
            limit,
            response,
        })
        .await
    }

    async fn get_streams_to_snapshot(
        &self,
        bucket_id: &BucketId,
        max_threshold: u64,
    ) -> Result<Vec<StreamHead>> {
        self.read(None, |response| ReadRequest::StreamsToSnapshot {
            bucket_id: bucket_id.clone(),
            max_threshold,
            response,
        })
        .await
    }

    async fn get_snapshot(
        &self,
        bucket_id: &BucketId,
        stream_id: &StreamId,
        max_revision: StreamRev,
    ) -> Result<Option<Snapshot>> {
        self.read(Some(stream_id), |response| ReadRequest::Snapshot {
            bucket_id: bucket_id.clone(),
            stream_id: stream_id.clone(),
            max_revision,
            response,
        })
        .await
    }

    async fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool> {
        self.ready().await?;
        if snapshot.stream_revision > StreamRev::MAX {
            return Ok(false);
        }
        self.writer.add_snapshot(snapshot).await
    }

    async fn get_undispatched_commits(&self) -> Result<Vec<Commit>> {
        self.read(None, |response| ReadRequest::Undispatched { response })
            .await
    }

    async fn mark_commit_as_dispatched(&self, commit: &Commit) -> Result<()> {
        self.ready().await?;
        self.writer.mark_dispatched(commit.checkpoint).await
    }

    async fn purge(&self) -> Result<()> {
        self.ready().await?;
        self.writer.purge(None).await
    }

    async fn purge_bucket(&self, bucket_id: &BucketId) -> Result<()> {
        self.ready().await?;
        self.writer.purge(Some(bucket_id.clone())).await
    }

    async fn drop_all(&self) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.init_lock.lock().await;
        self.writer.drop_all().await?;
        self.initialized.store(false, Ordering::Release);
        Ok(())
    }

    async fn delete_stream(&self, bucket_id: &BucketId, stream_id: &StreamId) -> Result<()> {
        self.ready().await?;
        self.writer
            .delete_stream(bucket_id.clone(), stream_id.clone())
            .await
    }

    /// Stops the reader pool, then flushes and stops the writer.
    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        for reader in &self.readers {
            let _ = reader.send(ReadRequest::Shutdown).await;
        }

        let handles = std::mem::take(&mut *self.reader_handles.lock().await);
        let _ = tokio::task::spawn_blocking(move || {
            for handle in handles {
                let _ = handle.join();
            }
        })
        .await;

        self.writer.shutdown().await;
        info!("sqlite persistence disposed");
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

// =============================================================================
// Tests
// =============================================================================
