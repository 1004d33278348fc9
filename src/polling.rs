//! # Checkpoint Polling Client
//!
//! [`PollingClient`] tails the global commit feed. One background task per
//! client reads the feed after its cursor, one bounded page at a time
//! ([`PollingConfig::max_batch`]), and hands each commit, in checkpoint
//! order, to a [`CommitHandler`]. A full page is followed by the next one
//! without waiting for the interval.
//!
//! ## Verdicts
//!
//! ```text
//!   feed after cursor:   c7  c8  c9
//!                        │
//!   handler(c7) ─► MoveToNext  cursor = 7, continue with c8
//!   handler(c8) ─► Retry       end of tick, c8 is delivered again next tick
//!   handler(c8) ─► Stop        loop ends, c9 is never delivered
//! ```
//!
//! ## Failure Model
//!
//! - The feed read fails with an unavailable-kind error: logged, retried on
//!   the next tick
//! - Anything else (including handler errors): the loop stops and the error
//!   is returned from [`PollingClient::wait`] / [`PollingClient::stop`].
//!   Status becomes [`PollingStatus::Faulted`]. Skipping the commit would
//!   lose it, so the loop does not continue.
//!
//! ## Concurrency
//!
//! The handler sits behind a `tokio::sync::Mutex`. The background loop and
//! manual [`poll_once`](PollingClient::poll_once) calls take turns, so a
//! handler never runs concurrently with itself.
//!
//! Stopping is cooperative: the stop flag is checked between commits and at
//! every tick boundary. A storage call already in flight runs to completion.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::commit::Commit;
use crate::config::PollingConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::persistence::PersistStreams;
use crate::types::{BucketId, CheckpointToken};

// =============================================================================
// Handler Contract
// =============================================================================

/// What the polling loop should do after a commit was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlingResult {
    /// Advance the cursor past this commit and continue.
    MoveToNext,
    /// Deliver the same commit again on the next tick.
    Retry,
    /// End the polling loop.
    Stop,
}

/// Receives commits from a polling loop, one at a time.
///
/// # Rust Pattern: blanket impl for closures
///
/// Any `FnMut(&Commit) -> Result<HandlingResult> + Send` is a handler, so
/// simple consumers don't need a struct.
#[async_trait]
pub trait CommitHandler: Send {
    /// Handles one commit.
    async fn handle(&mut self, commit: &Commit) -> Result<HandlingResult>;
}

#[async_trait]
impl<F> CommitHandler for F
where
    F: FnMut(&Commit) -> Result<HandlingResult> + Send,
{
    async fn handle(&mut self, commit: &Commit) -> Result<HandlingResult> {
        self(commit)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Lifecycle of a polling client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollingStatus {
    /// Never started.
    Idle,
    /// The background loop is running.
    Running,
    /// Stopped by the caller or by a `Stop` verdict.
    Stopped,
    /// The loop ended with an error.
    Faulted(String),
}

enum Tick {
    Continue,
    /// The page was full and fully handled; more may follow.
    More,
    Stop,
}

// =============================================================================
// Shared State
// =============================================================================

struct Shared<H> {
    persistence: Arc<dyn PersistStreams>,
    handler: tokio::sync::Mutex<H>,
    interval: std::time::Duration,
    max_batch: usize,
    cursor: AtomicI64,
    bucket: Mutex<Option<BucketId>>,
    wake: Notify,
    stop: AtomicBool,
    status: Mutex<PollingStatus>,
}

impl<H: CommitHandler> Shared<H> {
    fn set_status(&self, status: PollingStatus) {
        if let Ok(mut current) = self.status.lock() {
            *current = status;
        }
    }

    fn cursor(&self) -> CheckpointToken {
        CheckpointToken::from_raw(self.cursor.load(Ordering::Acquire))
    }

    fn bucket(&self) -> Option<BucketId> {
        self.bucket.lock().ok().and_then(|bucket| bucket.clone())
    }

    /// Reads one page after the cursor and delivers it.
    async fn tick(&self) -> Result<Tick> {
        let mut handler = self.handler.lock().await;
        let from = self.cursor();
        let bucket = self.bucket();

        let read = self
            .persistence
            .get_page_from_checkpoint(bucket.as_ref(), from, self.max_batch)
            .await;

        let commits = match read {
            Ok(commits) => commits,
            Err(e) if e.kind() == ErrorKind::Unavailable => {
                warn!(from = %from, error = %e, "feed unavailable, retrying next tick");
                return Ok(Tick::Continue);
            }
            Err(e) => return Err(e),
        };

        if !commits.is_empty() {
            debug!(from = %from, count = commits.len(), "polled commits");
        }

        for commit in &commits {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            match handler.handle(commit).await? {
                HandlingResult::MoveToNext => {
                    self.cursor
                        .store(commit.checkpoint.as_raw(), Ordering::Release);
                }
                HandlingResult::Retry => {
                    debug!(checkpoint = %commit.checkpoint, "handler asked for retry");
                    return Ok(Tick::Continue);
                }
                HandlingResult::Stop => {
                    self.stop.store(true, Ordering::Release);
                    return Ok(Tick::Stop);
                }
            }
        }

        if commits.len() >= self.max_batch && !self.stop.load(Ordering::Acquire) {
            return Ok(Tick::More);
        }
        Ok(Tick::Continue)
    }

    async fn run(self: Arc<Self>) -> Result<()> {
        loop {
            if self.stop.load(Ordering::Acquire) {
                self.set_status(PollingStatus::Stopped);
                return Ok(());
            }

            match self.tick().await {
                Ok(Tick::More) => continue,
                Ok(Tick::Continue) => {}
                Ok(Tick::Stop) => {
                    info!(checkpoint = %self.cursor(), "polling stopped by handler");
                    self.set_status(PollingStatus::Stopped);
                    return Ok(());
                }
                Err(e) => {
                    error!(checkpoint = %self.cursor(), error = %e, "polling loop faulted");
                    self.set_status(PollingStatus::Faulted(e.to_string()));
                    return Err(e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.wake.notified() => {}
            }
        }
    }
}

// =============================================================================
// Polling Client
// =============================================================================

/// Tails the commit feed on a background task.
///
/// # Example
///
/// ```rust,ignore
/// let client = PollingClient::new(store, |commit: &Commit| {
///     println!("{}", commit.checkpoint);
///     Ok(HandlingResult::MoveToNext)
/// }, PollingConfig::default());
///
/// client.start_from(CheckpointToken::START)?;
/// // ...
/// client.stop().await?;
/// ```
pub struct PollingClient<H: CommitHandler + 'static> {
    shared: Arc<Shared<H>>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
    disposed: AtomicBool,
}

impl<H: CommitHandler + 'static> PollingClient<H> {
    /// Creates an idle client. Nothing is read until started or polled.
    pub fn new(persistence: Arc<dyn PersistStreams>, handler: H, config: PollingConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                persistence,
                handler: tokio::sync::Mutex::new(handler),
                interval: config.interval,
                max_batch: config.max_batch.max(1),
                cursor: AtomicI64::new(CheckpointToken::START.as_raw()),
                bucket: Mutex::new(config.bucket),
                wake: Notify::new(),
                stop: AtomicBool::new(false),
                status: Mutex::new(PollingStatus::Idle),
            }),
            task: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed("polling client"));
        }
        Ok(())
    }

    fn task_slot(&self) -> Result<std::sync::MutexGuard<'_, Option<JoinHandle<Result<()>>>>> {
        self.task
            .lock()
            .map_err(|_| Error::Storage("polling task lock poisoned".to_string()))
    }

    /// Starts the background loop after `checkpoint` (exclusive).
    ///
    /// # Errors
    ///
    /// `Error::Storage` if the loop is already running.
    pub fn start_from(&self, checkpoint: CheckpointToken) -> Result<()> {
        self.ensure_open()?;
        let mut slot = self.task_slot()?;
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(Error::Storage("polling client already started".to_string()));
        }

        self.shared
            .cursor
            .store(checkpoint.as_raw(), Ordering::Release);
        self.shared.stop.store(false, Ordering::Release);
        self.shared.set_status(PollingStatus::Running);

        info!(from = %checkpoint, bucket = ?self.shared.bucket(), "polling started");
        *slot = Some(tokio::spawn(Arc::clone(&self.shared).run()));
        Ok(())
    }

    /// Starts the loop restricted to one bucket.
    pub fn start_from_bucket(&self, bucket_id: BucketId, checkpoint: CheckpointToken) -> Result<()> {
        self.ensure_open()?;
        if let Ok(mut bucket) = self.shared.bucket.lock() {
            *bucket = Some(bucket_id);
        }
        self.start_from(checkpoint)
    }

    /// Runs one tick on the caller's task, reading pages until the feed is
    /// drained or the handler holds the cursor.
    ///
    /// Waits for the background loop if it is mid-tick. A `Stop` verdict
    /// stops the client.
    pub async fn poll_once(&self) -> Result<()> {
        self.ensure_open()?;
        loop {
            match self.shared.tick().await? {
                Tick::More => {}
                Tick::Continue => return Ok(()),
                Tick::Stop => {
                    self.shared.set_status(PollingStatus::Stopped);
                    return Ok(());
                }
            }
        }
    }

    /// Wakes the background loop without waiting for the interval.
    pub fn poll_now(&self) {
        self.shared.wake.notify_one();
    }

    /// Sets the cursor. Takes effect on the next tick.
    pub fn set_checkpoint(&self, checkpoint: CheckpointToken) {
        self.shared
            .cursor
            .store(checkpoint.as_raw(), Ordering::Release);
    }

    /// Checkpoint of the last commit the handler moved past.
    pub fn last_checkpoint(&self) -> CheckpointToken {
        self.shared.cursor()
    }

    /// Current lifecycle state.
    pub fn status(&self) -> PollingStatus {
        self.shared
            .status
            .lock()
            .map(|status| status.clone())
            .unwrap_or_else(|_| PollingStatus::Faulted("status lock poisoned".to_string()))
    }

    /// Waits for the background loop to end on its own.
    ///
    /// Returns the loop's error if it faulted; `Ok` if it was never started.
    pub async fn wait(&self) -> Result<()> {
        let task = self.task_slot()?.take();
        match task {
            Some(task) => task
                .await
                .map_err(|e| Error::Storage(format!("polling task failed: {}", e)))?,
            None => Ok(()),
        }
    }

    /// Signals the loop to stop and waits for it.
    pub async fn stop(&self) -> Result<()> {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake.notify_one();
        let result = self.wait().await;

        if matches!(self.status(), PollingStatus::Running | PollingStatus::Idle) {
            self.shared.set_status(PollingStatus::Stopped);
        }
        result
    }

    /// Stops the loop. Safe to call more than once; never fails.
    ///
    /// The storage engine is not disposed; the client does not own it.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.stop().await {
            debug!(error = %e, "polling loop had faulted before dispose");
        }
    }

    /// True once disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl<H: CommitHandler + 'static> Drop for PollingClient<H> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }
}

// =============================================================================
// Tests
// =============================================================================
