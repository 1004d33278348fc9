//! # Dispatch Scheduling
//!
//! Publishes durable commits to a downstream bus and records that it did.
//!
//! ```text
//!   EventStore::commit ─► post_commit ─► DispatchSchedulerHook
//!                                               │
//!                                      ScheduleDispatches
//!                                  ┌────────────┴────────────┐
//!                                  ▼                         ▼
//!                      SyncDispatchScheduler      AsyncDispatchScheduler
//!                      dispatch + mark inline     mpsc queue ─► worker task
//!                                                  dispatch + mark
//! ```
//!
//! ## Recovery
//!
//! A commit is marked dispatched only after the [`Dispatcher`] succeeded. A
//! crash in between leaves it undispatched, and
//! [`PersistStreams::get_undispatched_commits`] is how it is found again:
//! [`ScheduleDispatches::start`] re-dispatches every undispatched commit. The
//! bus may therefore see a commit twice; marking is idempotent.
//!
//! ## Failure Handling
//!
//! - Sync: errors propagate to whoever called `schedule_dispatch`. Behind the
//!   pipeline that is `post_commit`, which logs them.
//! - Async: errors go to the error handler and a `warn!`. The write path
//!   never waits on the bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::commit::Commit;
use crate::error::{Error, Result};
use crate::persistence::PersistStreams;
use crate::pipeline::PipelineHook;

// =============================================================================
// Contracts
// =============================================================================

/// Publishes a commit to the outside world.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Publishes `commit`. Must tolerate seeing the same commit again.
    async fn dispatch(&self, commit: &Commit) -> Result<()>;
}

/// Decides when a commit is dispatched.
#[async_trait]
pub trait ScheduleDispatches: Send + Sync {
    /// Dispatches `commit` now or later.
    async fn schedule_dispatch(&self, commit: Commit) -> Result<()>;

    /// Begins dispatching and re-schedules every undispatched commit.
    async fn start(&self) -> Result<()>;

    /// Stops dispatching. Idempotent.
    async fn dispose(&self);
}

/// Called by the async scheduler when a dispatch fails.
pub type DispatchErrorHandler = Arc<dyn Fn(&Commit, &Error) + Send + Sync>;

async fn dispatch_and_mark(
    dispatcher: &dyn Dispatcher,
    persistence: &dyn PersistStreams,
    commit: &Commit,
) -> Result<()> {
    dispatcher.dispatch(commit).await?;
    persistence.mark_commit_as_dispatched(commit).await?;
    debug!(checkpoint = %commit.checkpoint, "commit dispatched");
    Ok(())
}

// =============================================================================
// Synchronous Scheduler
// =============================================================================

/// Dispatches inline on the caller's task.
pub struct SyncDispatchScheduler {
    dispatcher: Arc<dyn Dispatcher>,
    persistence: Arc<dyn PersistStreams>,
    disposed: AtomicBool,
}

impl SyncDispatchScheduler {
    /// Creates the scheduler. Call [`start`](ScheduleDispatches::start) to
    /// recover undispatched commits.
    pub fn new(dispatcher: Arc<dyn Dispatcher>, persistence: Arc<dyn PersistStreams>) -> Self {
        Self {
            dispatcher,
            persistence,
            disposed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ScheduleDispatches for SyncDispatchScheduler {
    async fn schedule_dispatch(&self, commit: Commit) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed("dispatch scheduler"));
        }
        dispatch_and_mark(self.dispatcher.as_ref(), self.persistence.as_ref(), &commit).await
    }

    async fn start(&self) -> Result<()> {
        let pending = self.persistence.get_undispatched_commits().await?;
        info!(count = pending.len(), "recovering undispatched commits");
        for commit in pending {
            self.schedule_dispatch(commit).await?;
        }
        Ok(())
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

// =============================================================================
// Asynchronous Scheduler
// =============================================================================

/// Queues commits for a single background worker.
///
/// Commits scheduled before [`start`](ScheduleDispatches::start) wait in the
/// queue. [`dispose`](ScheduleDispatches::dispose) closes the queue and waits
/// for the worker to drain it.
pub struct AsyncDispatchScheduler {
    dispatcher: Arc<dyn Dispatcher>,
    persistence: Arc<dyn PersistStreams>,
    on_error: Option<DispatchErrorHandler>,
    tx: Mutex<Option<mpsc::UnboundedSender<Commit>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Commit>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AsyncDispatchScheduler {
    /// Creates the scheduler with no error handler (failures are only logged).
    pub fn new(dispatcher: Arc<dyn Dispatcher>, persistence: Arc<dyn PersistStreams>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            dispatcher,
            persistence,
            on_error: None,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    /// Sets the handler called for each failed dispatch.
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Commit, &Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<Commit>> {
        self.tx
            .lock()
            .map_err(|_| Error::Storage("dispatch queue lock poisoned".to_string()))?
            .clone()
            .ok_or(Error::Disposed("dispatch scheduler"))
    }
}

#[async_trait]
impl ScheduleDispatches for AsyncDispatchScheduler {
    async fn schedule_dispatch(&self, commit: Commit) -> Result<()> {
        self.sender()?
            .send(commit)
            .map_err(|_| Error::Disposed("dispatch scheduler"))
    }

    async fn start(&self) -> Result<()> {
        let rx = self
            .rx
            .lock()
            .map_err(|_| Error::Storage("dispatch queue lock poisoned".to_string()))?
            .take();

        if let Some(mut rx) = rx {
            let dispatcher = Arc::clone(&self.dispatcher);
            let persistence = Arc::clone(&self.persistence);
            let on_error = self.on_error.clone();

            let worker = tokio::spawn(async move {
                while let Some(commit) = rx.recv().await {
                    let result =
                        dispatch_and_mark(dispatcher.as_ref(), persistence.as_ref(), &commit).await;
                    if let Err(e) = result {
                        warn!(checkpoint = %commit.checkpoint, error = %e, "dispatch failed");
                        if let Some(handler) = &on_error {
                            handler(&commit, &e);
                        }
                    }
                }
                debug!("dispatch worker stopped");
            });
            *self.worker.lock().await = Some(worker);
        }

        let pending = self.persistence.get_undispatched_commits().await?;
        info!(count = pending.len(), "recovering undispatched commits");
        for commit in pending {
            self.schedule_dispatch(commit).await?;
        }
        Ok(())
    }

    async fn dispose(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "dispatch worker panicked");
            }
        }
    }
}

// =============================================================================
// Pipeline Hook
// =============================================================================

/// Schedules a dispatch after every durable commit.
pub struct DispatchSchedulerHook {
    scheduler: Arc<dyn ScheduleDispatches>,
}

impl DispatchSchedulerHook {
    /// Creates the hook.
    pub fn new(scheduler: Arc<dyn ScheduleDispatches>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl PipelineHook for DispatchSchedulerHook {
    fn name(&self) -> &'static str {
        "dispatch-scheduler"
    }

    async fn post_commit(&self, commit: &Commit) -> Result<()> {
        self.scheduler.schedule_dispatch(commit.clone()).await
    }
}

// =============================================================================
// Tests
// =============================================================================
