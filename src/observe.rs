//! # Push-Based Observation
//!
//! Layers publish/subscribe on top of the polling loop. The loop hands each
//! commit to a [`CommitBroadcaster`], which fans it out to every subscriber
//! through a `tokio::sync::broadcast` channel:
//!
//! ```text
//!   PollingClient ──► CommitBroadcaster ──► broadcast::Sender<Arc<Commit>>
//!                                               │
//!                       ┌───────────────────────┼────────────────────┐
//!                       ▼                       ▼                    ▼
//!                 Subscription            Subscription         observer task
//!                 (next().await)          (futures::Stream)    (Observer callbacks)
//! ```
//!
//! ## Backpressure
//!
//! Sending never waits for subscribers, so a slow subscriber cannot stall the
//! loop. The channel is bounded; a receiver that falls more than
//! [`DEFAULT_BROADCAST_CAPACITY`] commits behind gets
//! [`Error::SubscriptionLagged`] with the number of commits it missed and
//! then continues from the oldest retained one.
//!
//! ## Observer Isolation
//!
//! Each [`Observer`] runs on its own tokio task. An error returned from
//! `on_next` is routed to that observer's `on_error` and delivery continues;
//! other observers and the loop never see it.

use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::commit::Commit;
use crate::config::PollingConfig;
use crate::error::{Error, Result};
use crate::persistence::PersistStreams;
use crate::polling::{CommitHandler, HandlingResult, PollingClient, PollingStatus};
use crate::types::{BucketId, CheckpointToken};

// =============================================================================
// Configuration
// =============================================================================

/// Commits buffered per subscriber before it starts lagging.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 10_000;

// =============================================================================
// Broadcaster
// =============================================================================

/// Fans polled commits out to subscribers.
///
/// Clones share one channel. [`complete`](Self::complete) closes it for
/// everyone.
#[derive(Clone)]
pub struct CommitBroadcaster {
    tx: Arc<Mutex<Option<broadcast::Sender<Arc<Commit>>>>>,
}

impl Default for CommitBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl CommitBroadcaster {
    /// Creates a broadcaster with a per-subscriber buffer of `capacity`.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    fn sender(&self) -> Option<broadcast::Sender<Arc<Commit>>> {
        self.tx.lock().ok().and_then(|tx| tx.clone())
    }

    /// Subscribes to every commit published from now on.
    ///
    /// After [`complete`](Self::complete) the subscription ends immediately.
    pub fn subscribe(&self) -> Subscription {
        let receiver = match self.sender() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        };
        Subscription { receiver }
    }

    /// Runs `observer` on its own task until unsubscribed or completed.
    pub fn observe(&self, observer: Arc<dyn Observer>) -> ObserverHandle {
        let mut subscription = self.subscribe();
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    next = subscription.next() => next,
                    _ = &mut cancel_rx => return,
                };

                match next {
                    Some(Ok(commit)) => {
                        if let Err(e) = observer.on_next(&commit).await {
                            warn!(checkpoint = %commit.checkpoint, error = %e, "observer failed");
                            observer.on_error(&e).await;
                        }
                    }
                    Some(Err(e)) => observer.on_error(&e).await,
                    None => {
                        observer.on_completed().await;
                        return;
                    }
                }
            }
        });

        ObserverHandle {
            cancel: Some(cancel_tx),
            task: Some(task),
        }
    }

    /// Publishes one commit. Returns false once completed.
    pub fn publish(&self, commit: Arc<Commit>) -> bool {
        match self.sender() {
            Some(tx) => {
                // No receivers is not an error
                if tx.send(commit).is_err() {
                    debug!("no subscribers");
                }
                true
            }
            None => false,
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender().map_or(0, |tx| tx.receiver_count())
    }

    /// Closes the channel. Subscribers drain what is buffered, then end.
    pub fn complete(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }

    /// True once completed.
    pub fn is_completed(&self) -> bool {
        self.sender().is_none()
    }
}

#[async_trait]
impl CommitHandler for CommitBroadcaster {
    async fn handle(&mut self, commit: &Commit) -> Result<HandlingResult> {
        if self.publish(Arc::new(commit.clone())) {
            Ok(HandlingResult::MoveToNext)
        } else {
            Ok(HandlingResult::Stop)
        }
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// One subscriber's view of the broadcast.
///
/// # Example
///
/// ```rust,ignore
/// let mut sub = client.subscribe();
/// while let Some(next) = sub.next().await {
///     match next {
///         Ok(commit) => project(&commit),
///         Err(Error::SubscriptionLagged(n)) => resync(n),
///         Err(e) => return Err(e),
///     }
/// }
/// ```
pub struct Subscription {
    receiver: broadcast::Receiver<Arc<Commit>>,
}

impl Subscription {
    /// Waits for the next commit.
    ///
    /// - `Some(Ok(commit))` - next commit
    /// - `Some(Err(Error::SubscriptionLagged(n)))` - `n` commits were dropped
    /// - `None` - the broadcaster completed
    pub async fn next(&mut self) -> Option<Result<Arc<Commit>>> {
        match self.receiver.recv().await {
            Ok(commit) => Some(Ok(commit)),
            Err(broadcast::error::RecvError::Lagged(n)) => Some(Err(Error::SubscriptionLagged(n))),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Converts into a `futures::Stream`.
    pub fn into_stream(self) -> Pin<Box<dyn Stream<Item = Result<Arc<Commit>>> + Send>> {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.next().await.map(|item| (item, subscription))
        })
        .boxed()
    }
}

// =============================================================================
// Observer
// =============================================================================

/// Callback-style subscriber.
#[async_trait]
pub trait Observer: Send + Sync + 'static {
    /// Called for each commit. An error goes to [`on_error`](Self::on_error).
    async fn on_next(&self, commit: &Commit) -> Result<()>;

    /// Called for this observer's own failures and for lag.
    async fn on_error(&self, _error: &Error) {}

    /// Called once when the broadcaster completes.
    async fn on_completed(&self) {}
}

/// Keeps an observer subscribed. Dropping it unsubscribes.
pub struct ObserverHandle {
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ObserverHandle {
    /// Stops delivery and waits for the observer task to end.
    pub async fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "observer task panicked");
            }
        }
    }

    /// True once the observer task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

// =============================================================================
// Observable Polling Client
// =============================================================================

/// A polling client whose commits are broadcast to subscribers.
pub struct ObservableClient {
    client: PollingClient<CommitBroadcaster>,
    broadcaster: CommitBroadcaster,
}

impl ObservableClient {
    /// Creates an idle client.
    pub fn new(persistence: Arc<dyn PersistStreams>, config: PollingConfig) -> Self {
        Self::with_broadcaster(persistence, config, CommitBroadcaster::default())
    }

    /// Creates an idle client publishing through `broadcaster`.
    pub fn with_broadcaster(
        persistence: Arc<dyn PersistStreams>,
        config: PollingConfig,
        broadcaster: CommitBroadcaster,
    ) -> Self {
        Self {
            client: PollingClient::new(persistence, broadcaster.clone(), config),
            broadcaster,
        }
    }

    /// See [`CommitBroadcaster::subscribe`].
    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    /// See [`CommitBroadcaster::observe`].
    pub fn observe(&self, observer: Arc<dyn Observer>) -> ObserverHandle {
        self.broadcaster.observe(observer)
    }

    /// Starts the background loop after `checkpoint`.
    pub fn start_from(&self, checkpoint: CheckpointToken) -> Result<()> {
        self.client.start_from(checkpoint)
    }

    /// Starts the loop restricted to one bucket.
    pub fn start_from_bucket(&self, bucket_id: BucketId, checkpoint: CheckpointToken) -> Result<()> {
        self.client.start_from_bucket(bucket_id, checkpoint)
    }

    /// Runs one tick on the caller's task.
    pub async fn poll_once(&self) -> Result<()> {
        self.client.poll_once().await
    }

    /// Wakes the background loop.
    pub fn poll_now(&self) {
        self.client.poll_now()
    }

    /// Last checkpoint published.
    pub fn last_checkpoint(&self) -> CheckpointToken {
        self.client.last_checkpoint()
    }

    /// Lifecycle of the underlying loop.
    pub fn status(&self) -> PollingStatus {
        self.client.status()
    }

    /// Stops the loop. Subscribers stay attached.
    pub async fn stop(&self) -> Result<()> {
        self.client.stop().await
    }

    /// Stops the loop and completes every subscriber. Idempotent.
    pub async fn dispose(&self) {
        self.client.dispose().await;
        self.broadcaster.complete();
    }
}

// =============================================================================
// Tests
// =============================================================================
