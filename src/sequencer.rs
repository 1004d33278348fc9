//! # Commit Sequencer
//!
//! Checkpoints are allocated when a write starts, not when it becomes
//! visible. Two concurrent writers can make checkpoint 8 readable before 7:
//!
//! ```text
//!   feed at t0:   5  6  8        (7 still in flight)
//!   feed at t1:   5  6  7  8
//! ```
//!
//! A poller that moved past 8 at t0 would never see 7. [`CommitSequencer`]
//! wraps a [`CommitHandler`] and holds back anything that is not the next
//! sequential checkpoint, answering `Retry` until either the missing number
//! shows up or the gap has been open for longer than the timeout. After the
//! timeout the gap is treated as permanent (an aborted write, a deleted
//! stream) and delivery moves on.
//!
//! Time is read through a [`Clock`] so tests can drive the timeout with
//! [`ManualClock`](crate::clock::ManualClock).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::commit::Commit;
use crate::error::Result;
use crate::polling::{CommitHandler, HandlingResult};
use crate::types::CheckpointToken;

/// How long a checkpoint gap is tolerated before it is skipped.
pub const DEFAULT_SEQUENCER_TIMEOUT: Duration = Duration::from_secs(2);

/// Gap-tolerant ordering in front of another handler.
pub struct CommitSequencer<H> {
    inner: H,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    last_routed: CheckpointToken,
    last_verdict: HandlingResult,
    gap_since: Option<Instant>,
}

impl<H: CommitHandler> CommitSequencer<H> {
    /// Wraps `inner` with the default timeout and the system clock.
    pub fn new(inner: H) -> Self {
        Self::with_clock(inner, Arc::new(SystemClock), DEFAULT_SEQUENCER_TIMEOUT)
    }

    /// Wraps `inner` with an explicit clock and timeout.
    pub fn with_clock(inner: H, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            inner,
            clock,
            timeout,
            last_routed: CheckpointToken::START,
            last_verdict: HandlingResult::MoveToNext,
            gap_since: None,
        }
    }

    /// Treats everything up to `checkpoint` as already delivered.
    pub fn starting_after(mut self, checkpoint: CheckpointToken) -> Self {
        self.last_routed = checkpoint;
        self
    }

    /// Checkpoint of the last commit forwarded and accepted.
    pub fn last_routed(&self) -> CheckpointToken {
        self.last_routed
    }

    /// The wrapped handler.
    pub fn inner(&self) -> &H {
        &self.inner
    }

    fn gap_expired(&mut self) -> bool {
        let now = self.clock.now();
        match self.gap_since {
            Some(since) => now.duration_since(since) >= self.timeout,
            None => {
                self.gap_since = Some(now);
                false
            }
        }
    }
}

#[async_trait]
impl<H: CommitHandler> CommitHandler for CommitSequencer<H> {
    async fn handle(&mut self, commit: &Commit) -> Result<HandlingResult> {
        let checkpoint = commit.checkpoint;

        // Already forwarded.
        if checkpoint <= self.last_routed {
            return Ok(self.last_verdict);
        }

        let sequential = checkpoint == self.last_routed.next();
        if !sequential {
            if !self.gap_expired() {
                debug!(
                    expected = %self.last_routed.next(),
                    got = %checkpoint,
                    "holding back out-of-order checkpoint"
                );
                return Ok(HandlingResult::Retry);
            }
            warn!(
                expected = %self.last_routed.next(),
                got = %checkpoint,
                "checkpoint gap timed out, skipping"
            );
        }

        let verdict = self.inner.handle(commit).await?;
        if verdict == HandlingResult::MoveToNext {
            self.last_routed = checkpoint;
            self.last_verdict = verdict;
            self.gap_since = None;
        }
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::commit::{CommitAttempt, EventMessage, Payload};
    use crate::types::{CommitId, CommitSequence, StreamRev};
    use serde_json::json;

    fn commit_at(checkpoint: i64) -> Commit {
        let attempt = CommitAttempt::new(
            "default",
            format!("s{checkpoint}"),
            StreamRev::FIRST,
            CommitId::new(),
            CommitSequence::FIRST,
            vec![EventMessage::new(Payload::new("E", json!(checkpoint)))],
        );
        Commit::from_attempt(attempt, CheckpointToken::from_raw(checkpoint))
    }

    fn recorder() -> (
        Arc<std::sync::Mutex<Vec<i64>>>,
        impl FnMut(&Commit) -> Result<HandlingResult> + Send,
    ) {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |commit: &Commit| {
            sink.lock().unwrap().push(commit.checkpoint.as_raw());
            Ok(HandlingResult::MoveToNext)
        })
    }

    #[tokio::test]
    async fn test_sequential_commits_pass_through() {
        let (seen, handler) = recorder();
        let mut sequencer = CommitSequencer::new(handler);

        for checkpoint in 1..=3 {
            let verdict = sequencer.handle(&commit_at(checkpoint)).await.unwrap();
            assert_eq!(verdict, HandlingResult::MoveToNext);
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_gap_is_held_until_timeout() {
        let clock = Arc::new(ManualClock::new());
        let (seen, handler) = recorder();
        let mut sequencer =
            CommitSequencer::with_clock(handler, clock.clone(), Duration::from_secs(2));

        sequencer.handle(&commit_at(1)).await.unwrap();
        assert_eq!(
            sequencer.handle(&commit_at(3)).await.unwrap(),
            HandlingResult::Retry
        );

        clock.advance(Duration::from_secs(1));
        assert_eq!(
            sequencer.handle(&commit_at(3)).await.unwrap(),
            HandlingResult::Retry
        );

        clock.advance(Duration::from_secs(1));
        assert_eq!(
            sequencer.handle(&commit_at(3)).await.unwrap(),
            HandlingResult::MoveToNext
        );
        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_filled_gap_is_delivered_in_order() {
        let clock = Arc::new(ManualClock::new());
        let (seen, handler) = recorder();
        let mut sequencer =
            CommitSequencer::with_clock(handler, clock.clone(), Duration::from_secs(2));

        sequencer.handle(&commit_at(1)).await.unwrap();
        assert_eq!(
            sequencer.handle(&commit_at(3)).await.unwrap(),
            HandlingResult::Retry
        );

        // 2 became visible on the next poll
        sequencer.handle(&commit_at(2)).await.unwrap();
        sequencer.handle(&commit_at(3)).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_redelivery_does_not_invoke_handler() {
        let (seen, handler) = recorder();
        let mut sequencer = CommitSequencer::new(handler);

        sequencer.handle(&commit_at(1)).await.unwrap();
        let verdict = sequencer.handle(&commit_at(1)).await.unwrap();

        assert_eq!(verdict, HandlingResult::MoveToNext);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(sequencer.last_routed().as_raw(), 1);
    }
}
