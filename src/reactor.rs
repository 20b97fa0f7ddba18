//! Deferred work items for the main loop.
//!
//! A work item is a named loop job with a millisecond delay, backed by a
//! timer wheel. Scheduling an item that is already pending is a no-op, so
//! each item has at most one in-flight instance; cancellation before the
//! deadline is O(1) and guarantees the item will not fire. Expiry order
//! is deadline-then-FIFO on the monotonic clock.

use std::collections::HashMap;
use std::future::poll_fn;
use std::task::Poll;
use std::time::Duration;
use tokio_util::time::delay_queue::{DelayQueue, Key};
use tracing::trace;

/// The loop jobs the bootstrap driver schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Work {
    /// Initialize the state machine and take the first step.
    Crank,
    /// 100 ms bootstrap progress tick with the 120 s deadline.
    Bootstrap,
    /// Final stage of bootstrap: prune, hooks, rc.local, TTYs.
    Finalize,
    /// Re-step services with a pending timed action (stop grace expiry,
    /// restart backoff release).
    Supervise,
    /// Configuration changed on disk; re-parse and diff.
    Reload,
}

/// Timer wheel of pending work items.
#[derive(Debug, Default)]
pub struct WorkQueue {
    queue: DelayQueue<Work>,
    keys: HashMap<Work, Key>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `work` after `delay`. Idempotent while the item is
    /// already pending: the earlier deadline stands.
    pub fn schedule(&mut self, work: Work, delay: Duration) {
        if self.keys.contains_key(&work) {
            trace!(?work, "work item already pending");
            return;
        }
        let key = self.queue.insert(work, delay);
        self.keys.insert(work, key);
    }

    /// Cancel then schedule, for deadlines that move closer.
    pub fn reschedule(&mut self, work: Work, delay: Duration) {
        self.cancel(work);
        self.schedule(work, delay);
    }

    /// Remove a pending item. Returns whether it was pending; a removed
    /// item is guaranteed not to fire.
    pub fn cancel(&mut self, work: Work) -> bool {
        match self.keys.remove(&work) {
            Some(key) => self.queue.try_remove(&key).is_some(),
            None => false,
        }
    }

    pub fn is_scheduled(&self, work: Work) -> bool {
        self.keys.contains_key(&work)
    }

    /// Wait for the next item to expire. Pends forever while the queue
    /// is empty, which is what a `select!` branch wants.
    pub async fn next(&mut self) -> Work {
        poll_fn(|cx| match self.queue.poll_expired(cx) {
            Poll::Ready(Some(expired)) => {
                let work = expired.into_inner();
                self.keys.remove(&work);
                Poll::Ready(work)
            }
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        })
        .await
    }
}
