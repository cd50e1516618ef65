//! The bounded receive queue.
//!
//! A single producer (the packet router) and a single consumer (the
//! application) meet here. The queue is strictly FIFO; what happens when it
//! fills is the configured [`OverflowPolicy`]. A BLOCK queue whose consumer
//! has wedged degrades itself to DROP_OLDEST after ten consecutive put
//! timeouts and restores the original policy once the consumer has drained
//! it back under half capacity for a minute, so a stuck reader costs
//! freshness, never liveness.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use cyevent::{
    metrics::{names, NoopMetrics},
    MetricsSink,
};
use thiserror::Error;
use tokio::{sync::Notify, time::Instant};

use crate::error::QueueFullError;

/// Consecutive put timeouts a BLOCK queue tolerates before degrading.
const DEGRADE_AFTER_TIMEOUTS: u32 = 10;
/// How long a degraded queue stays degraded at minimum.
const RESTORE_AFTER: Duration = Duration::from_secs(60);

/// What `put` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait up to the put timeout for space. Suits control-like traffic.
    Block,
    /// Evict the head, then enqueue. Suits high-volume status traffic.
    DropOldest,
    /// Fail immediately.
    Reject,
}

impl OverflowPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            OverflowPolicy::Block => "block",
            OverflowPolicy::DropOldest => "drop_oldest",
            OverflowPolicy::Reject => "reject",
        }
    }
}

/// Outcome of one `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutResult {
    pub success: bool,
    /// Whether an older item was evicted to make room.
    pub dropped: bool,
    pub reason: Option<&'static str>,
}

impl PutResult {
    fn ok() -> Self {
        Self {
            success: true,
            dropped: false,
            reason: None,
        }
    }

    fn ok_dropping() -> Self {
        Self {
            success: true,
            dropped: true,
            reason: None,
        }
    }

    fn failed(reason: &'static str) -> Self {
        Self {
            success: false,
            dropped: false,
            reason: Some(reason),
        }
    }
}

/// Raised by [`BoundedQueue::get`] when nothing arrives in time.
#[derive(Debug, Clone, Error)]
#[error("queue {queue_name} yielded nothing within {waited:?}")]
pub struct QueueGetTimeout {
    pub queue_name: String,
    pub waited: Duration,
}

/// Raised by [`BoundedQueue::get`] once the queue is closed and drained.
#[derive(Debug, Clone, Error)]
#[error("queue {queue_name} is closed")]
pub struct QueueClosed {
    pub queue_name: String,
}

/// Why a `get` returned no item.
#[derive(Debug, Clone, Error)]
pub enum QueueGetError {
    #[error(transparent)]
    Timeout(#[from] QueueGetTimeout),
    #[error(transparent)]
    Closed(#[from] QueueClosed),
}

struct Inner<T> {
    items: VecDeque<T>,
    consecutive_put_timeouts: u32,
    policy_switched_at: Option<Instant>,
    closed: bool,
}

/// A bounded FIFO with a configurable overflow policy.
pub struct BoundedQueue<T> {
    name: String,
    queue_type: &'static str,
    capacity: usize,
    policy: OverflowPolicy,
    inner: Mutex<Inner<T>>,
    not_empty: Notify,
    not_full: Notify,
    metrics: Arc<dyn MetricsSink>,
}

impl<T> BoundedQueue<T> {
    pub fn new(
        name: impl Into<String>,
        queue_type: &'static str,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Self {
        Self::with_metrics(name, queue_type, capacity, policy, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        name: impl Into<String>,
        queue_type: &'static str,
        capacity: usize,
        policy: OverflowPolicy,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        assert!(capacity > 0, "a zero-capacity queue can never accept");
        Self {
            name: name.into(),
            queue_type,
            capacity,
            policy,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                consecutive_put_timeouts: 0,
                policy_switched_at: None,
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            metrics,
        }
    }

    /// Items currently queued.
    pub fn qsize(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    /// The policy currently in force, accounting for degradation.
    pub fn effective_policy(&self) -> OverflowPolicy {
        let mut inner = self.inner.lock().unwrap();
        self.maybe_restore(&mut inner);
        self.policy_of(&inner)
    }

    fn policy_of(&self, inner: &Inner<T>) -> OverflowPolicy {
        if inner.policy_switched_at.is_some() {
            OverflowPolicy::DropOldest
        } else {
            self.policy
        }
    }

    /// Restore the configured policy once the degradation has aged out and
    /// the consumer has caught up.
    fn maybe_restore(&self, inner: &mut Inner<T>) {
        let Some(switched_at) = inner.policy_switched_at else {
            return;
        };
        if switched_at.elapsed() >= RESTORE_AFTER && inner.items.len() * 2 < self.capacity {
            inner.policy_switched_at = None;
            inner.consecutive_put_timeouts = 0;
            self.metrics.incr_counter(
                names::QUEUE_POLICY_SWITCH_TOTAL,
                &[("reason", "restored")],
                1,
            );
            tracing::info!(queue = %self.name, "overflow policy restored");
        }
    }

    fn degrade(&self, inner: &mut Inner<T>) {
        inner.policy_switched_at = Some(Instant::now());
        self.metrics.incr_counter(
            names::QUEUE_POLICY_SWITCH_TOTAL,
            &[("reason", "block_timeouts")],
            1,
        );
        tracing::warn!(
            queue = %self.name,
            timeouts = inner.consecutive_put_timeouts,
            "consumer stalled, degrading BLOCK to DROP_OLDEST",
        );
    }

    fn record_size(&self, len: usize) {
        self.metrics.set_gauge(
            names::RECV_QUEUE_SIZE,
            &[("device_id", &self.name)],
            len as f64,
        );
    }

    fn record_full(&self) {
        self.metrics.incr_counter(
            names::QUEUE_FULL_TOTAL,
            &[("device_id", &self.name), ("queue_type", self.queue_type)],
            1,
        );
    }

    /// Enqueue `item`, waiting up to `timeout` under the BLOCK policy.
    pub async fn put(&self, item: T, timeout: Duration) -> PutResult {
        let deadline = Instant::now() + timeout;
        let mut item = item;
        loop {
            let wait;
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.closed {
                    return PutResult::failed("closed");
                }
                self.maybe_restore(&mut inner);

                if inner.items.len() < self.capacity {
                    inner.items.push_back(item);
                    inner.consecutive_put_timeouts = 0;
                    self.record_size(inner.items.len());
                    drop(inner);
                    self.not_empty.notify_one();
                    return PutResult::ok();
                }

                match self.policy_of(&inner) {
                    OverflowPolicy::DropOldest => {
                        inner.items.pop_front();
                        inner.items.push_back(item);
                        self.metrics.incr_counter(
                            names::QUEUE_DROPPED_TOTAL,
                            &[
                                ("device_id", &self.name),
                                ("queue_type", self.queue_type),
                                ("reason", "drop_oldest"),
                            ],
                            1,
                        );
                        self.record_size(inner.items.len());
                        drop(inner);
                        self.not_empty.notify_one();
                        return PutResult::ok_dropping();
                    }
                    OverflowPolicy::Reject => {
                        self.record_full();
                        return PutResult::failed("queue_full");
                    }
                    OverflowPolicy::Block => {
                        wait = self.not_full.notified();
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, wait).await.is_err() {
                let mut inner = self.inner.lock().unwrap();
                // Space may have appeared between the timeout and this lock.
                if inner.items.len() < self.capacity {
                    item = match self.try_push(&mut inner, item) {
                        Ok(()) => return PutResult::ok(),
                        Err(item) => item,
                    };
                }
                inner.consecutive_put_timeouts += 1;
                self.record_full();
                if inner.consecutive_put_timeouts >= DEGRADE_AFTER_TIMEOUTS
                    && inner.policy_switched_at.is_none()
                {
                    self.degrade(&mut inner);
                }
                return PutResult::failed("timeout");
            }
            // Woken: loop back and race for the slot under the lock.
        }
    }

    fn try_push(&self, inner: &mut Inner<T>, item: T) -> Result<(), T> {
        if inner.items.len() < self.capacity {
            inner.items.push_back(item);
            inner.consecutive_put_timeouts = 0;
            self.record_size(inner.items.len());
            self.not_empty.notify_one();
            Ok(())
        } else {
            Err(item)
        }
    }

    /// Non-blocking enqueue for callers that prefer an error to a result
    /// record; fails with [`QueueFullError`] when no space exists and the
    /// effective policy is not DROP_OLDEST.
    pub fn try_put(&self, item: T) -> Result<PutResult, QueueFullError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Ok(PutResult::failed("closed"));
        }
        self.maybe_restore(&mut inner);

        if inner.items.len() < self.capacity {
            return Ok(match self.try_push(&mut inner, item) {
                Ok(()) => PutResult::ok(),
                Err(_) => unreachable!("space was checked under the lock"),
            });
        }
        if self.policy_of(&inner) == OverflowPolicy::DropOldest {
            inner.items.pop_front();
            inner.items.push_back(item);
            self.metrics.incr_counter(
                names::QUEUE_DROPPED_TOTAL,
                &[
                    ("device_id", &self.name),
                    ("queue_type", self.queue_type),
                    ("reason", "drop_oldest"),
                ],
                1,
            );
            drop(inner);
            self.not_empty.notify_one();
            return Ok(PutResult::ok_dropping());
        }
        self.record_full();
        Err(QueueFullError {
            queue_name: self.name.clone(),
            policy: self.policy_of(&inner),
            queue_size: inner.items.len(),
        })
    }

    /// Dequeue the head, waiting up to `timeout`.
    pub async fn get(&self, timeout: Duration) -> Result<T, QueueGetError> {
        let deadline = Instant::now() + timeout;
        loop {
            let wait;
            {
                let mut inner = self.inner.lock().unwrap();
                self.maybe_restore(&mut inner);
                if let Some(item) = inner.items.pop_front() {
                    self.record_size(inner.items.len());
                    drop(inner);
                    self.not_full.notify_one();
                    return Ok(item);
                }
                if inner.closed {
                    return Err(QueueClosed {
                        queue_name: self.name.clone(),
                    }
                    .into());
                }
                wait = self.not_empty.notified();
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, wait).await.is_err() {
                return Err(QueueGetTimeout {
                    queue_name: self.name.clone(),
                    waited: timeout,
                }
                .into());
            }
        }
    }

    /// Dequeue the head, waiting for as long as it takes or until the
    /// queue closes.
    pub async fn recv(&self) -> Result<T, QueueClosed> {
        loop {
            let wait;
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(item) = inner.items.pop_front() {
                    self.record_size(inner.items.len());
                    drop(inner);
                    self.not_full.notify_one();
                    return Ok(item);
                }
                if inner.closed {
                    return Err(QueueClosed {
                        queue_name: self.name.clone(),
                    });
                }
                wait = self.not_empty.notified();
            }
            wait.await;
        }
    }

    /// Close the queue: pending and future `get`s drain what is left, then
    /// fail with [`QueueClosed`]; future `put`s fail immediately.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Accept items again after a [`close`](Self::close), for owners whose
    /// lifecycle reopens (a transport reconnecting after shutdown).
    pub fn reopen(&self) {
        self.inner.lock().unwrap().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}
