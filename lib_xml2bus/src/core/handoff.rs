//! # Hand-off Queue
//!
//! The bounded buffer that decouples the ingestion rate of all XML connections
//! from the publish rate of the downstream bus. Every connection supervisor
//! holds an `Arc<HandoffQueue>` and enqueues into it; the publisher task
//! dequeues from the same object. There is no process-wide singleton.
//!
//! ## Overflow policy
//!
//! When the queue is at capacity the producer behaves according to the
//! configured [`OverflowPolicy`]:
//!
//! - **`Block`**: the producing connection waits until the publisher frees a
//!   slot. Backpressure propagates to every ingesting connection and no record
//!   is lost. This is the default.
//! - **`DropAfter(timeout)`**: the producer waits at most `timeout`, then drops
//!   the record. Dropped records are counted and logged.
//!
//! Ordering is FIFO per producer. Records from different connections may
//! interleave arbitrarily.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError};
use tokio_util::sync::CancellationToken;

use crate::core::record::Record;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Errors raised by the hand-off queue and its configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("hand-off queue is closed")]
    Closed,

    #[error("hand-off queue capacity must be greater than zero")]
    ZeroCapacity,

    #[error("invalid overflow policy '{0}': expected 'block' or 'drop-after=<millis>'")]
    InvalidPolicy(String),
}

/// # Overflow Policy
///
/// What `enqueue` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OverflowPolicy {
    /// Wait for space. Never drops.
    #[default]
    Block,
    /// Wait up to the given duration, then drop the record.
    DropAfter(Duration),
}

impl FromStr for OverflowPolicy {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        if value.eq_ignore_ascii_case("block") {
            return Ok(OverflowPolicy::Block);
        }
        let millis = value
            .strip_prefix("drop-after=")
            .and_then(|ms| ms.trim().parse::<u64>().ok())
            .ok_or_else(|| QueueError::InvalidPolicy(s.to_string()))?;
        Ok(OverflowPolicy::DropAfter(Duration::from_millis(millis)))
    }
}

impl TryFrom<String> for OverflowPolicy {
    type Error = QueueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OverflowPolicy> for String {
    fn from(policy: OverflowPolicy) -> Self {
        policy.to_string()
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowPolicy::Block => write!(f, "block"),
            OverflowPolicy::DropAfter(timeout) => write!(f, "drop-after={}", timeout.as_millis()),
        }
    }
}

/// Result of a successful `enqueue` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The record is in the queue.
    Queued,
    /// The queue stayed full past the `DropAfter` timeout; the record is gone.
    Dropped,
}

/// # Hand-off Queue
///
/// Bounded multi-producer, multi-consumer queue of [`Record`]s. Share it with
/// `Arc`; all methods take `&self`.
pub struct HandoffQueue {
    sender: mpsc::Sender<Record>,
    /// Consumers take turns on the single receiver.
    receiver: Mutex<mpsc::Receiver<Record>>,
    /// Cancelled by `close`. Checked without taking the receiver lock.
    closed: CancellationToken,
    policy: OverflowPolicy,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

impl HandoffQueue {
    /// Creates a queue holding at most `capacity` records.
    ///
    /// # Example
    /// ```rust
    /// use std::sync::Arc;
    /// use lib_xml2bus::core::{HandoffQueue, OverflowPolicy};
    ///
    /// let queue = Arc::new(HandoffQueue::new(10_000, OverflowPolicy::Block).unwrap());
    /// assert!(queue.is_empty());
    /// ```
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        let (sender, receiver) = mpsc::channel(capacity);
        Ok(Self {
            sender,
            receiver: Mutex::new(receiver),
            closed: CancellationToken::new(),
            policy,
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// # Enqueue
    ///
    /// Pushes a record, applying the overflow policy when the queue is full.
    ///
    /// # Returns
    /// - `Ok(EnqueueOutcome::Queued)` once the record is stored.
    /// - `Ok(EnqueueOutcome::Dropped)` if the `DropAfter` timeout elapsed.
    /// - `Err(QueueError::Closed)` after [`HandoffQueue::close`].
    pub async fn enqueue(&self, record: Record) -> Result<EnqueueOutcome, QueueError> {
        if self.closed.is_cancelled() {
            return Err(QueueError::Closed);
        }
        match self.policy {
            OverflowPolicy::Block => {
                tokio::select! {
                    biased;
                    _ = self.closed.cancelled() => return Err(QueueError::Closed),
                    sent = self.sender.send(record) => sent.map_err(|_| QueueError::Closed)?,
                }
            }
            OverflowPolicy::DropAfter(timeout) => {
                let sent = tokio::select! {
                    biased;
                    _ = self.closed.cancelled() => return Err(QueueError::Closed),
                    sent = self.sender.send_timeout(record, timeout) => sent,
                };
                match sent {
                    Ok(()) => {}
                    Err(SendTimeoutError::Timeout(record)) => {
                        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::warn!(
                            "Hand-off queue full for {}ms, dropped record {} ({} dropped so far)",
                            timeout.as_millis(),
                            record,
                            total
                        );
                        return Ok(EnqueueOutcome::Dropped);
                    }
                    Err(SendTimeoutError::Closed(_)) => return Err(QueueError::Closed),
                }
            }
        }
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(EnqueueOutcome::Queued)
    }

    /// # Dequeue
    ///
    /// Waits for the next record. Returns `None` only once the queue has been
    /// closed and fully drained.
    pub async fn dequeue(&self) -> Option<Record> {
        let mut receiver = self.receiver.lock().await;
        if self.closed.is_cancelled() {
            return receiver.try_recv().ok();
        }
        tokio::select! {
            biased;
            record = receiver.recv() => record,
            _ = self.closed.cancelled() => receiver.try_recv().ok(),
        }
    }

    /// Takes a record if one is immediately available and no other consumer
    /// is currently waiting on the queue.
    pub fn try_dequeue(&self) -> Option<Record> {
        let mut receiver = self.receiver.try_lock().ok()?;
        match receiver.try_recv() {
            Ok(record) => Some(record),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Stops accepting new records. Records already queued can still be
    /// dequeued; producers, including those waiting for space, get
    /// [`QueueError::Closed`]. A consumer waiting on an empty queue gets `None`.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// `true` once [`HandoffQueue::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Number of records currently buffered.
    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// `true` when no record is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed maximum number of buffered records.
    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    /// The overflow policy this queue was built with.
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Total records accepted since start.
    pub fn enqueued_total(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Total records dropped by the `DropAfter` policy since start.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for HandoffQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandoffQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("policy", &self.policy)
            .field("enqueued", &self.enqueued_total())
            .field("dropped", &self.dropped_total())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(n: usize) -> Record {
        Record::new(n.to_string(), format!("msg {}", n))
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("block".parse::<OverflowPolicy>(), Ok(OverflowPolicy::Block));
        assert_eq!(" BLOCK ".parse::<OverflowPolicy>(), Ok(OverflowPolicy::Block));
        assert_eq!(
            "drop-after=250".parse::<OverflowPolicy>(),
            Ok(OverflowPolicy::DropAfter(Duration::from_millis(250)))
        );
        assert!(matches!("drop".parse::<OverflowPolicy>(), Err(QueueError::InvalidPolicy(_))));
        assert!(matches!("drop-after=soon".parse::<OverflowPolicy>(), Err(QueueError::InvalidPolicy(_))));

        let policy = OverflowPolicy::DropAfter(Duration::from_millis(40));
        assert_eq!(policy.to_string().parse::<OverflowPolicy>(), Ok(policy));
    }

    #[test]
    fn test_policy_serde_as_string() {
        let json = serde_json::to_string(&OverflowPolicy::DropAfter(Duration::from_millis(5))).unwrap();
        assert_eq!(json, r#""drop-after=5""#);
        let parsed: OverflowPolicy = serde_json::from_str(r#""block""#).unwrap();
        assert_eq!(parsed, OverflowPolicy::Block);
        assert!(serde_json::from_str::<OverflowPolicy>(r#""sometimes""#).is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(HandoffQueue::new(0, OverflowPolicy::Block).unwrap_err(), QueueError::ZeroCapacity);
    }

    #[tokio::test]
    async fn test_fifo_order_and_len() {
        let queue = HandoffQueue::new(8, OverflowPolicy::Block).unwrap();
        for n in 0..5 {
            assert_eq!(queue.enqueue(record(n)).await, Ok(EnqueueOutcome::Queued));
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.capacity(), 8);
        for n in 0..5 {
            assert_eq!(queue.dequeue().await, Some(record(n)));
        }
        assert!(queue.is_empty());
        assert_eq!(queue.try_dequeue(), None);
        assert_eq!(queue.enqueued_total(), 5);
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_space() {
        let queue = Arc::new(HandoffQueue::new(1, OverflowPolicy::Block).unwrap());
        queue.enqueue(record(1)).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(record(2)).await })
        };

        // The producer cannot finish while the queue is full.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.dequeue().await, Some(record(1)));
        assert_eq!(producer.await.unwrap(), Ok(EnqueueOutcome::Queued));
        assert_eq!(queue.dequeue().await, Some(record(2)));
        assert_eq!(queue.dropped_total(), 0);
    }

    #[tokio::test]
    async fn test_drop_after_policy_drops_when_full() {
        let queue = HandoffQueue::new(1, OverflowPolicy::DropAfter(Duration::from_millis(20))).unwrap();
        assert_eq!(queue.enqueue(record(1)).await, Ok(EnqueueOutcome::Queued));
        assert_eq!(queue.enqueue(record(2)).await, Ok(EnqueueOutcome::Dropped));
        assert_eq!(queue.dropped_total(), 1);
        assert_eq!(queue.enqueued_total(), 1);
        assert_eq!(queue.dequeue().await, Some(record(1)));
        assert_eq!(queue.try_dequeue(), None);
    }

    #[tokio::test]
    async fn test_close_rejects_producers_and_drains() {
        let queue = HandoffQueue::new(4, OverflowPolicy::Block).unwrap();
        queue.enqueue(record(1)).await.unwrap();
        queue.close();
        assert!(queue.is_closed());
        assert_eq!(queue.enqueue(record(2)).await, Err(QueueError::Closed));
        assert_eq!(queue.dequeue().await, Some(record(1)));
        assert_eq!(queue.dequeue().await, None);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumer() {
        let queue = Arc::new(HandoffQueue::new(4, OverflowPolicy::Block).unwrap());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        // Let the consumer take the receiver and wait on the empty queue.
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.close();
        let dequeued = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer still waiting after close")
            .unwrap();
        assert_eq!(dequeued, None);
    }

    #[tokio::test]
    async fn test_close_releases_blocked_producer() {
        let queue = Arc::new(HandoffQueue::new(1, OverflowPolicy::Block).unwrap());
        queue.enqueue(record(1)).await.unwrap();
        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(record(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.close();
        let outcome = tokio::time::timeout(Duration::from_secs(1), producer).await.unwrap().unwrap();
        assert_eq!(outcome, Err(QueueError::Closed));
        assert_eq!(queue.dequeue().await, Some(record(1)));
        assert_eq!(queue.dequeue().await, None);
    }

    #[tokio::test]
    async fn test_many_producers_no_loss() {
        let queue = Arc::new(HandoffQueue::new(16, OverflowPolicy::Block).unwrap());
        let producers: Vec<_> = (0..8)
            .map(|p| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    for n in 0..50 {
                        queue.enqueue(Record::new(p.to_string(), n.to_string())).await.unwrap();
                    }
                })
            })
            .collect();

        let mut last_seen = vec![-1i64; 8];
        for _ in 0..400 {
            let record = queue.dequeue().await.unwrap();
            let producer: usize = record.identifier.parse().unwrap();
            let seq: i64 = record.text.parse().unwrap();
            assert_eq!(seq, last_seen[producer] + 1, "per-producer order broken");
            last_seen[producer] = seq;
        }
        for producer in producers {
            producer.await.unwrap();
        }
        assert!(queue.is_empty());
        assert_eq!(queue.enqueued_total(), 400);
    }
}
