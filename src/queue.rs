//! Delivery queue between the capture path and the upload worker.
//!
//! Producers push observations without ever waiting: when the backlog exceeds
//! its configured depth the oldest pending records are evicted. The single
//! consumer awaits records with [`DeliveryQueue::pop`] and observes a
//! [`QueueItem::Stop`] once the queue has been closed and fully drained.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::observation::Observation;

/// Default maximum number of pending records.
pub const DEFAULT_MAX_BACKLOG: usize = 1_000;

/// Configuration for the delivery queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of records held before the oldest are dropped
    pub max_backlog: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_backlog: DEFAULT_MAX_BACKLOG,
        }
    }
}

impl QueueConfig {
    pub fn new(max_backlog: usize) -> Self {
        Self { max_backlog }
    }
}

/// Statistics about queue operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Total number of records pushed
    pub records_received: u64,

    /// Total number of records handed to the consumer
    pub records_delivered: u64,

    /// Total number of records dropped due to backlog overflow
    pub records_dropped: u64,
}

/// Item handed to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    Record(Observation),

    /// The queue is closed and drained; the consumer should exit
    Stop,
}

/// Errors that can occur during queue operations.
#[derive(Debug, PartialEq, Eq)]
pub enum QueueError {
    /// The queue has been closed and is no longer accepting records
    Closed,
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Closed => write!(f, "Delivery queue has been closed"),
        }
    }
}

impl std::error::Error for QueueError {}

struct State {
    records: VecDeque<Observation>,
    closed: bool,
    senders: usize,
    stats: QueueStats,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    max_backlog: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave the deque half-updated,
        // so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn close(&self) {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            debug!(pending = state.records.len(), "Delivery queue closed");
        }
        drop(state);
        self.notify.notify_one();
    }
}

/// A producer handle for the delivery queue.
///
/// Handles can be cloned and shared across event sources. The queue closes
/// itself once every handle has been dropped.
pub struct QueueSender {
    shared: Arc<Shared>,
}

impl QueueSender {
    /// Push a record without waiting.
    ///
    /// If the backlog then exceeds its limit the oldest records are dropped.
    /// Returns an error if the queue has been closed.
    pub fn push(&self, record: Observation) -> Result<(), QueueError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }

        state.stats.records_received += 1;
        state.records.push_back(record);

        let limit = self.shared.max_backlog.max(1);
        while state.records.len() > limit {
            if let Some(dropped) = state.records.pop_front() {
                state.stats.records_dropped += 1;
                info!(
                    date_time = dropped.date_time,
                    max_backlog = limit,
                    "Backlog full: dropping oldest record"
                );
            }
        }

        drop(state);
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Close the queue. The consumer drains what is pending, then stops.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Number of records waiting to be consumed.
    pub fn len(&self) -> usize {
        self.shared.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.lock().stats.clone()
    }
}

impl Clone for QueueSender {
    fn clone(&self) -> Self {
        self.shared.lock().senders += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for QueueSender {
    fn drop(&mut self) {
        let last = {
            let mut state = self.shared.lock();
            state.senders -= 1;
            state.senders == 0
        };
        if last {
            self.shared.close();
        }
    }
}

/// The consuming end of the delivery queue.
pub struct DeliveryQueue {
    shared: Arc<Shared>,
}

impl DeliveryQueue {
    /// Create a new delivery queue with the given configuration.
    ///
    /// Returns a tuple of (QueueSender, DeliveryQueue).
    pub fn new(config: QueueConfig) -> (QueueSender, Self) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                records: VecDeque::new(),
                closed: false,
                senders: 1,
                stats: QueueStats::default(),
            }),
            notify: Notify::new(),
            max_backlog: config.max_backlog,
        });

        let sender = QueueSender {
            shared: Arc::clone(&shared),
        };

        (sender, Self { shared })
    }

    /// Create a new delivery queue with default configuration.
    pub fn with_defaults() -> (QueueSender, Self) {
        Self::new(QueueConfig::default())
    }

    /// Wait for the next item.
    ///
    /// Pending records are always delivered before `Stop`.
    pub async fn pop(&mut self) -> QueueItem {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Take the next item if one is ready.
    pub fn try_pop(&mut self) -> Option<QueueItem> {
        let mut state = self.shared.lock();
        match state.records.pop_front() {
            Some(record) => {
                state.stats.records_delivered += 1;
                Some(QueueItem::Record(record))
            }
            None if state.closed => Some(QueueItem::Stop),
            None => None,
        }
    }

    /// Take the most recent pending record, discarding everything older.
    ///
    /// Returns the record and the number of records it superseded.
    pub fn take_latest(&mut self) -> Option<(Observation, usize)> {
        let mut state = self.shared.lock();
        let latest = state.records.pop_back()?;
        let superseded = state.records.len();
        state.records.clear();
        state.stats.records_delivered += superseded as u64 + 1;
        Some((latest, superseded))
    }

    /// Resolve once the queue has been closed.
    pub async fn closed(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            self.shared.notify.notified().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Get the current number of pending records.
    pub fn len(&self) -> usize {
        self.shared.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get current queue statistics.
    pub fn stats(&self) -> QueueStats {
        self.shared.lock().stats.clone()
    }
}
