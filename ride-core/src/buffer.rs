//! Pending-operation queue for the broker link.
//!
//! Subscribes and sends issued while the link is not up are captured here
//! and replayed in FIFO order, exactly once, when the link comes up:
//! - FIFO ordering for replay
//! - Max size limit to prevent unbounded memory growth
//! - At most one queued subscribe per topic key
//!
//! The queue is used by ride-client's connection manager. An operation that
//! fails mid-flush goes back to the front with [`PendingQueue::requeue_front`].

use std::collections::VecDeque;
use ride_types::TopicKey;
use thiserror::Error;

/// Error type for queue operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Queue is at capacity.
    #[error("pending queue full (capacity: {capacity})")]
    Full {
        /// Current queue capacity.
        capacity: usize,
    },
}

/// A deferred broker operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOperation {
    /// Establish the subscription registered under `key`.
    Subscribe {
        /// Registry key; the destination is derived from it at replay time.
        key: TopicKey,
    },
    /// Publish a body to a destination.
    Send {
        /// Broker destination.
        destination: String,
        /// Serialized JSON body.
        body: String,
    },
}

impl PendingOperation {
    /// The topic key if this is a subscribe.
    pub fn subscribe_key(&self) -> Option<&TopicKey> {
        match self {
            Self::Subscribe { key } => Some(key),
            Self::Send { .. } => None,
        }
    }
}

/// FIFO queue of deferred operations.
#[derive(Debug)]
pub struct PendingQueue {
    /// Maximum number of queued operations.
    max_size: usize,
    /// Operations waiting for the link.
    queue: VecDeque<PendingOperation>,
}

impl PendingQueue {
    /// Create a new queue with the given maximum size.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            queue: VecDeque::new(),
        }
    }

    /// Add an operation to the back of the queue.
    ///
    /// A subscribe for a key that is already queued is absorbed: the existing
    /// entry keeps its position. Returns an error if the queue is full.
    pub fn enqueue(&mut self, op: PendingOperation) -> Result<(), QueueError> {
        if let Some(key) = op.subscribe_key() {
            if self.contains_subscribe(key) {
                return Ok(());
            }
        }
        if self.queue.len() >= self.max_size {
            return Err(QueueError::Full {
                capacity: self.max_size,
            });
        }
        self.queue.push_back(op);
        Ok(())
    }

    /// Remove and return the next operation.
    pub fn dequeue(&mut self) -> Option<PendingOperation> {
        self.queue.pop_front()
    }

    /// Put an operation back at the front after a failed replay.
    ///
    /// Bypasses the size limit; the operation was already accounted for.
    pub fn requeue_front(&mut self, op: PendingOperation) {
        self.queue.push_front(op);
    }

    /// Queue re-subscription of `keys` ahead of everything else.
    ///
    /// Keys keep the given order. Any later duplicate subscribe for one of
    /// these keys is dropped.
    pub fn requeue_subscriptions<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = TopicKey>,
    {
        let keys: Vec<TopicKey> = keys.into_iter().collect();
        self.queue
            .retain(|op| !op.subscribe_key().is_some_and(|key| keys.contains(key)));
        for key in keys.into_iter().rev() {
            self.queue.push_front(PendingOperation::Subscribe { key });
        }
    }

    /// Drop a queued subscribe for `key`. Returns whether one was queued.
    pub fn remove_subscribe(&mut self, key: &TopicKey) -> bool {
        let before = self.queue.len();
        self.queue.retain(|op| op.subscribe_key() != Some(key));
        before != self.queue.len()
    }

    /// Check whether a subscribe for `key` is queued.
    pub fn contains_subscribe(&self, key: &TopicKey) -> bool {
        self.queue.iter().any(|op| op.subscribe_key() == Some(key))
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Maximum number of queued operations.
    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Discard everything. Returns how many operations were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }
}
