//! Bounded inbound message queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::types::Message;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A thread-safe, bounded FIFO of received messages.
///
/// When the queue is full, pushing discards the oldest message and bumps
/// [`dropped_count`](Self::dropped_count). Draining never blocks on I/O.
///
/// # Example
///
/// ```
/// use mqttc::{Message, MessageQueue};
///
/// let queue = MessageQueue::new(2);
/// queue.push(Message::new("a", "1"));
/// queue.push(Message::new("a", "2"));
/// queue.push(Message::new("a", "3"));
///
/// let drained = queue.drain();
/// assert_eq!(drained.len(), 2);
/// assert_eq!(&drained[0].payload[..], b"2");
/// assert_eq!(queue.dropped_count(), 1);
/// ```
#[derive(Debug)]
pub struct MessageQueue {
    messages: Mutex<VecDeque<Message>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl MessageQueue {
    /// Creates a queue holding at most `capacity` messages.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be greater than 0");
        Self {
            messages: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_QUEUE_CAPACITY))),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Appends a message, evicting the oldest one when full.
    ///
    /// Returns the evicted message, if any.
    pub fn push(&self, message: Message) -> Option<Message> {
        let mut messages = self.messages.lock();
        let evicted = if messages.len() >= self.capacity {
            messages.pop_front()
        } else {
            None
        };
        messages.push_back(message);
        drop(messages);

        if let Some(ref old) = evicted {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!("Message queue full, dropped message on {} ({} dropped so far)", old.topic, total);
        }
        evicted
    }

    /// Removes and returns every queued message in arrival order.
    pub fn drain(&self) -> Vec<Message> {
        self.messages.lock().drain(..).collect()
    }

    /// Total messages discarded by overflow since creation.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
