//! Topic Queues
//!
//! Per-topic bounded FIFO queues and the registry that maps topic names to
//! them.
//!
//! # Design
//!
//! Each topic owns an independent queue so consumers read at their own pace.
//! Queues are bounded; when a queue is full the oldest pending message is
//! discarded to make room for the newest one, so a slow consumer always
//! sees the most recent data. Every discard is counted.
//!
//! Order within a topic is wire-arrival order. No order is kept across
//! topics.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::Notify;

/// Default number of pending messages kept per topic.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

// =============================================================================
// Topic Queue
// =============================================================================

/// Result of pushing a message onto a [`TopicQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Message was queued with room to spare.
    Queued,
    /// Queue was full; the oldest message was discarded.
    DroppedOldest,
}

/// Bounded FIFO of pending messages for one topic.
#[derive(Debug)]
pub struct TopicQueue {
    name: String,
    capacity: usize,
    pending: Mutex<VecDeque<Value>>,
    notify: Notify,
    subscribed: AtomicBool,
    dropped: AtomicU64,
}

impl TopicQueue {
    /// Create an empty queue. A capacity of zero is raised to one.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            pending: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            subscribed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Get the topic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a message, discarding the oldest one if full.
    pub fn push(&self, message: Value) -> PushOutcome {
        let outcome = {
            let mut pending = self.pending.lock();
            let outcome = if pending.len() >= self.capacity {
                pending.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            pending.push_back(message);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Take the oldest pending message, if any.
    pub fn try_pop(&self) -> Option<Value> {
        self.pending.lock().pop_front()
    }

    /// Wait for the next message.
    ///
    /// Callers bound this with a timeout; it never resolves on its own
    /// without a message.
    pub async fn pop(&self) -> Value {
        loop {
            if let Some(message) = self.try_pop() {
                return message;
            }
            self.notify.notified().await;
        }
    }

    /// Discard every pending message, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        pending.clear();
        count
    }

    /// Number of pending messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Check if no messages are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Check if the topic is subscribed on the wire.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    fn set_subscribed(&self, subscribed: bool) -> bool {
        self.subscribed.swap(subscribed, Ordering::SeqCst)
    }

    /// Messages discarded because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Snapshot of this queue's counters.
    #[must_use]
    pub fn stats(&self) -> TopicStats {
        TopicStats {
            topic: self.name.clone(),
            pending: self.len(),
            dropped: self.dropped(),
            subscribed: self.is_subscribed(),
        }
    }
}

/// Counters for one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicStats {
    /// Topic name.
    pub topic: String,
    /// Messages waiting to be received.
    pub pending: usize,
    /// Messages discarded by the drop-oldest policy.
    pub dropped: u64,
    /// Whether the topic is replayed on reconnect.
    pub subscribed: bool,
}

// =============================================================================
// Topic Registry
// =============================================================================

/// Result of routing a message to a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Message was queued.
    Delivered,
    /// Message was queued after discarding the topic's oldest message.
    DroppedOldest,
    /// No queue exists for the topic; the message was discarded.
    UnknownTopic,
}

impl From<PushOutcome> for DeliveryOutcome {
    fn from(outcome: PushOutcome) -> Self {
        match outcome {
            PushOutcome::Queued => Self::Delivered,
            PushOutcome::DroppedOldest => Self::DroppedOldest,
        }
    }
}

/// Maps topic names to their queues.
///
/// A topic is either *subscribed* (replayed on every reconnect) or merely
/// *registered* (a queue exists, e.g. for a snapshot request or a consumer
/// waiting ahead of its subscription).
///
/// Every subscribe or remove bumps a revision number under the registry
/// lock. A [`ReplaySet`] records the revision it was taken at, so a change
/// can be checked against a snapshot: a change at or below the snapshot's
/// revision is already reflected in it.
#[derive(Debug)]
pub struct TopicRegistry {
    capacity: usize,
    topics: RwLock<BTreeMap<String, Arc<TopicQueue>>>,
    revision: AtomicU64,
}

/// Outcome of a subscribe or remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change {
    /// Whether the registry changed (newly subscribed, or was registered).
    pub changed: bool,
    /// Pending messages discarded by a remove.
    pub discarded: usize,
    /// Registry revision this change produced.
    pub revision: u64,
}

/// Subscribed topics as of one registry revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySet {
    /// Topic names, in name order.
    pub topics: Vec<String>,
    /// Revision the snapshot reflects.
    pub revision: u64,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl TopicRegistry {
    /// Create an empty registry whose queues hold `capacity` messages.
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            topics: RwLock::new(BTreeMap::new()),
            revision: AtomicU64::new(0),
        }
    }

    fn bump(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Get the queue for `topic`, creating an unsubscribed one if absent.
    pub fn ensure(&self, topic: &str) -> Arc<TopicQueue> {
        if let Some(queue) = self.topics.read().get(topic) {
            return Arc::clone(queue);
        }
        let mut topics = self.topics.write();
        Arc::clone(
            topics
                .entry(topic.to_owned())
                .or_insert_with(|| Arc::new(TopicQueue::new(topic, self.capacity))),
        )
    }

    /// Mark `topic` subscribed, creating its queue if needed.
    ///
    /// `changed` is `true` if the topic was not subscribed before.
    pub fn subscribe(&self, topic: &str) -> Change {
        let mut topics = self.topics.write();
        let queue = topics
            .entry(topic.to_owned())
            .or_insert_with(|| Arc::new(TopicQueue::new(topic, self.capacity)));
        Change {
            changed: !queue.set_subscribed(true),
            discarded: 0,
            revision: self.bump(),
        }
    }

    /// Remove `topic` and discard its pending messages.
    ///
    /// `changed` is `false` if the topic was not registered.
    pub fn remove(&self, topic: &str) -> Change {
        let mut topics = self.topics.write();
        let removed = topics.remove(topic);
        let revision = self.bump();
        drop(topics);
        let discarded = removed.as_ref().map_or(0, |queue| {
            queue.set_subscribed(false);
            queue.clear()
        });
        Change {
            changed: removed.is_some(),
            discarded,
            revision,
        }
    }

    /// Drop `topic` if nothing needs its queue any more.
    ///
    /// A queue is kept while it is subscribed, holds messages, or is held
    /// outside the registry. Returns `true` if the queue was dropped.
    pub fn release(&self, topic: &str) -> bool {
        let mut topics = self.topics.write();
        let idle = topics.get(topic).is_some_and(|queue| {
            !queue.is_subscribed() && queue.is_empty() && Arc::strong_count(queue) == 1
        });
        if idle {
            topics.remove(topic);
        }
        idle
    }

    /// Get the queue for `topic` if registered.
    #[must_use]
    pub fn get(&self, topic: &str) -> Option<Arc<TopicQueue>> {
        self.topics.read().get(topic).cloned()
    }

    /// Route a message to a registered topic.
    pub fn deliver(&self, topic: &str, message: Value) -> DeliveryOutcome {
        self.get(topic)
            .map_or(DeliveryOutcome::UnknownTopic, |queue| {
                queue.push(message).into()
            })
    }

    /// Route a message, creating the topic's queue on demand.
    pub fn deliver_or_register(&self, topic: &str, message: Value) -> DeliveryOutcome {
        self.ensure(topic).push(message).into()
    }

    /// Topics to replay on reconnect, in name order.
    #[must_use]
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.replay_set().topics
    }

    /// Subscribed topics together with the revision they reflect.
    #[must_use]
    pub fn replay_set(&self) -> ReplaySet {
        let topics = self.topics.read();
        ReplaySet {
            topics: topics
                .values()
                .filter(|queue| queue.is_subscribed())
                .map(|queue| queue.name().to_owned())
                .collect(),
            revision: self.revision.load(Ordering::SeqCst),
        }
    }

    /// Check whether `topic` is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.get(topic).is_some_and(|queue| queue.is_subscribed())
    }

    /// Number of registered topics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.topics.read().len()
    }

    /// Check if no topics are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topics.read().is_empty()
    }

    /// Counters for every registered topic, in name order.
    #[must_use]
    pub fn stats(&self) -> Vec<TopicStats> {
        self.topics.read().values().map(|q| q.stats()).collect()
    }
}
