//! Named-topic publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.
//!
//! Topics are plain strings (`"scan"`, `"sonar/front"`, …), created lazily
//! on first publish or subscribe.  Each topic owns an independent channel.
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | input scan topic | [`EventPayload::Scan`][rangefuse_types::EventPayload::Scan] from the primary scanner |
//! | one topic per sensor | [`EventPayload::Range`][rangefuse_types::EventPayload::Range] readings |
//! | [`TF_TOPIC`] | [`EventPayload::Transform`][rangefuse_types::EventPayload::Transform] frame updates |
//! | output scan topic | fused [`EventPayload::Scan`][rangefuse_types::EventPayload::Scan] |

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use rangefuse_types::{Event, FuseError};
use tokio::sync::broadcast;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Topic carrying live frame-tree updates.
pub const TF_TOPIC: &str = "tf";

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<Event>>>>,
    capacity: usize,
}

impl EventBus {
    /// Create a new bus with the given per-topic channel capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Publish `event` to `topic`.
    ///
    /// Returns the number of active receivers that were handed the event.
    ///
    /// # Errors
    ///
    /// Returns [`FuseError::Channel`] when nobody is subscribed to `topic`.
    pub fn publish_to(&self, topic: &str, event: Event) -> Result<usize, FuseError> {
        self.sender(topic)
            .send(event)
            .map_err(|_| FuseError::Channel(format!("No subscribers for topic {topic:?}")))
    }

    /// Subscribe to `topic`.  Only events published after this call are
    /// delivered.
    pub fn subscribe_to(&self, topic: &str) -> TopicReceiver {
        TopicReceiver {
            topic: topic.to_string(),
            receiver: self.sender(topic).subscribe(),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Event> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single topic.
///
/// Obtained via [`EventBus::subscribe_to`].
#[derive(Debug)]
pub struct TopicReceiver {
    topic: String,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.  The caller decides whether to
    ///   continue or abort.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Take the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// The topic this receiver is bound to.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}
