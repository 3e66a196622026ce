//! Single-process pub/sub for document lifecycle events.
//!
//! Topics are strings: `document` carries every event, and
//! `document:<user_id>` carries one user's events for SSE fan-out.
//! Each subscriber owns a bounded channel; publishing never blocks —
//! when a subscriber's buffer is full the event is dropped for that
//! subscriber and logged. Progress events are advisory; terminal state
//! lives in the document store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::document::DocumentSnapshot;

/// Per-subscriber channel capacity.
const SUBSCRIBER_BUFFER: usize = 32;

/// Soft cap on subscribers per topic.
const MAX_SUBSCRIBERS_PER_TOPIC: usize = 128;

/// The topic carrying all document events.
pub const TOPIC_ALL: &str = "document";

/// The per-user topic name.
pub fn user_topic(user_id: &str) -> String {
    format!("document:{user_id}")
}

/// What happened to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Updated,
    Processing,
    Completed,
    Failed,
    Deleted,
}

impl EventKind {
    /// The SSE event type string, e.g. `document.completed`.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Created => "document.created",
            Self::Updated => "document.updated",
            Self::Processing => "document.processing",
            Self::Completed => "document.completed",
            Self::Failed => "document.failed",
            Self::Deleted => "document.deleted",
        }
    }
}

/// An ephemeral document event, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentEvent {
    pub kind: EventKind,
    pub user_id: String,
    pub document: DocumentSnapshot,
    /// ISO 8601 emission timestamp.
    pub timestamp: String,
}

impl DocumentEvent {
    /// Build an event stamped with the current time.
    pub fn now(kind: EventKind, user_id: impl Into<String>, document: DocumentSnapshot) -> Self {
        Self {
            kind,
            user_id: user_id.into(),
            document,
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }
    }
}

struct Registration {
    id: u64,
    tx: mpsc::Sender<DocumentEvent>,
}

/// Topic-keyed fan-out over bounded channels.
pub struct EventBus {
    topics: Mutex<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Subscribe to a topic.
    ///
    /// Returns `None` when the topic already carries the maximum
    /// number of subscribers. The subscription unsubscribes itself on
    /// drop.
    pub fn subscribe(self: &Arc<Self>, topic: &str) -> Option<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut topics = self.topics.lock().expect("bus lock");
        let registrations = topics.entry(topic.to_string()).or_default();
        if registrations.len() >= MAX_SUBSCRIBERS_PER_TOPIC {
            tracing::warn!(topic, "subscriber cap reached, rejecting subscription");
            return None;
        }
        registrations.push(Registration { id, tx });
        drop(topics);

        Some(Subscription {
            bus: Arc::clone(self),
            topic: topic.to_string(),
            id,
            rx,
        })
    }

    /// Publish an event to the global topic and the owner's topic.
    ///
    /// Non-blocking: a subscriber whose buffer is full loses this
    /// event (with a warn log) rather than stalling the publisher.
    pub fn publish(&self, event: &DocumentEvent) {
        self.publish_to(TOPIC_ALL, event);
        self.publish_to(&user_topic(&event.user_id), event);
    }

    fn publish_to(&self, topic: &str, event: &DocumentEvent) {
        let mut topics = self.topics.lock().expect("bus lock");
        let Some(registrations) = topics.get_mut(topic) else {
            return;
        };
        registrations.retain(|registration| {
            match registration.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        topic,
                        subscriber = registration.id,
                        kind = event.kind.event_type(),
                        "subscriber buffer full, dropping event",
                    );
                    true
                }
                // Receiver gone; prune the registration.
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn unsubscribe(&self, topic: &str, id: u64) {
        let mut topics = self.topics.lock().expect("bus lock");
        if let Some(registrations) = topics.get_mut(topic) {
            registrations.retain(|r| r.id != id);
            if registrations.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Number of live subscribers on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .expect("bus lock")
            .get(topic)
            .map_or(0, Vec::len)
    }
}

/// A live subscription; dropping it unsubscribes.
pub struct Subscription {
    bus: Arc<EventBus>,
    topic: String,
    id: u64,
    rx: mpsc::Receiver<DocumentEvent>,
}

impl Subscription {
    /// Receive the next event; `None` when the bus is gone.
    pub async fn recv(&mut self) -> Option<DocumentEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive for draining in tests.
    pub fn try_recv(&mut self) -> Option<DocumentEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.topic, self.id);
    }
}
