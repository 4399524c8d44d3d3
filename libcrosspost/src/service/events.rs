//! Progress events for publish records
//!
//! Built on `tokio::sync::broadcast`: emitting never blocks, events are
//! dropped when nobody listens, and a lagging subscriber loses the oldest
//! events rather than slowing down dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{ErrorKind, OutcomeStatus, PublishStatus};

pub type EventReceiver = broadcast::Receiver<Event>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer before lagging kicks in
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // Err only means there are no receivers right now
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    PublishScheduled {
        record_id: String,
        at: DateTime<Utc>,
    },

    PublishStarted {
        record_id: String,
        targets: Vec<String>,
    },

    /// One publish attempt against one target finished
    TargetAttempted {
        record_id: String,
        platform: String,
        attempt: u32,
        status: OutcomeStatus,
        error_kind: Option<ErrorKind>,
        terminal: bool,
    },

    PublishFinished {
        record_id: String,
        status: PublishStatus,
    },

    PublishCancelled {
        record_id: String,
    },
}

impl Event {
    pub fn record_id(&self) -> &str {
        match self {
            Event::PublishScheduled { record_id, .. }
            | Event::PublishStarted { record_id, .. }
            | Event::TargetAttempted { record_id, .. }
            | Event::PublishFinished { record_id, .. }
            | Event::PublishCancelled { record_id } => record_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe();

        bus.emit(Event::PublishCancelled {
            record_id: "r1".to_string(),
        });

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.record_id(), "r1");
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(Event::PublishStarted {
            record_id: "r1".to_string(),
            targets: vec!["facebook".to_string()],
        });
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new(10);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(Event::PublishFinished {
            record_id: "r1".to_string(),
            status: PublishStatus::Published,
        });

        assert_eq!(first.recv().await.unwrap(), second.recv().await.unwrap());
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::TargetAttempted {
            record_id: "r1".to_string(),
            platform: "youtube".to_string(),
            attempt: 2,
            status: OutcomeStatus::Error,
            error_kind: Some(ErrorKind::RateLimited),
            terminal: false,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"target_attempted""#));
        assert!(json.contains(r#""error_kind":"rate_limited""#));
    }
}
