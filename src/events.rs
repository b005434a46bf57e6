//! Broadcast events
//!
//! Best-effort fan-out of committed messages and turn outcomes to whoever
//! is listening (delivery transports, the CLI). Sending with no subscribers
//! is not an error for the pipeline.

use crate::types::{ConversationId, EntityId, Message, MessageId, ParticipantId, RecordId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Event type discriminant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    /// A human or entity message was committed
    MessagePosted {
        conversation_id: ConversationId,
        message: Message,
        recipients: Vec<ParticipantId>,
        timestamp: DateTime<Utc>,
    },
    /// An entity turn ended without a message (cooldown, missing entity)
    TurnSkipped {
        entity_id: EntityId,
        conversation_id: ConversationId,
        trigger: MessageId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// An entity turn failed
    TurnFailed {
        entity_id: EntityId,
        conversation_id: ConversationId,
        trigger: MessageId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// Short-term turns were folded into a long-term record
    MemoryCompacted {
        conversation_id: ConversationId,
        record_id: RecordId,
        evicted: usize,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event ID (for deduplication)
    pub id: String,
    #[serde(flatten)]
    pub event_type: EventType,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
        }
    }

    pub fn message_posted(message: Message, recipients: Vec<ParticipantId>) -> Self {
        Self::new(EventType::MessagePosted {
            conversation_id: message.conversation_id(),
            message,
            recipients,
            timestamp: Utc::now(),
        })
    }

    pub fn turn_skipped(
        entity_id: EntityId,
        conversation_id: ConversationId,
        trigger: MessageId,
        reason: String,
    ) -> Self {
        Self::new(EventType::TurnSkipped {
            entity_id,
            conversation_id,
            trigger,
            reason,
            timestamp: Utc::now(),
        })
    }

    pub fn turn_failed(
        entity_id: EntityId,
        conversation_id: ConversationId,
        trigger: MessageId,
        error: String,
    ) -> Self {
        Self::new(EventType::TurnFailed {
            entity_id,
            conversation_id,
            trigger,
            error,
            timestamp: Utc::now(),
        })
    }

    pub fn memory_compacted(conversation_id: ConversationId, record_id: RecordId, evicted: usize) -> Self {
        Self::new(EventType::MemoryCompacted {
            conversation_id,
            record_id,
            evicted,
            timestamp: Utc::now(),
        })
    }

    pub fn conversation_id(&self) -> ConversationId {
        match &self.event_type {
            EventType::MessagePosted { conversation_id, .. }
            | EventType::TurnSkipped { conversation_id, .. }
            | EventType::TurnFailed { conversation_id, .. }
            | EventType::MemoryCompacted { conversation_id, .. } => *conversation_id,
        }
    }
}

pub struct EventBroadcaster {
    tx: broadcast::Sender<Event>,
}

impl EventBroadcaster {
    /// Create new broadcaster with channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to all current subscribers; returns how many received it
    pub fn broadcast(&self, event: Event) -> usize {
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!("Event dropped: no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(1000) // Default capacity: 1000 events
    }
}
