//! In-process storage backend
//!
//! Conversations and their message streams share one lock so that a message
//! can never be appended to a conversation that is concurrently deleted.
//! Cooldown writes hold that lock for reading, and deletion takes the tables
//! lock before the cooldown lock.

use super::{ConversationStore, CooldownStore, EntityStore, MessageStore};
use crate::clock::{Clock, SystemClock};
use crate::error::{ChorusError, Result};
use crate::types::{
    Conversation, ConversationId, ConversationKind, Cooldown, CooldownKey, Entity, EntityId,
    Message, MessageId, ParticipantId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

#[derive(Default)]
struct ConversationTables {
    conversations: HashMap<ConversationId, Conversation>,
    by_members: HashMap<(ConversationKind, BTreeSet<ParticipantId>), ConversationId>,
    streams: HashMap<ConversationId, Vec<MessageId>>,
    messages: HashMap<MessageId, Message>,
}

/// Storage backend keeping everything in memory
pub struct InMemoryStorage {
    clock: Arc<dyn Clock>,
    tables: RwLock<ConversationTables>,
    entities: RwLock<HashMap<EntityId, Entity>>,
    cooldowns: Mutex<HashMap<CooldownKey, Cooldown>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tables: RwLock::new(ConversationTables::default()),
            entities: RwLock::new(HashMap::new()),
            cooldowns: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStorage {
    async fn create_room(&self, participants: BTreeSet<ParticipantId>) -> Result<Conversation> {
        let conversation = Conversation::new(ConversationKind::Room, participants, self.clock.now());
        let mut tables = self.tables.write().await;
        tables.streams.insert(conversation.id, Vec::new());
        tables
            .conversations
            .insert(conversation.id, conversation.clone());
        debug!("Created room {}", conversation.id);
        Ok(conversation)
    }

    async fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.tables
            .read()
            .await
            .conversations
            .get(&id)
            .cloned()
            .ok_or(ChorusError::ConversationNotFound(id))
    }

    async fn find_or_create(
        &self,
        kind: ConversationKind,
        participants: BTreeSet<ParticipantId>,
    ) -> Result<Conversation> {
        if kind == ConversationKind::Room {
            return Err(ChorusError::InvalidTarget(
                "rooms are created explicitly".to_string(),
            ));
        }

        let mut tables = self.tables.write().await;
        let index_key = (kind, participants);
        if let Some(id) = tables.by_members.get(&index_key) {
            if let Some(existing) = tables.conversations.get(id) {
                return Ok(existing.clone());
            }
        }

        let conversation = Conversation::new(kind, index_key.1.clone(), self.clock.now());
        tables.by_members.insert(index_key, conversation.id);
        tables.streams.insert(conversation.id, Vec::new());
        tables
            .conversations
            .insert(conversation.id, conversation.clone());
        debug!("Created {} conversation {}", kind, conversation.id);
        Ok(conversation)
    }

    async fn update_participants(
        &self,
        id: ConversationId,
        participants: BTreeSet<ParticipantId>,
    ) -> Result<Conversation> {
        let mut tables = self.tables.write().await;
        let current = tables
            .conversations
            .get(&id)
            .cloned()
            .ok_or(ChorusError::ConversationNotFound(id))?;

        if current.kind != ConversationKind::Room {
            let new_key = (current.kind, participants.clone());
            if matches!(tables.by_members.get(&new_key), Some(other) if *other != id) {
                return Err(ChorusError::AlreadyExists(format!(
                    "{} conversation with the same participants",
                    current.kind
                )));
            }
            tables
                .by_members
                .remove(&(current.kind, current.participants.clone()));
            tables.by_members.insert(new_key, id);
        }

        let updated = Conversation {
            participants,
            membership_version: current.membership_version + 1,
            ..current
        };
        tables.conversations.insert(id, updated.clone());
        Ok(updated)
    }

    async fn delete_conversation(&self, id: ConversationId) -> Result<()> {
        let mut tables = self.tables.write().await;
        let removed = tables
            .conversations
            .remove(&id)
            .ok_or(ChorusError::ConversationNotFound(id))?;
        tables
            .by_members
            .remove(&(removed.kind, removed.participants));
        if let Some(stream) = tables.streams.remove(&id) {
            for message_id in stream {
                tables.messages.remove(&message_id);
            }
        }

        let mut cooldowns = self.cooldowns.lock().await;
        let before = cooldowns.len();
        cooldowns.retain(|key, _| key.conversation_id != id);
        debug!(
            cooldowns = before - cooldowns.len(),
            "Deleted conversation {}", id
        );
        Ok(())
    }
}

#[async_trait]
impl MessageStore for InMemoryStorage {
    async fn create_message(&self, message: &Message) -> Result<()> {
        let conversation_id = message.conversation_id();
        let mut tables = self.tables.write().await;
        if !tables.conversations.contains_key(&conversation_id) {
            return Err(ChorusError::ConversationNotFound(conversation_id));
        }
        if tables.messages.contains_key(&message.id) {
            return Err(ChorusError::AlreadyExists(format!("message {}", message.id)));
        }
        tables
            .streams
            .entry(conversation_id)
            .or_default()
            .push(message.id);
        tables.messages.insert(message.id, message.clone());
        Ok(())
    }

    async fn get_message(&self, id: MessageId) -> Result<Message> {
        self.tables
            .read()
            .await
            .messages
            .get(&id)
            .cloned()
            .ok_or(ChorusError::MessageNotFound(id))
    }

    async fn list_messages(&self, conversation: ConversationId) -> Result<Vec<Message>> {
        let tables = self.tables.read().await;
        let stream = tables
            .streams
            .get(&conversation)
            .ok_or(ChorusError::ConversationNotFound(conversation))?;
        Ok(stream
            .iter()
            .filter_map(|id| tables.messages.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl EntityStore for InMemoryStorage {
    async fn create_entity(&self, entity: &Entity) -> Result<()> {
        let mut entities = self.entities.write().await;
        if entities.contains_key(&entity.id) {
            return Err(ChorusError::AlreadyExists(format!("entity {}", entity.id)));
        }
        entities.insert(entity.id, entity.clone());
        Ok(())
    }

    async fn get_entity(&self, id: EntityId) -> Result<Entity> {
        self.entities
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ChorusError::EntityNotFound(id))
    }

    async fn update_entity(&self, entity: &Entity) -> Result<Entity> {
        let mut entities = self.entities.write().await;
        let slot = entities
            .get_mut(&entity.id)
            .ok_or(ChorusError::EntityNotFound(entity.id))?;
        if slot.revision != entity.revision {
            return Err(ChorusError::StaleWrite(format!(
                "entity {} is at revision {}, update was based on {}",
                entity.id, slot.revision, entity.revision
            )));
        }

        *slot = Entity {
            revision: entity.revision + 1,
            ..entity.clone()
        };
        Ok(slot.clone())
    }
}

#[async_trait]
impl CooldownStore for InMemoryStorage {
    async fn get_cooldown(&self, key: CooldownKey) -> Result<Option<Cooldown>> {
        Ok(self.cooldowns.lock().await.get(&key).copied())
    }

    async fn compare_and_set_cooldown(
        &self,
        key: CooldownKey,
        expected: Option<DateTime<Utc>>,
        new: Cooldown,
    ) -> Result<bool> {
        let tables = self.tables.read().await;
        if !tables.conversations.contains_key(&key.conversation_id) {
            return Err(ChorusError::ConversationNotFound(key.conversation_id));
        }

        let mut cooldowns = self.cooldowns.lock().await;
        let current = cooldowns.get(&key).map(|c| c.last_attempt);
        if current != expected {
            return Ok(false);
        }
        cooldowns.insert(key, new);
        Ok(true)
    }
}
