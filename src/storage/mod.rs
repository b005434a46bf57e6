//! Storage layer for Chorus
//!
//! Relational persistence is split into narrow capability traits, one per
//! record type. Each offers create, point-read and compare-and-set style
//! updates only; the router additionally needs find-or-create and the
//! cancellation path needs delete.

pub mod memory;

pub use memory::InMemoryStorage;

use crate::error::Result;
use crate::types::{
    Conversation, ConversationId, ConversationKind, CooldownKey, Cooldown, Entity, EntityId,
    Message, MessageId, ParticipantId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Rooms, private dyads and groups
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create a room explicitly
    async fn create_room(&self, participants: BTreeSet<ParticipantId>) -> Result<Conversation>;

    /// Point read; `ConversationNotFound` if absent or deleted
    async fn get_conversation(&self, id: ConversationId) -> Result<Conversation>;

    /// Resolve the private or group conversation for an exact participant set,
    /// creating it on first use. Atomic: concurrent callers get the same id.
    async fn find_or_create(
        &self,
        kind: ConversationKind,
        participants: BTreeSet<ParticipantId>,
    ) -> Result<Conversation>;

    /// Replace the participant set, bumping the membership version
    async fn update_participants(
        &self,
        id: ConversationId,
        participants: BTreeSet<ParticipantId>,
    ) -> Result<Conversation>;

    /// Delete a conversation with its message stream and cooldown entries
    async fn delete_conversation(&self, id: ConversationId) -> Result<()>;
}

/// Append-only message streams
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a committed message; fails if its conversation is gone
    async fn create_message(&self, message: &Message) -> Result<()>;

    async fn get_message(&self, id: MessageId) -> Result<Message>;

    /// Messages of a conversation in commit order
    async fn list_messages(&self, conversation: ConversationId) -> Result<Vec<Message>>;
}

/// Entity configuration
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn create_entity(&self, entity: &Entity) -> Result<()>;

    async fn get_entity(&self, id: EntityId) -> Result<Entity>;

    /// Replace the entity if its stored revision still equals
    /// `entity.revision`; returns the stored copy with the bumped revision.
    /// A newer stored revision yields `StaleWrite`.
    async fn update_entity(&self, entity: &Entity) -> Result<Entity>;
}

/// Per (entity, conversation) last-attempt entries
#[async_trait]
pub trait CooldownStore: Send + Sync {
    async fn get_cooldown(&self, key: CooldownKey) -> Result<Option<Cooldown>>;

    /// Write `new` only if the stored last-attempt timestamp equals `expected`
    /// (`None` meaning no entry yet). Returns whether the write happened.
    /// Fails with `ConversationNotFound` once the conversation is deleted.
    async fn compare_and_set_cooldown(
        &self,
        key: CooldownKey,
        expected: Option<DateTime<Utc>>,
        new: Cooldown,
    ) -> Result<bool>;
}

/// Everything the orchestrator needs from persistence
pub trait Storage: ConversationStore + MessageStore + EntityStore + CooldownStore {}

impl<T> Storage for T where T: ConversationStore + MessageStore + EntityStore + CooldownStore {}
