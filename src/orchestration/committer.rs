//! Turn committer
//!
//! Persists a generated reply, feeds it to the conversation's short-term
//! window and broadcasts it to the participants current at that point. A
//! conversation deleted while the job was in flight, up to and including
//! the window append, turns the reply into a discard.

use crate::clock::Clock;
use crate::error::ChorusError;
use crate::events::{Event, EventBroadcaster};
use crate::memory::MemoryStore;
use crate::orchestration::compaction::feed_window;
use crate::orchestration::job::FailureReason;
use crate::storage::{ConversationStore, MessageStore};
use crate::types::{Entity, Message, MessageId, ParticipantId, ShortTermTurn};
use std::sync::Arc;
use tracing::{debug, info};

pub struct TurnCommitter<S: ?Sized> {
    store: Arc<S>,
    memory: Arc<MemoryStore>,
    events: Arc<EventBroadcaster>,
    clock: Arc<dyn Clock>,
}

impl<S> TurnCommitter<S>
where
    S: ConversationStore + MessageStore + ?Sized,
{
    pub fn new(
        store: Arc<S>,
        memory: Arc<MemoryStore>,
        events: Arc<EventBroadcaster>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            memory,
            events,
            clock,
        }
    }

    /// Commit `text` as `entity`'s reply to `trigger`
    pub async fn commit(
        &self,
        entity: &Entity,
        trigger: &Message,
        text: String,
    ) -> Result<Message, FailureReason> {
        let conversation_id = trigger.conversation_id();
        let conversation = match self.store.get_conversation(conversation_id).await {
            Ok(conversation) => conversation,
            Err(ChorusError::ConversationNotFound(_)) => {
                info!(
                    entity_id = %entity.id,
                    conversation_id = %conversation_id,
                    "Conversation deleted mid-turn, discarding reply"
                );
                return Err(FailureReason::ConversationDeleted);
            }
            Err(e) => return Err(FailureReason::Persistence(e.to_string())),
        };

        let message = Message {
            id: MessageId::new(),
            author: ParticipantId::Entity(entity.id),
            author_name: entity.handle.clone(),
            text,
            created_at: self.clock.now(),
            target: conversation.target(),
            in_reply_to: Some(trigger.id),
            addressees: Vec::new(),
        };

        match self.store.create_message(&message).await {
            Ok(()) => {}
            Err(ChorusError::ConversationNotFound(_)) => {
                info!(
                    entity_id = %entity.id,
                    conversation_id = %conversation_id,
                    "Conversation deleted before persist, discarding reply"
                );
                return Err(FailureReason::ConversationDeleted);
            }
            Err(e) => return Err(FailureReason::Persistence(e.to_string())),
        }

        match feed_window(
            &self.memory,
            &self.events,
            conversation_id,
            ShortTermTurn::from(&message),
        )
        .await
        {
            Ok(()) => {}
            Err(ChorusError::ConversationNotFound(_)) => {
                info!(
                    entity_id = %entity.id,
                    conversation_id = %conversation_id,
                    "Conversation deleted after persist, discarding reply"
                );
                return Err(FailureReason::ConversationDeleted);
            }
            Err(e) => return Err(FailureReason::Persistence(e.to_string())),
        }

        let recipients: Vec<ParticipantId> = match self.store.get_conversation(conversation_id).await {
            Ok(current) => current.participants.into_iter().collect(),
            Err(ChorusError::ConversationNotFound(_)) => {
                info!(
                    entity_id = %entity.id,
                    conversation_id = %conversation_id,
                    "Conversation deleted before broadcast, discarding reply"
                );
                return Err(FailureReason::ConversationDeleted);
            }
            Err(e) => return Err(FailureReason::Persistence(e.to_string())),
        };
        let delivered = self
            .events
            .broadcast(Event::message_posted(message.clone(), recipients));
        debug!(
            message_id = %message.id,
            entity_id = %entity.id,
            subscribers = delivered,
            "Committed entity reply"
        );

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::{KeywordConfig, MemoryConfig};
    use crate::events::EventType;
    use crate::memory::InMemoryVectorIndex;
    use crate::services::HashingEmbedder;
    use crate::error::Result;
    use crate::storage::InMemoryStorage;
    use crate::types::{
        Conversation, ConversationId, ConversationKind, MessageDraft, ResponseStrategy,
        RoutingTarget, UserId,
    };
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    /// Deletes a conversation the moment a reply has been persisted into it
    struct DeleteAfterPersist {
        inner: Arc<InMemoryStorage>,
        memory: Arc<MemoryStore>,
    }

    #[async_trait]
    impl ConversationStore for DeleteAfterPersist {
        async fn create_room(&self, participants: BTreeSet<ParticipantId>) -> Result<Conversation> {
            self.inner.create_room(participants).await
        }

        async fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
            self.inner.get_conversation(id).await
        }

        async fn find_or_create(
            &self,
            kind: ConversationKind,
            participants: BTreeSet<ParticipantId>,
        ) -> Result<Conversation> {
            self.inner.find_or_create(kind, participants).await
        }

        async fn update_participants(
            &self,
            id: ConversationId,
            participants: BTreeSet<ParticipantId>,
        ) -> Result<Conversation> {
            self.inner.update_participants(id, participants).await
        }

        async fn delete_conversation(&self, id: ConversationId) -> Result<()> {
            self.inner.delete_conversation(id).await
        }
    }

    #[async_trait]
    impl MessageStore for DeleteAfterPersist {
        async fn create_message(&self, message: &Message) -> Result<()> {
            self.inner.create_message(message).await?;
            self.inner.delete_conversation(message.conversation_id()).await?;
            self.memory.forget_conversation(message.conversation_id()).await;
            Ok(())
        }

        async fn get_message(&self, id: MessageId) -> Result<Message> {
            self.inner.get_message(id).await
        }

        async fn list_messages(&self, conversation: ConversationId) -> Result<Vec<Message>> {
            self.inner.list_messages(conversation).await
        }
    }

    struct Fixture {
        store: Arc<InMemoryStorage>,
        memory: Arc<MemoryStore>,
        events: Arc<EventBroadcaster>,
        committer: TurnCommitter<InMemoryStorage>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStorage::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let memory = Arc::new(MemoryStore::new(
            MemoryConfig::default(),
            KeywordConfig::default(),
            Arc::new(InMemoryVectorIndex::new(64)),
            Arc::new(HashingEmbedder::new(64)),
            clock.clone(),
        ));
        let events = Arc::new(EventBroadcaster::new(16));
        let committer = TurnCommitter::new(store.clone(), memory.clone(), events.clone(), clock);
        Fixture {
            store,
            memory,
            events,
            committer,
        }
    }

    async fn room_trigger(store: &InMemoryStorage, entity: &Entity) -> Message {
        let alice = ParticipantId::Human(UserId::new());
        let room = store
            .create_room([alice, entity.participant_id()].into_iter().collect())
            .await
            .unwrap();
        let message = Message::from_draft(
            MessageDraft::new(alice, "alice", "Hey Sage").in_room(room.id),
            RoutingTarget::Room(room.id),
            chrono::Utc::now(),
        );
        store.create_message(&message).await.unwrap();
        message
    }

    #[tokio::test]
    async fn test_commit_persists_and_broadcasts() {
        let f = fixture();
        let sage = Entity::new("Sage", ResponseStrategy::MentionOnly);
        let trigger = room_trigger(&f.store, &sage).await;
        let mut rx = f.events.subscribe();

        let reply = f
            .committer
            .commit(&sage, &trigger, "Hello alice".to_string())
            .await
            .unwrap();

        assert_eq!(reply.in_reply_to, Some(trigger.id));
        assert_eq!(reply.target, trigger.target);
        assert!(reply.is_authored_by(sage.id));
        assert_eq!(f.store.get_message(reply.id).await.unwrap(), reply);

        let window = f.memory.window(trigger.conversation_id()).await;
        assert_eq!(window.last().unwrap().message_id, reply.id);

        match rx.recv().await.unwrap().event_type {
            EventType::MessagePosted { message, recipients, .. } => {
                assert_eq!(message.id, reply.id);
                assert_eq!(recipients.len(), 2);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deleted_conversation_discards_reply() {
        let f = fixture();
        let sage = Entity::new("Sage", ResponseStrategy::MentionOnly);
        let trigger = room_trigger(&f.store, &sage).await;
        f.store.delete_conversation(trigger.conversation_id()).await.unwrap();

        let result = f.committer.commit(&sage, &trigger, "too late".to_string()).await;

        assert_eq!(result, Err(FailureReason::ConversationDeleted));
        assert!(f.memory.window(trigger.conversation_id()).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_racing_the_window_append_discards_reply() {
        let f = fixture();
        let sage = Entity::new("Sage", ResponseStrategy::MentionOnly);
        let trigger = room_trigger(&f.store, &sage).await;
        let conversation_id = trigger.conversation_id();
        let racing = TurnCommitter::new(
            Arc::new(DeleteAfterPersist {
                inner: f.store.clone(),
                memory: f.memory.clone(),
            }),
            f.memory.clone(),
            f.events.clone(),
            Arc::new(SystemClock),
        );
        let mut rx = f.events.subscribe();

        let result = racing.commit(&sage, &trigger, "too late".to_string()).await;

        assert_eq!(result, Err(FailureReason::ConversationDeleted));
        assert!(f.memory.window(conversation_id).await.is_empty());
        // A later append must not bring the window back
        assert!(f
            .memory
            .append_turn(conversation_id, ShortTermTurn::from(&trigger))
            .await
            .is_err());
        assert!(f.memory.window(conversation_id).await.is_empty());
        assert!(rx.try_recv().is_err());
    }
}
