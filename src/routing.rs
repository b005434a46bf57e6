//! Message routing
//!
//! Classifies a draft's single delivery target and resolves the
//! conversation plus its current recipients. Private and group
//! conversations are created on first use; rooms must already exist.

use crate::error::{ChorusError, Result};
use crate::storage::ConversationStore;
use crate::types::{
    Conversation, ConversationId, ConversationKind, MessageDraft, ParticipantId, RoutingTarget,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// The one target a valid draft asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetRequest {
    Room(ConversationId),
    Private(ParticipantId),
    Group(Vec<ParticipantId>),
}

/// A resolved delivery
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub conversation: Conversation,
    pub target: RoutingTarget,
    /// Every current participant, humans and entities
    pub recipients: Vec<ParticipantId>,
}

pub struct MessageRouter<S: ?Sized> {
    store: Arc<S>,
}

impl<S> MessageRouter<S>
where
    S: ConversationStore + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Check that exactly one target is populated
    pub fn classify(draft: &MessageDraft) -> Result<TargetRequest> {
        match (&draft.room, &draft.private_peer, &draft.group_members) {
            (Some(room), None, None) => Ok(TargetRequest::Room(*room)),
            (None, Some(peer), None) => Ok(TargetRequest::Private(*peer)),
            (None, None, Some(members)) => Ok(TargetRequest::Group(members.clone())),
            _ => Err(ChorusError::RoutingConflict {
                populated: draft.populated_targets(),
            }),
        }
    }

    /// Resolve (or create) the conversation a draft is delivered to
    pub async fn route(&self, draft: &MessageDraft) -> Result<Route> {
        let conversation = match Self::classify(draft)? {
            TargetRequest::Room(id) => self.store.get_conversation(id).await?,
            TargetRequest::Private(peer) => {
                if peer == draft.author {
                    return Err(ChorusError::InvalidTarget(
                        "private peer must differ from the author".to_string(),
                    ));
                }
                let participants: BTreeSet<_> = [draft.author, peer].into_iter().collect();
                self.store
                    .find_or_create(ConversationKind::Private, participants)
                    .await?
            }
            TargetRequest::Group(members) => {
                let mut participants: BTreeSet<_> = members.into_iter().collect();
                participants.insert(draft.author);
                if participants.len() < 2 {
                    return Err(ChorusError::InvalidTarget(
                        "a group needs at least two distinct participants".to_string(),
                    ));
                }
                self.store
                    .find_or_create(ConversationKind::Group, participants)
                    .await?
            }
        };

        debug!(
            conversation_id = %conversation.id,
            kind = %conversation.kind,
            recipients = conversation.participants.len(),
            "Routed message"
        );

        Ok(Route {
            target: conversation.target(),
            recipients: conversation.participants.iter().copied().collect(),
            conversation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::types::{EntityId, UserId};
    use proptest::prelude::*;

    fn human() -> ParticipantId {
        ParticipantId::Human(UserId::new())
    }

    fn router() -> (MessageRouter<InMemoryStorage>, Arc<InMemoryStorage>) {
        let store = Arc::new(InMemoryStorage::new());
        (MessageRouter::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_room_must_exist() {
        let (router, store) = router();
        let author = human();

        let missing = MessageDraft::new(author, "alice", "hi").in_room(ConversationId::new());
        assert!(matches!(
            router.route(&missing).await,
            Err(ChorusError::ConversationNotFound(_))
        ));

        let sage = ParticipantId::Entity(EntityId::new());
        let room = store.create_room([author, sage].into_iter().collect()).await.unwrap();
        let route = router
            .route(&MessageDraft::new(author, "alice", "hi").in_room(room.id))
            .await
            .unwrap();
        assert_eq!(route.target, RoutingTarget::Room(room.id));
        assert_eq!(route.recipients.len(), 2);
    }

    #[tokio::test]
    async fn test_private_conversation_reused() {
        let (router, _) = router();
        let (alice, bob) = (human(), human());

        let first = router
            .route(&MessageDraft::new(alice, "alice", "hi bob").to_peer(bob))
            .await
            .unwrap();
        let reply = router
            .route(&MessageDraft::new(bob, "bob", "hi alice").to_peer(alice))
            .await
            .unwrap();

        assert_eq!(first.conversation.id, reply.conversation.id);
        assert_eq!(first.target, RoutingTarget::Private(first.conversation.id));
    }

    #[tokio::test]
    async fn test_invalid_private_and_group_targets() {
        let (router, _) = router();
        let alice = human();

        let to_self = MessageDraft::new(alice, "alice", "note to self").to_peer(alice);
        assert!(matches!(
            router.route(&to_self).await,
            Err(ChorusError::InvalidTarget(_))
        ));

        let lonely = MessageDraft::new(alice, "alice", "anyone?").to_group(vec![alice]);
        assert!(matches!(
            router.route(&lonely).await,
            Err(ChorusError::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn test_group_includes_author() {
        let (router, _) = router();
        let (alice, bob) = (human(), human());
        let sage = ParticipantId::Entity(EntityId::new());

        let route = router
            .route(&MessageDraft::new(alice, "alice", "hi all").to_group(vec![bob, sage]))
            .await
            .unwrap();

        assert_eq!(route.conversation.kind, ConversationKind::Group);
        assert!(route.recipients.contains(&alice));
        assert_eq!(route.conversation.entity_ids().len(), 1);
    }

    proptest! {
        #[test]
        fn prop_exactly_one_target_routes(
            room in any::<bool>(),
            peer in any::<bool>(),
            group in any::<bool>(),
        ) {
            let author = human();
            let mut draft = MessageDraft::new(author, "alice", "hi");
            if room {
                draft = draft.in_room(ConversationId::new());
            }
            if peer {
                draft = draft.to_peer(human());
            }
            if group {
                draft = draft.to_group(vec![human()]);
            }

            let populated = [room, peer, group].iter().filter(|b| **b).count();
            let result = MessageRouter::<InMemoryStorage>::classify(&draft);
            if populated == 1 {
                prop_assert!(result.is_ok());
            } else {
                let is_conflict = matches!(
                    result,
                    Err(ChorusError::RoutingConflict { populated: p }) if p == populated
                );
                prop_assert!(is_conflict);
            }
        }
    }
}
