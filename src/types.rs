//! Core data types for the Chorus orchestration pipeline
//!
//! This module defines the fundamental data structures shared by routing,
//! memory and orchestration: identifiers, participants, messages,
//! conversations, entities, memory records and cooldown entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse an identifier from a string
            pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Unique identifier for messages
    MessageId
);
define_id!(
    /// Unique identifier for rooms, private dyads and groups
    ConversationId
);
define_id!(
    /// Unique identifier for autonomous entities
    EntityId
);
define_id!(
    /// Unique identifier for human users (issued by the auth collaborator)
    UserId
);
define_id!(
    /// Unique identifier for long-term memory records
    RecordId
);

/// A conversation participant: either a human or an autonomous entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum ParticipantId {
    Human(UserId),
    Entity(EntityId),
}

impl ParticipantId {
    pub fn entity_id(&self) -> Option<EntityId> {
        match self {
            ParticipantId::Entity(id) => Some(*id),
            ParticipantId::Human(_) => None,
        }
    }

    pub fn is_human(&self) -> bool {
        matches!(self, ParticipantId::Human(_))
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantId::Human(id) => write!(f, "user:{}", id),
            ParticipantId::Entity(id) => write!(f, "entity:{}", id),
        }
    }
}

impl From<UserId> for ParticipantId {
    fn from(id: UserId) -> Self {
        ParticipantId::Human(id)
    }
}

impl From<EntityId> for ParticipantId {
    fn from(id: EntityId) -> Self {
        ParticipantId::Entity(id)
    }
}

/// Conversation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    /// Explicitly created, many participants
    Room,
    /// Dyad created on first private message
    Private,
    /// Small group created on first group message
    Group,
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKind::Room => write!(f, "room"),
            ConversationKind::Private => write!(f, "private"),
            ConversationKind::Group => write!(f, "group"),
        }
    }
}

/// A room, private dyad or group with its current membership
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    /// Current participant set (order irrelevant)
    pub participants: BTreeSet<ParticipantId>,
    /// Incremented whenever membership changes; the conversation id never does
    pub membership_version: u32,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(
        kind: ConversationKind,
        participants: BTreeSet<ParticipantId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ConversationId::new(),
            kind,
            participants,
            membership_version: 1,
            created_at,
        }
    }

    /// Entities currently participating, in stable order
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.participants
            .iter()
            .filter_map(ParticipantId::entity_id)
            .collect()
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.participants.contains(participant)
    }

    /// Routing target a message posted here carries
    pub fn target(&self) -> RoutingTarget {
        match self.kind {
            ConversationKind::Room => RoutingTarget::Room(self.id),
            ConversationKind::Private => RoutingTarget::Private(self.id),
            ConversationKind::Group => RoutingTarget::Group(self.id),
        }
    }
}

/// The single delivery target of a committed message
///
/// Modelled as an enum so a committed message cannot carry more than one
/// target; [`MessageDraft`] is where the three optional fields live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "conversation_id")]
pub enum RoutingTarget {
    Room(ConversationId),
    Private(ConversationId),
    Group(ConversationId),
}

impl RoutingTarget {
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            RoutingTarget::Room(id) | RoutingTarget::Private(id) | RoutingTarget::Group(id) => *id,
        }
    }

    pub fn kind(&self) -> ConversationKind {
        match self {
            RoutingTarget::Room(_) => ConversationKind::Room,
            RoutingTarget::Private(_) => ConversationKind::Private,
            RoutingTarget::Group(_) => ConversationKind::Group,
        }
    }

    pub fn room(&self) -> Option<ConversationId> {
        match self {
            RoutingTarget::Room(id) => Some(*id),
            _ => None,
        }
    }

    pub fn private_conversation(&self) -> Option<ConversationId> {
        match self {
            RoutingTarget::Private(id) => Some(*id),
            _ => None,
        }
    }

    pub fn group_conversation(&self) -> Option<ConversationId> {
        match self {
            RoutingTarget::Group(id) => Some(*id),
            _ => None,
        }
    }
}

/// Raw inbound message before routing
///
/// At most one of `room`, `private_peer` and `group_members` may be set;
/// the router rejects anything else with a routing conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub author: ParticipantId,
    pub author_name: String,
    pub text: String,
    #[serde(default)]
    pub room: Option<ConversationId>,
    #[serde(default)]
    pub private_peer: Option<ParticipantId>,
    #[serde(default)]
    pub group_members: Option<Vec<ParticipantId>>,
    /// Entities explicitly addressed, independent of textual mentions
    #[serde(default)]
    pub addressees: Vec<EntityId>,
}

impl MessageDraft {
    pub fn new(author: ParticipantId, author_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            author,
            author_name: author_name.into(),
            text: text.into(),
            room: None,
            private_peer: None,
            group_members: None,
            addressees: Vec::new(),
        }
    }

    pub fn in_room(mut self, room: ConversationId) -> Self {
        self.room = Some(room);
        self
    }

    pub fn to_peer(mut self, peer: ParticipantId) -> Self {
        self.private_peer = Some(peer);
        self
    }

    pub fn to_group(mut self, members: Vec<ParticipantId>) -> Self {
        self.group_members = Some(members);
        self
    }

    pub fn addressing(mut self, entity: EntityId) -> Self {
        self.addressees.push(entity);
        self
    }

    /// Number of routing targets populated on this draft
    pub fn populated_targets(&self) -> usize {
        [
            self.room.is_some(),
            self.private_peer.is_some(),
            self.group_members.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}

/// A committed, immutable message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub author: ParticipantId,
    pub author_name: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub target: RoutingTarget,
    /// Message this one responds to (set on entity turns)
    #[serde(default)]
    pub in_reply_to: Option<MessageId>,
    #[serde(default)]
    pub addressees: Vec<EntityId>,
}

impl Message {
    /// Commit a routed draft
    pub fn from_draft(draft: MessageDraft, target: RoutingTarget, created_at: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            author: draft.author,
            author_name: draft.author_name,
            text: draft.text,
            created_at,
            target,
            in_reply_to: None,
            addressees: draft.addressees,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.target.conversation_id()
    }

    pub fn is_authored_by(&self, entity: EntityId) -> bool {
        self.author == ParticipantId::Entity(entity)
    }
}

/// How an entity decides whether to take a turn
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ResponseStrategy {
    /// Respond only when the handle is mentioned or the entity is addressed
    MentionOnly,
    /// Respond with independent probability `p` per message
    Probabilistic { p: f64 },
    /// Respond to every message (subject to cooldown)
    Active,
}

impl Default for ResponseStrategy {
    fn default() -> Self {
        ResponseStrategy::MentionOnly
    }
}

/// Prompt fragments and knowledge references that make up a personality
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonaProfile {
    /// Core personality and worldview
    pub base_persona: String,
    #[serde(default)]
    pub speaking_style: Option<String>,
    #[serde(default)]
    pub example_exchanges: Option<String>,
    #[serde(default)]
    pub guidelines: Option<String>,
    /// Names of uploaded knowledge documents
    #[serde(default)]
    pub documents: Vec<String>,
}

/// An autonomous conversation participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    /// Display name, also the token users mention
    pub handle: String,
    pub persona: PersonaProfile,
    #[serde(default)]
    pub strategy: ResponseStrategy,
    /// Minimum interval between attempts in one conversation
    #[serde(default, with = "serde_opt_duration_secs")]
    pub cooldown: Option<Duration>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Bumped by storage on every update
    #[serde(default)]
    pub revision: u64,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1024
}

impl Entity {
    pub fn new(handle: impl Into<String>, strategy: ResponseStrategy) -> Self {
        Self {
            id: EntityId::new(),
            handle: handle.into(),
            persona: PersonaProfile::default(),
            strategy,
            cooldown: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            revision: 0,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    pub fn with_persona(mut self, persona: PersonaProfile) -> Self {
        self.persona = persona;
        self
    }

    /// Cooldown as a plain interval; no cooldown is a zero interval
    pub fn min_interval(&self) -> Duration {
        self.cooldown.unwrap_or(Duration::ZERO)
    }

    pub fn participant_id(&self) -> ParticipantId {
        ParticipantId::Entity(self.id)
    }
}

/// One turn in a conversation's short-term window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortTermTurn {
    pub message_id: MessageId,
    pub author: ParticipantId,
    pub author_name: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for ShortTermTurn {
    fn from(message: &Message) -> Self {
        Self {
            message_id: message.id,
            author: message.author,
            author_name: message.author_name.clone(),
            text: message.text.clone(),
            created_at: message.created_at,
        }
    }
}

/// Which similarity-search partition a long-term record lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "id")]
pub enum MemoryScope {
    /// An entity's private knowledge base
    Personality(EntityId),
    /// A conversation's summarized history
    Conversation(ConversationId),
}

impl fmt::Display for MemoryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryScope::Personality(id) => write!(f, "personality:{}", id),
            MemoryScope::Conversation(id) => write!(f, "conversation:{}", id),
        }
    }
}

/// Where a long-term record came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Provenance {
    /// Summary of a batch evicted from the short-term window
    EvictedWindow {
        first_message: MessageId,
        last_message: MessageId,
        message_count: usize,
    },
    /// Chunk of an uploaded personality document
    PersonalityDocument {
        document: String,
        chunk_index: usize,
        total_chunks: usize,
    },
}

/// Append-only, similarity-searchable memory record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongTermRecord {
    pub id: RecordId,
    pub scope: MemoryScope,
    pub text: String,
    pub keywords: Vec<String>,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub provenance: Provenance,
}

/// Similarity search result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub record_id: RecordId,
    pub text: String,
    pub score: f32,
}

/// Key of a cooldown entry and of a dispatcher execution lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CooldownKey {
    pub entity_id: EntityId,
    pub conversation_id: ConversationId,
}

impl CooldownKey {
    pub fn new(entity_id: EntityId, conversation_id: ConversationId) -> Self {
        Self {
            entity_id,
            conversation_id,
        }
    }
}

impl fmt::Display for CooldownKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.entity_id, self.conversation_id)
    }
}

/// Last attempt of an entity in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cooldown {
    pub last_attempt: DateTime<Utc>,
    #[serde(with = "serde_duration_secs")]
    pub min_interval: Duration,
}

impl Cooldown {
    /// Time left before another attempt is allowed, if any
    ///
    /// A `now` earlier than the last attempt counts as still cooling down.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        match (now - self.last_attempt).to_std() {
            Ok(elapsed) if elapsed >= self.min_interval => None,
            Ok(elapsed) => Some(self.min_interval - elapsed),
            Err(_) => Some(self.min_interval),
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.remaining(now).is_some()
    }
}

// Custom serde module for Duration (serialize/deserialize as seconds)
pub(crate) mod serde_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

pub(crate) mod serde_opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        match secs {
            Some(s) if !s.is_finite() || s < 0.0 => Err(serde::de::Error::custom(
                "cooldown must be a non-negative number of seconds",
            )),
            Some(s) => Ok(Some(Duration::from_secs_f64(s))),
            None => Ok(None),
        }
    }
}
