//! Chorus - Multi-Entity Conversation Orchestration
//!
//! Humans and autonomous AI entities share rooms, private dyads and group
//! chats. Every human message is routed to exactly one conversation,
//! evaluated against each participant entity's response strategy and
//! cooldown, and answered asynchronously by the entities that trigger.
//! Replies are generated from a tiered memory: the recent short-term window,
//! the entity's personality knowledge and the conversation's long-term
//! summaries.
//!
//! # Architecture
//!
//! - **Types**: Core data structures (Message, Conversation, Entity, ...)
//! - **Routing**: single-target classification and conversation resolution
//! - **Orchestration**: trigger evaluation, cooldown ledger, dispatcher,
//!   context assembly, generation and commit
//! - **Memory**: short-term windows and the long-term vector index
//! - **Text**: keyword extraction, summarization, chunking
//! - **Services**: generation provider and embedding backends
//! - **Storage**: narrow persistence traits and the in-memory backend
//!
//! # Example
//!
//! ```ignore
//! use chorus_core::{ChorusConfig, Entity, MessageDraft, Orchestrator, ResponseStrategy};
//!
//! #[tokio::main]
//! async fn main() -> chorus_core::Result<()> {
//!     let orchestrator = Orchestrator::from_config(ChorusConfig::load(None)?)?;
//!     let sage = orchestrator
//!         .register_entity(Entity::new("Sage", ResponseStrategy::MentionOnly))
//!         .await?;
//!     let alice = chorus_core::ParticipantId::Human(chorus_core::UserId::new());
//!     let room = orchestrator.create_room([alice, sage.participant_id()]).await?;
//!
//!     let receipt = orchestrator
//!         .ingest(MessageDraft::new(alice, "alice", "Hey @Sage, thoughts?").in_room(room.id))
//!         .await?;
//!     for report in receipt.wait_all().await {
//!         println!("{:?}", report.state);
//!     }
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod memory;
pub mod orchestration;
pub mod routing;
pub mod services;
pub mod storage;
pub mod text;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ChorusConfig;
pub use error::{ChorusError, Result};
pub use events::{Event, EventBroadcaster, EventType};
pub use memory::{InMemoryVectorIndex, MemoryStore, VectorIndex};
pub use orchestration::{IngestReceipt, Orchestrator, TurnReport, TurnState};
pub use routing::MessageRouter;
pub use services::{EmbeddingService, GenerationProvider, HashingEmbedder};
pub use storage::{InMemoryStorage, Storage};
pub use types::{
    Conversation, ConversationId, ConversationKind, Entity, EntityId, Message, MessageDraft,
    MessageId, ParticipantId, PersonaProfile, ResponseStrategy, RoutingTarget, UserId,
};
