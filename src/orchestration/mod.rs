//! Conversation orchestration
//!
//! The ingestion path and the asynchronous turn pipeline:
//!
//! - **Ingestion** (`Orchestrator::ingest`): route the draft, persist the
//!   message, feed short-term memory, broadcast, evaluate triggers against a
//!   cooldown snapshot and queue one job per candidate entity. Never waits on
//!   generation or on compaction, which runs on its own task.
//! - **Turns** (`TurnRunner`): cooldown debit, context assembly, generation
//!   with retries, commit. Run by the `Dispatcher` in per-(entity,
//!   conversation) lanes.

pub mod assembler;
pub mod committer;
pub mod compaction;
pub mod cooldown;
pub mod dispatcher;
pub mod generation;
pub mod job;
pub mod prompt;
pub mod trigger;
pub mod turn;

pub use assembler::{AssembledContext, ContextSegment, MemoryAssembler, PackLimits, Tier};
pub use committer::TurnCommitter;
pub use compaction::{feed_window, spawn_compaction};
pub use cooldown::{CooldownLedger, DebitOutcome};
pub use dispatcher::Dispatcher;
pub use generation::{strip_name_prefix, GenerationInvoker, InvocationOutcome, RetryPolicy};
pub use job::{
    FailureReason, JobHandle, JobKey, SkipReason, TurnJob, TurnReport, TurnState, TurnTracker,
};
pub use trigger::{Evaluation, SkipCause, TriggerReason, TriggerVerdict};
pub use turn::{TurnExecutor, TurnRunner};

use crate::clock::{Clock, SystemClock};
use crate::config::ChorusConfig;
use crate::error::{ChorusError, Result};
use crate::events::{Event, EventBroadcaster};
use crate::memory::{InMemoryVectorIndex, MemoryStore, VectorIndex};
use crate::routing::MessageRouter;
use crate::services::{
    embedder_from_config, EmbeddingService, GenerationProvider, OpenAiCompatibleProvider,
};
use crate::storage::{InMemoryStorage, Storage};
use crate::types::{
    Conversation, ConversationId, CooldownKey, Entity, EntityId, Message, MessageDraft,
    ParticipantId, RecordId, ShortTermTurn,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Read-modify-write rounds before an entity update gives up
const MAX_ENTITY_UPDATE_ROUNDS: usize = 8;

/// What ingestion did with a draft
#[derive(Debug)]
pub struct IngestReceipt {
    pub message: Message,
    pub recipients: Vec<ParticipantId>,
    /// One verdict per participant entity
    pub evaluations: Vec<Evaluation>,
    /// Handles for the queued turns
    pub jobs: Vec<JobHandle>,
}

impl IngestReceipt {
    pub fn conversation_id(&self) -> ConversationId {
        self.message.conversation_id()
    }

    pub fn candidates(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.evaluations
            .iter()
            .filter(|e| e.verdict.is_candidate())
            .map(|e| e.entity_id)
    }

    /// Wait for every queued turn to finish
    pub async fn wait_all(self) -> Vec<TurnReport> {
        let mut reports = Vec::with_capacity(self.jobs.len());
        for job in self.jobs {
            if let Some(report) = job.wait().await {
                reports.push(report);
            }
        }
        reports
    }
}

pub struct Orchestrator {
    config: ChorusConfig,
    storage: Arc<dyn Storage>,
    router: MessageRouter<dyn Storage>,
    ledger: CooldownLedger<dyn Storage>,
    memory: Arc<MemoryStore>,
    events: Arc<EventBroadcaster>,
    dispatcher: Dispatcher<dyn TurnExecutor>,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    /// Wire the pipeline; must be called inside a tokio runtime
    pub fn new(
        config: ChorusConfig,
        storage: Arc<dyn Storage>,
        provider: Arc<dyn GenerationProvider>,
        embedder: Arc<dyn EmbeddingService>,
        index: Arc<dyn VectorIndex>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let memory = Arc::new(MemoryStore::new(
            config.memory.clone(),
            config.keywords.clone(),
            index,
            embedder,
            clock.clone(),
        ));
        let events = Arc::new(EventBroadcaster::default());

        let runner = TurnRunner::new(
            storage.clone(),
            MemoryAssembler::new(memory.clone(), config.keywords.clone()),
            GenerationInvoker::new(provider, RetryPolicy::from_config(&config.generation)),
            TurnCommitter::new(storage.clone(), memory.clone(), events.clone(), clock.clone()),
            events.clone(),
            clock.clone(),
        );
        let executor: Arc<dyn TurnExecutor> = Arc::new(runner);
        let dispatcher = Dispatcher::new(executor, &config.dispatcher);

        Self {
            router: MessageRouter::new(storage.clone()),
            ledger: CooldownLedger::new(storage.clone()),
            config,
            storage,
            memory,
            events,
            dispatcher,
            clock,
        }
    }

    /// In-memory storage and index, HTTP provider and configured embedder
    pub fn from_config(config: ChorusConfig) -> Result<Self> {
        config.validate()?;
        let provider = Arc::new(OpenAiCompatibleProvider::from_config(&config.generation)?);
        let embedder = embedder_from_config(
            &config.embedding,
            RetryPolicy::from_config(&config.generation),
        )?;
        let index = Arc::new(InMemoryVectorIndex::new(embedder.dimensions()));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let storage = Arc::new(InMemoryStorage::with_clock(clock.clone()));

        Ok(Self::new(config, storage, provider, embedder, index, clock))
    }

    /// Accept a human (or externally injected) message
    ///
    /// Only validation failures are returned; everything that happens to the
    /// triggered turns is reported through the job handles and events.
    pub async fn ingest(&self, draft: MessageDraft) -> Result<IngestReceipt> {
        if self.dispatcher.is_closed() {
            return Err(ChorusError::DispatcherClosed);
        }

        let route = self.router.route(&draft).await?;
        let message = Message::from_draft(draft, route.target, self.clock.now());
        self.storage.create_message(&message).await?;
        let conversation_id = message.conversation_id();

        feed_window(
            &self.memory,
            &self.events,
            conversation_id,
            ShortTermTurn::from(&message),
        )
        .await?;
        self.events
            .broadcast(Event::message_posted(message.clone(), route.recipients.clone()));

        let mut entities = Vec::new();
        for entity_id in route.conversation.entity_ids() {
            match self.storage.get_entity(entity_id).await {
                Ok(entity) => entities.push(entity),
                Err(e) => warn!(entity_id = %entity_id, error = %e, "Skipping unavailable entity"),
            }
        }

        let keys: Vec<CooldownKey> = entities
            .iter()
            .map(|e| CooldownKey::new(e.id, conversation_id))
            .collect();
        let snapshot = match self.ledger.snapshot(&keys).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Cooldown snapshot unavailable, deferring to the debit");
                HashMap::new()
            }
        };

        let evaluations = {
            let mut rng = rand::thread_rng();
            trigger::evaluate(&message, &entities, &snapshot, self.clock.now(), &mut rng)
        };

        let shared = Arc::new(message.clone());
        let mut jobs = Vec::new();
        for evaluation in &evaluations {
            match evaluation.verdict {
                TriggerVerdict::Candidate(reason) => {
                    debug!(entity_id = %evaluation.entity_id, ?reason, "Entity triggered");
                    match self
                        .dispatcher
                        .submit(TurnJob::new(shared.clone(), evaluation.entity_id))
                    {
                        Ok(handle) => jobs.push(handle),
                        Err(ChorusError::DuplicateJob(_)) => {}
                        Err(e) => {
                            warn!(entity_id = %evaluation.entity_id, error = %e, "Could not queue turn")
                        }
                    }
                }
                TriggerVerdict::Skip(cause) => {
                    debug!(entity_id = %evaluation.entity_id, ?cause, "Entity not triggered");
                }
            }
        }

        info!(
            message_id = %message.id,
            conversation_id = %conversation_id,
            candidates = jobs.len(),
            "Ingested message"
        );

        Ok(IngestReceipt {
            message,
            recipients: route.recipients,
            evaluations,
            jobs,
        })
    }

    pub async fn create_room(
        &self,
        participants: impl IntoIterator<Item = ParticipantId>,
    ) -> Result<Conversation> {
        let participants: BTreeSet<ParticipantId> = participants.into_iter().collect();
        self.storage.create_room(participants).await
    }

    /// Replace a conversation's participants; later broadcasts use the new set
    pub async fn update_participants(
        &self,
        conversation_id: ConversationId,
        participants: impl IntoIterator<Item = ParticipantId>,
    ) -> Result<Conversation> {
        self.storage
            .update_participants(conversation_id, participants.into_iter().collect())
            .await
    }

    pub async fn register_entity(&self, entity: Entity) -> Result<Entity> {
        self.storage.create_entity(&entity).await?;
        info!(entity_id = %entity.id, handle = %entity.handle, "Registered entity");
        Ok(entity)
    }

    /// Store `entity` if nobody updated it since it was read
    ///
    /// Returns the stored copy; a concurrent update yields `StaleWrite`.
    pub async fn update_entity(&self, entity: &Entity) -> Result<Entity> {
        self.storage.update_entity(entity).await
    }

    pub async fn entity(&self, entity_id: EntityId) -> Result<Entity> {
        self.storage.get_entity(entity_id).await
    }

    /// Upload a knowledge document into an entity's personality memory
    pub async fn ingest_personality(
        &self,
        entity_id: EntityId,
        document: &str,
        text: &str,
    ) -> Result<Vec<RecordId>> {
        self.storage.get_entity(entity_id).await?;
        let records = self
            .memory
            .ingest_personality(entity_id, document, text)
            .await?;
        if !records.is_empty() {
            self.record_document(entity_id, document).await?;
        }
        Ok(records)
    }

    /// Add `document` to the entity's document list against its latest revision
    async fn record_document(&self, entity_id: EntityId, document: &str) -> Result<()> {
        for _ in 0..MAX_ENTITY_UPDATE_ROUNDS {
            let mut entity = self.storage.get_entity(entity_id).await?;
            if entity.persona.documents.iter().any(|d| d == document) {
                return Ok(());
            }

            entity.persona.documents.push(document.to_string());
            match self.storage.update_entity(&entity).await {
                Ok(_) => return Ok(()),
                Err(ChorusError::StaleWrite(reason)) => {
                    debug!(entity_id = %entity_id, reason = %reason, "Entity changed underneath, re-reading");
                }
                Err(e) => return Err(e),
            }
        }

        Err(ChorusError::StaleWrite(format!(
            "entity {} changed on every attempt to record {}",
            entity_id, document
        )))
    }

    /// Delete a conversation; in-flight turns discard their replies
    pub async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        self.storage.delete_conversation(conversation_id).await?;
        self.memory.forget_conversation(conversation_id).await;
        info!(conversation_id = %conversation_id, "Deleted conversation");
        Ok(())
    }

    pub async fn messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        self.storage.list_messages(conversation_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &ChorusConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn queue_depth(&self) -> usize {
        self.dispatcher.queue_depth()
    }

    pub fn active_jobs(&self) -> usize {
        self.dispatcher.active_jobs()
    }

    /// Stop accepting messages and finish every queued turn
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }
}
