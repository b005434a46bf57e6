//! Turn execution
//!
//! Runs one dispatched job to a terminal state: cooldown debit, context
//! assembly, generation, commit.

use crate::clock::Clock;
use crate::error::ChorusError;
use crate::events::{Event, EventBroadcaster};
use crate::orchestration::assembler::MemoryAssembler;
use crate::orchestration::committer::TurnCommitter;
use crate::orchestration::cooldown::{CooldownLedger, DebitOutcome};
use crate::orchestration::generation::{clean_generation, GenerationInvoker};
use crate::orchestration::job::{
    FailureReason, SkipReason, TurnJob, TurnReport, TurnState, TurnTracker,
};
use crate::orchestration::prompt::build_request;
use crate::storage::Storage;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Executes dispatched jobs
#[async_trait]
pub trait TurnExecutor: Send + Sync + 'static {
    async fn execute(&self, job: TurnJob) -> TurnReport;
}

pub struct TurnRunner<S: ?Sized> {
    store: Arc<S>,
    ledger: CooldownLedger<S>,
    assembler: MemoryAssembler,
    invoker: GenerationInvoker,
    committer: TurnCommitter<S>,
    events: Arc<EventBroadcaster>,
    clock: Arc<dyn Clock>,
}

impl<S> TurnRunner<S>
where
    S: Storage + ?Sized + 'static,
{
    pub fn new(
        store: Arc<S>,
        assembler: MemoryAssembler,
        invoker: GenerationInvoker,
        committer: TurnCommitter<S>,
        events: Arc<EventBroadcaster>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger: CooldownLedger::new(store.clone()),
            store,
            assembler,
            invoker,
            committer,
            events,
            clock,
        }
    }

    async fn run(&self, job: &TurnJob, tracker: &mut TurnTracker) -> Result<(), String> {
        tracker.advance(TurnState::CooldownCheck)?;

        let entity = match self.store.get_entity(job.entity_id).await {
            Ok(entity) => entity,
            Err(ChorusError::EntityNotFound(_)) => {
                return tracker.advance(TurnState::Skipped(SkipReason::EntityUnavailable));
            }
            Err(e) => {
                return tracker.advance(TurnState::Failed(FailureReason::Persistence(e.to_string())));
            }
        };

        let debit = self
            .ledger
            .try_debit(job.lane_key(), entity.min_interval(), self.clock.now())
            .await;
        match debit {
            Ok(DebitOutcome::Debited { .. }) => {}
            Ok(DebitOutcome::OnCooldown { remaining, .. }) => {
                return tracker.advance(TurnState::Skipped(SkipReason::Cooldown { remaining }));
            }
            Err(ChorusError::ConversationNotFound(_)) => {
                info!(key = %job.lane_key(), "Conversation deleted before the debit");
                return tracker.advance(TurnState::Failed(FailureReason::ConversationDeleted));
            }
            Err(e) => {
                warn!(key = %job.lane_key(), error = %e, "Cooldown ledger unavailable");
                return tracker.advance(TurnState::Skipped(SkipReason::LedgerUnavailable(
                    e.to_string(),
                )));
            }
        }

        tracker.advance(TurnState::Generating)?;

        let context = self.assembler.assemble(&entity, &job.message).await;
        if context.degraded {
            debug!(entity_id = %entity.id, "Generating with short-term context only");
        }
        let request = build_request(&entity, &context);

        let outcome = self.invoker.invoke(&request).await;
        let text = match outcome
            .result
            .and_then(|generation| clean_generation(&generation.text, &entity.handle))
        {
            Ok(text) => text,
            Err(error) => {
                return tracker.advance(TurnState::Failed(FailureReason::Generation {
                    error,
                    attempts: outcome.attempts,
                }));
            }
        };

        match self.committer.commit(&entity, &job.message, text).await {
            Ok(message) => tracker.advance(TurnState::Committed(message.id)),
            Err(reason) => tracker.advance(TurnState::Failed(reason)),
        }
    }

    fn announce(&self, job: &TurnJob, state: &TurnState) {
        let conversation_id = job.conversation_id();
        match state {
            TurnState::Skipped(reason) => {
                debug!(job = %job.key(), reason = %reason, "Turn skipped");
                self.events.broadcast(Event::turn_skipped(
                    job.entity_id,
                    conversation_id,
                    job.message.id,
                    reason.to_string(),
                ));
            }
            TurnState::Failed(reason) => {
                warn!(job = %job.key(), reason = %reason, "Turn failed");
                self.events.broadcast(Event::turn_failed(
                    job.entity_id,
                    conversation_id,
                    job.message.id,
                    reason.to_string(),
                ));
            }
            TurnState::Committed(message_id) => {
                info!(
                    job = %job.key(),
                    conversation_id = %conversation_id,
                    message_id = %message_id,
                    "Turn committed"
                );
            }
            _ => {}
        }
    }
}

#[async_trait]
impl<S> TurnExecutor for TurnRunner<S>
where
    S: Storage + ?Sized + 'static,
{
    async fn execute(&self, job: TurnJob) -> TurnReport {
        let mut tracker = TurnTracker::new();
        let state = match self.run(&job, &mut tracker).await {
            Ok(()) => tracker.into_state(),
            Err(e) => {
                error!(job = %job.key(), error = %e, "Turn state machine violated");
                TurnState::Failed(FailureReason::Internal(e))
            }
        };

        self.announce(&job, &state);
        TurnReport::new(&job, state)
    }
}
