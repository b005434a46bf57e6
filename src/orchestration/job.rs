//! Turn jobs
//!
//! One job per (message, entity) pair. A job walks an explicit state
//! machine and reports its terminal state through a oneshot channel.

use crate::services::GenerationError;
use crate::types::{ConversationId, CooldownKey, EntityId, Message, MessageId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Idempotency key of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub message_id: MessageId,
    pub entity_id: EntityId,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.message_id, self.entity_id)
    }
}

/// Work unit handed to the dispatcher
#[derive(Debug, Clone)]
pub struct TurnJob {
    /// The triggering message
    pub message: Arc<Message>,
    pub entity_id: EntityId,
}

impl TurnJob {
    pub fn new(message: Arc<Message>, entity_id: EntityId) -> Self {
        Self { message, entity_id }
    }

    pub fn key(&self) -> JobKey {
        JobKey {
            message_id: self.message.id,
            entity_id: self.entity_id,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.message.conversation_id()
    }

    /// Jobs with the same lane key run strictly one after another
    pub fn lane_key(&self) -> CooldownKey {
        CooldownKey::new(self.entity_id, self.conversation_id())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    Cooldown { remaining: Duration },
    /// Entity was removed between evaluation and execution
    EntityUnavailable,
    LedgerUnavailable(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Cooldown { remaining } => {
                write!(f, "cooldown ({:.1}s remaining)", remaining.as_secs_f64())
            }
            SkipReason::EntityUnavailable => f.write_str("entity unavailable"),
            SkipReason::LedgerUnavailable(e) => write!(f, "cooldown ledger unavailable: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    Generation { error: GenerationError, attempts: u32 },
    ConversationDeleted,
    Persistence(String),
    Internal(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Generation { error, attempts } => {
                write!(f, "generation failed after {} attempt(s): {}", attempts, error)
            }
            FailureReason::ConversationDeleted => f.write_str("conversation deleted"),
            FailureReason::Persistence(e) => write!(f, "persistence: {}", e),
            FailureReason::Internal(e) => write!(f, "internal: {}", e),
        }
    }
}

/// Job lifecycle
///
/// `Pending -> CooldownCheck -> {Skipped | Generating -> {Committed | Failed}}`.
/// `Failed` is also reachable from any non-terminal state for internal errors.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnState {
    Pending,
    CooldownCheck,
    Generating,
    Skipped(SkipReason),
    Committed(MessageId),
    Failed(FailureReason),
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnState::Skipped(_) | TurnState::Committed(_) | TurnState::Failed(_)
        )
    }

    pub fn can_transition_to(&self, next: &TurnState) -> bool {
        match (self, next) {
            (TurnState::Pending, TurnState::CooldownCheck) => true,
            (TurnState::CooldownCheck, TurnState::Skipped(_)) => true,
            (TurnState::CooldownCheck, TurnState::Generating) => true,
            (TurnState::Generating, TurnState::Committed(_)) => true,
            (current, TurnState::Failed(_)) => !current.is_terminal(),
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TurnState::Pending => "pending",
            TurnState::CooldownCheck => "cooldown_check",
            TurnState::Generating => "generating",
            TurnState::Skipped(_) => "skipped",
            TurnState::Committed(_) => "committed",
            TurnState::Failed(_) => "failed",
        }
    }
}

/// Tracks a job's state and rejects illegal transitions
#[derive(Debug, Clone)]
pub struct TurnTracker {
    state: TurnState,
}

impl TurnTracker {
    pub fn new() -> Self {
        Self {
            state: TurnState::Pending,
        }
    }

    pub fn state(&self) -> &TurnState {
        &self.state
    }

    pub fn advance(&mut self, next: TurnState) -> Result<(), String> {
        if !self.state.can_transition_to(&next) {
            return Err(format!(
                "Invalid turn transition: {} -> {}",
                self.state.name(),
                next.name()
            ));
        }
        self.state = next;
        Ok(())
    }

    pub fn into_state(self) -> TurnState {
        self.state
    }
}

impl Default for TurnTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal outcome of one job
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub key: JobKey,
    pub conversation_id: ConversationId,
    pub state: TurnState,
}

impl TurnReport {
    pub fn new(job: &TurnJob, state: TurnState) -> Self {
        Self {
            key: job.key(),
            conversation_id: job.conversation_id(),
            state,
        }
    }

    pub fn committed_message(&self) -> Option<MessageId> {
        match self.state {
            TurnState::Committed(id) => Some(id),
            _ => None,
        }
    }
}

/// Resolves to the job's report once it reaches a terminal state
#[derive(Debug)]
pub struct JobHandle {
    pub key: JobKey,
    rx: oneshot::Receiver<TurnReport>,
}

impl JobHandle {
    pub(crate) fn new(key: JobKey, rx: oneshot::Receiver<TurnReport>) -> Self {
        Self { key, rx }
    }

    /// Wait for the report; `None` if the job was dropped without one
    pub async fn wait(self) -> Option<TurnReport> {
        self.rx.await.ok()
    }
}
