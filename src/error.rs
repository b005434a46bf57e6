//! Error types for the Chorus orchestration pipeline
//!
//! This module provides comprehensive error handling using thiserror for
//! structured error definitions and anyhow for error propagation at the
//! binary edge.
//!
//! Only routing and ingestion validation errors ever reach the caller of
//! [`crate::orchestration::Orchestrator::ingest`]. Everything that goes wrong
//! inside a dispatched turn is folded into that turn's report instead.

use crate::types::{ConversationId, EntityId, MessageId};
use thiserror::Error;

/// Main error type for Chorus operations
#[derive(Error, Debug)]
pub enum ChorusError {
    /// Zero or several routing targets were populated on a message draft
    #[error("Routing conflict: expected exactly one routing target, found {populated}")]
    RoutingConflict { populated: usize },

    /// Routing target is structurally valid but unusable (self-dyad, empty group)
    #[error("Invalid routing target: {0}")]
    InvalidTarget(String),

    /// Conversation does not exist (or was deleted)
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    /// Entity not found
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    /// Message not found
    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    /// Resource already exists
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Update was based on a record that has changed since it was read
    #[error("Stale write: {0}")]
    StaleWrite(String),

    /// Vector search or long-term memory backend unreachable
    #[error("Memory store unavailable: {0}")]
    MemoryStoreUnavailable(String),

    /// Embedding generation failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Idempotency key was already submitted to the dispatcher
    #[error("Duplicate job: {0}")]
    DuplicateJob(String),

    /// Dispatcher has been shut down
    #[error("Dispatcher is closed")]
    DispatcherClosed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration loaded but failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl ChorusError {
    /// True for errors the ingestion caller is expected to surface to a user
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            ChorusError::RoutingConflict { .. }
                | ChorusError::InvalidTarget(_)
                | ChorusError::ConversationNotFound(_)
        )
    }
}

/// Result type alias for Chorus operations
pub type Result<T> = std::result::Result<T, ChorusError>;

/// Convert anyhow::Error to ChorusError
impl From<anyhow::Error> for ChorusError {
    fn from(err: anyhow::Error) -> Self {
        ChorusError::Other(err.to_string())
    }
}
