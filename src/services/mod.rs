//! Services layer for Chorus
//!
//! External collaborators behind replaceable boundaries: the generation
//! provider and the embedding backends.

pub mod embeddings;
pub mod llm;
pub mod remote_embeddings;
pub mod retry;

pub use embeddings::{cosine_similarity, EmbeddingService, HashingEmbedder, EMBEDDING_DIM};
pub use llm::{
    ContextMessage, ContextRole, Generation, GenerationError, GenerationProvider,
    GenerationRequest, OpenAiCompatibleProvider, PermanentKind, TokenUsage, TransientKind,
};
pub use remote_embeddings::RemoteEmbeddingService;
pub use retry::RetryPolicy;

use crate::config::{EmbeddingBackend, EmbeddingConfig};
use crate::error::Result;
use std::sync::Arc;

/// Build the embedder selected by configuration
///
/// The remote backend retries with `policy`.
pub fn embedder_from_config(
    config: &EmbeddingConfig,
    policy: RetryPolicy,
) -> Result<Arc<dyn EmbeddingService>> {
    match config.backend {
        EmbeddingBackend::Local => Ok(Arc::new(HashingEmbedder::new(config.dimension))),
        EmbeddingBackend::Remote => Ok(Arc::new(RemoteEmbeddingService::from_config(config, policy)?)),
    }
}
