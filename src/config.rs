//! Configuration for the Chorus pipeline
//!
//! Settings are layered with the `config` crate: built-in defaults, then an
//! optional TOML file, then `CHORUS__SECTION__FIELD` environment variables.
//! Provider API keys may also come from `OPENAI_API_KEY`.

use crate::error::{ChorusError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "CHORUS";

/// Fallback variable for provider credentials
pub const OPENAI_API_KEY_VAR: &str = "OPENAI_API_KEY";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChorusConfig {
    pub memory: MemoryConfig,
    pub keywords: KeywordConfig,
    pub generation: GenerationConfig,
    pub embedding: EmbeddingConfig,
    pub dispatcher: DispatcherConfig,
}

/// Short-term window, compaction and context assembly
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum short-term turns kept per conversation (K)
    pub short_term_window: usize,

    /// Turns evicted per compaction; defaults to half the window
    pub compaction_batch: Option<usize>,

    /// Characters of evicted conversation kept verbatim in a summary record
    pub summary_excerpt_chars: usize,

    /// Context budget handed to the generation provider (characters)
    pub context_budget_chars: usize,

    /// Personality records retrieved per turn (N)
    pub personality_top_n: usize,

    /// Conversation records retrieved per turn (M)
    pub conversation_top_m: usize,

    /// Token Jaccard similarity at which a retrieved span counts as a duplicate
    pub dedup_threshold: f32,

    /// Smallest truncated retrieved snippet worth keeping (characters)
    pub min_snippet_chars: usize,

    /// Personality document chunk size (characters)
    pub chunk_size: usize,

    /// Overlap between consecutive chunks (characters)
    pub chunk_overlap: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_window: 20,
            compaction_batch: None,
            summary_excerpt_chars: 600,
            context_budget_chars: 4000,
            personality_top_n: 5,
            conversation_top_m: 5,
            dedup_threshold: 0.8,
            min_snippet_chars: 80,
            chunk_size: 500,
            chunk_overlap: 50,
        }
    }
}

impl MemoryConfig {
    /// Effective compaction batch size
    pub fn compaction_batch(&self) -> usize {
        self.compaction_batch
            .unwrap_or(self.short_term_window / 2)
            .max(1)
    }

    /// Window length kept once compaction has failed repeatedly
    pub fn window_hard_limit(&self) -> usize {
        self.short_term_window.saturating_mul(2).max(1)
    }
}

/// Keyword extractor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordConfig {
    /// Longest candidate phrase, in words
    pub max_ngram: usize,

    /// Co-occurrence window used for the relatedness feature
    pub window_size: usize,

    /// Edit similarity above which two candidates are considered the same
    pub dedup_threshold: f64,

    /// Candidates scoring above this are discarded (lower is better)
    pub score_cutoff: f64,

    /// Minimum keyword length in characters
    pub min_length: usize,

    /// Keywords returned per extraction
    pub top_n: usize,

    /// Keywords prepended to the raw message when querying long-term memory
    pub query_keywords: usize,
}

impl Default for KeywordConfig {
    fn default() -> Self {
        Self {
            max_ngram: 3,
            window_size: 3,
            dedup_threshold: 0.9,
            score_cutoff: 0.5,
            min_length: 2,
            top_n: 20,
            query_keywords: 5,
        }
    }
}

/// Generation provider and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Base URL of an OpenAI-compatible API
    pub api_base: String,

    pub model: String,

    /// API key; never written back out
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Total attempts per job, including the first
    pub max_attempts: u32,

    /// First backoff delay (milliseconds)
    #[serde(with = "serde_duration_millis")]
    pub backoff_base: Duration,

    /// Backoff ceiling (milliseconds)
    #[serde(with = "serde_duration_millis")]
    pub backoff_max: Duration,

    /// Timeout of a single provider call (seconds)
    #[serde(with = "serde_duration_secs")]
    pub attempt_timeout: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Which embedder backs long-term memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    /// Deterministic feature-hashing embedder, no network
    #[default]
    Local,
    /// OpenAI-compatible embeddings endpoint
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,
    pub dimension: usize,
    pub model: String,
    pub api_base: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Local,
            dimension: 384,
            model: "text-embedding-3-small".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Worker tasks draining ready lanes
    pub workers: usize,

    /// Idempotency keys remembered before the oldest are forgotten
    pub idempotency_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            idempotency_capacity: 10_000,
        }
    }
}

impl ChorusConfig {
    /// Load configuration from an optional TOML file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            debug!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let mut config: ChorusConfig = builder.build()?.try_deserialize()?;
        config.apply_key_fallback();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let mut config: ChorusConfig = toml::from_str(toml_str)?;
        config.apply_key_fallback();
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration (secrets omitted)
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ChorusError::Other(e.to_string()))
    }

    fn apply_key_fallback(&mut self) {
        let fallback = env::var(OPENAI_API_KEY_VAR).ok().filter(|k| !k.is_empty());
        if self.generation.api_key.is_none() {
            self.generation.api_key = fallback.clone();
        }
        if self.embedding.api_key.is_none() {
            self.embedding.api_key = self.generation.api_key.clone().or(fallback);
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let memory = &self.memory;
        if memory.short_term_window == 0 {
            return Err(invalid("memory.short_term_window must be at least 1"));
        }
        if let Some(batch) = memory.compaction_batch {
            if batch == 0 || batch > memory.short_term_window {
                return Err(invalid(
                    "memory.compaction_batch must be between 1 and memory.short_term_window",
                ));
            }
        }
        if memory.context_budget_chars == 0 {
            return Err(invalid("memory.context_budget_chars must be positive"));
        }
        if !(0.0..=1.0).contains(&memory.dedup_threshold) {
            return Err(invalid("memory.dedup_threshold must be between 0 and 1"));
        }
        if memory.chunk_size == 0 || memory.chunk_overlap >= memory.chunk_size {
            return Err(invalid(
                "memory.chunk_overlap must be smaller than a non-zero memory.chunk_size",
            ));
        }

        let keywords = &self.keywords;
        if keywords.max_ngram == 0 || keywords.window_size == 0 {
            return Err(invalid("keywords.max_ngram and keywords.window_size must be positive"));
        }
        if !(0.0..=1.0).contains(&keywords.dedup_threshold) {
            return Err(invalid("keywords.dedup_threshold must be between 0 and 1"));
        }

        let generation = &self.generation;
        if generation.max_attempts == 0 {
            return Err(invalid("generation.max_attempts must be at least 1"));
        }
        if generation.backoff_max < generation.backoff_base {
            return Err(invalid("generation.backoff_max must not be below backoff_base"));
        }
        if generation.attempt_timeout.is_zero() {
            return Err(invalid("generation.attempt_timeout must be positive"));
        }

        if self.embedding.dimension == 0 {
            return Err(invalid("embedding.dimension must be positive"));
        }

        if self.dispatcher.workers == 0 {
            return Err(invalid("dispatcher.workers must be at least 1"));
        }
        if self.dispatcher.idempotency_capacity == 0 {
            return Err(invalid("dispatcher.idempotency_capacity must be at least 1"));
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> ChorusError {
    ChorusError::InvalidConfig(msg.to_string())
}

// Custom serde module for Duration (serialize/deserialize as seconds)
mod serde_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Same, in milliseconds
mod serde_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
