//! Common test utilities and helpers

#![allow(dead_code)]

use async_trait::async_trait;
use chorus_core::error::{ChorusError, Result};
use chorus_core::services::{
    EmbeddingService, Generation, GenerationError, GenerationProvider, GenerationRequest,
    TokenUsage,
};
use chorus_core::types::{LongTermRecord, MemoryScope, SearchHit};
use chorus_core::{
    ChorusConfig, Clock, HashingEmbedder, InMemoryStorage, InMemoryVectorIndex, ManualClock,
    Orchestrator, ParticipantId, UserId, VectorIndex,
};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const DIM: usize = 64;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn human() -> ParticipantId {
    ParticipantId::Human(UserId::new())
}

/// Small windows and fast retries
pub fn test_config() -> ChorusConfig {
    let mut config = ChorusConfig::default();
    config.memory.short_term_window = 6;
    config.generation.max_attempts = 3;
    config.generation.backoff_base = Duration::from_millis(10);
    config.generation.backoff_max = Duration::from_millis(40);
    config.generation.attempt_timeout = Duration::from_secs(2);
    config.embedding.dimension = DIM;
    config.dispatcher.workers = 4;
    config
}

pub fn reply(text: &str) -> Generation {
    Generation {
        text: text.to_string(),
        usage: TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
        },
    }
}

/// Replays queued results, then answers with a default reply
pub struct ScriptedProvider {
    queue: Mutex<VecDeque<std::result::Result<Generation, GenerationError>>>,
    default_reply: String,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedProvider {
    pub fn new(default_reply: &str) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            default_reply: default_reply.to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, result: std::result::Result<Generation, GenerationError>) {
        self.queue.lock().unwrap().push_back(result);
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<Generation, GenerationError> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.queue.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(reply(&self.default_reply)))
    }
}

/// Never answers within any reasonable timeout
pub struct HangingProvider {
    pub calls: AtomicUsize,
}

impl HangingProvider {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl GenerationProvider for HangingProvider {
    async fn generate(
        &self,
        _request: &GenerationRequest,
    ) -> std::result::Result<Generation, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(reply("too late"))
    }
}

/// Blocks every call until released
pub struct GatedProvider {
    pub started: Notify,
    release: Notify,
}

impl GatedProvider {
    pub fn new() -> Self {
        Self {
            started: Notify::new(),
            release: Notify::new(),
        }
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl GenerationProvider for GatedProvider {
    async fn generate(
        &self,
        _request: &GenerationRequest,
    ) -> std::result::Result<Generation, GenerationError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(reply("Released reply"))
    }
}

/// Index that is always offline
pub struct FailingIndex;

#[async_trait]
impl VectorIndex for FailingIndex {
    async fn insert(&self, _record: LongTermRecord) -> Result<()> {
        Err(ChorusError::Other("index offline".to_string()))
    }

    async fn search(
        &self,
        _scope: MemoryScope,
        _query: &[f32],
        _top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        Err(ChorusError::Other("index offline".to_string()))
    }

    async fn count(&self, _scope: MemoryScope) -> Result<usize> {
        Err(ChorusError::Other("index offline".to_string()))
    }
}

/// Hashing embedder that takes `delay` per call
pub struct SlowEmbedder {
    inner: HashingEmbedder,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl SlowEmbedder {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: HashingEmbedder::new(DIM),
            delay,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingService for SlowEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.embed(text).await
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn model_name(&self) -> &str {
        "slow-hashing"
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub storage: Arc<InMemoryStorage>,
    pub index: Arc<InMemoryVectorIndex>,
    pub clock: Arc<ManualClock>,
}

pub fn harness(provider: Arc<dyn GenerationProvider>) -> Harness {
    harness_with(test_config(), provider)
}

pub fn harness_with(config: ChorusConfig, provider: Arc<dyn GenerationProvider>) -> Harness {
    harness_with_embedder(config, provider, Arc::new(HashingEmbedder::new(DIM)))
}

pub fn harness_with_embedder(
    config: ChorusConfig,
    provider: Arc<dyn GenerationProvider>,
    embedder: Arc<dyn EmbeddingService>,
) -> Harness {
    let clock = Arc::new(ManualClock::new(start_time()));
    let clock_dyn: Arc<dyn Clock> = clock.clone();
    let storage = Arc::new(InMemoryStorage::with_clock(clock_dyn.clone()));
    let index = Arc::new(InMemoryVectorIndex::new(DIM));
    let orchestrator = Orchestrator::new(
        config,
        storage.clone(),
        provider,
        embedder,
        index.clone(),
        clock_dyn,
    );
    Harness {
        orchestrator,
        storage,
        index,
        clock,
    }
}

/// Orchestrator over an index that is always offline
pub fn offline_index_harness(provider: Arc<dyn GenerationProvider>) -> Orchestrator {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(start_time()));
    Orchestrator::new(
        test_config(),
        Arc::new(InMemoryStorage::with_clock(clock.clone())),
        provider,
        Arc::new(HashingEmbedder::new(DIM)),
        Arc::new(FailingIndex),
        clock,
    )
}
