//! Tiered memory for conversations and entities
//!
//! - Short-term: the last K turns of every conversation, held in a
//!   per-conversation window guarded by its own lock.
//! - Long-term: append-only, similarity-searchable records. A conversation's
//!   scope receives summaries of turns evicted from its window; an entity's
//!   personality scope receives chunks of uploaded knowledge documents.
//!
//! Appending only touches the window. When the window goes over K the append
//! hands back a `CompactionJob` owning the oldest turns; the caller runs it
//! elsewhere. At most one job per conversation is outstanding, and its turns
//! leave the window only after the summary record is in the index.
//!
//! While the index stays unreachable the window keeps growing until
//! `COMPACTION_FAILURES_BEFORE_TRIM` consecutive jobs have failed; from then
//! on the oldest turns above `MemoryConfig::window_hard_limit` are dropped.

pub mod index;
pub mod short_term;

pub use index::{InMemoryVectorIndex, VectorIndex};
pub use short_term::ShortTermWindow;

use crate::clock::Clock;
use crate::config::{KeywordConfig, MemoryConfig};
use crate::error::{ChorusError, Result};
use crate::services::EmbeddingService;
use crate::text::{summarize_turns, KeywordExtractor, TextChunker};
use crate::types::{
    ConversationId, EntityId, LongTermRecord, MemoryScope, Provenance, RecordId, SearchHit,
    ShortTermTurn,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};

/// Keywords carried into a summary sentence
const SUMMARY_KEYWORDS: usize = 5;

/// Consecutive failed compactions after which the window is capped
pub const COMPACTION_FAILURES_BEFORE_TRIM: u32 = 3;

/// Outcome of a finished compaction
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionReport {
    pub record_id: RecordId,
    pub evicted: usize,
    pub remaining: usize,
}

#[derive(Default)]
struct WindowSlot {
    window: ShortTermWindow,
    /// Set while a job owns the oldest turns
    compacting: bool,
    failures: u32,
    /// Conversation deleted; nothing is appended any more
    retired: bool,
}

type SlotHandle = Arc<AsyncMutex<WindowSlot>>;

#[derive(Default)]
struct Windows {
    live: HashMap<ConversationId, SlotHandle>,
    forgotten: HashSet<ConversationId>,
}

/// The oldest turns of a window, claimed for summarization
pub struct CompactionJob {
    conversation_id: ConversationId,
    slot: SlotHandle,
    batch: Vec<ShortTermTurn>,
}

impl CompactionJob {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

impl std::fmt::Debug for CompactionJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionJob")
            .field("conversation_id", &self.conversation_id)
            .field("turns", &self.batch.len())
            .finish()
    }
}

/// Owner of all short-term windows and long-term records
pub struct MemoryStore {
    config: MemoryConfig,
    windows: Mutex<Windows>,
    /// Signalled whenever a conversation's compaction goes idle
    idle: Notify,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingService>,
    keywords: KeywordExtractor,
    chunker: TextChunker,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(
        config: MemoryConfig,
        keyword_config: KeywordConfig,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let chunker = TextChunker::new(config.chunk_size, config.chunk_overlap);
        Self {
            config,
            windows: Mutex::new(Windows::default()),
            idle: Notify::new(),
            index,
            embedder,
            keywords: KeywordExtractor::new(keyword_config),
            chunker,
            clock,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    fn slot_for_append(&self, conversation_id: ConversationId) -> Result<SlotHandle> {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        if windows.forgotten.contains(&conversation_id) {
            return Err(ChorusError::ConversationNotFound(conversation_id));
        }
        Ok(windows.live.entry(conversation_id).or_default().clone())
    }

    fn live_slot(&self, conversation_id: ConversationId) -> Option<SlotHandle> {
        let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows.live.get(&conversation_id).cloned()
    }

    /// Append a turn to the conversation's window
    ///
    /// Returns a job when the window is over K and no compaction is already
    /// running for it. Fails with `ConversationNotFound` once the
    /// conversation has been forgotten.
    pub async fn append_turn(
        &self,
        conversation_id: ConversationId,
        turn: ShortTermTurn,
    ) -> Result<Option<CompactionJob>> {
        let handle = self.slot_for_append(conversation_id)?;
        let mut slot = handle.lock().await;
        if slot.retired {
            return Err(ChorusError::ConversationNotFound(conversation_id));
        }

        slot.window.push(turn);
        self.trim_after_failures(conversation_id, &mut slot);
        Ok(self.claim(conversation_id, &handle, &mut slot))
    }

    fn claim(
        &self,
        conversation_id: ConversationId,
        handle: &SlotHandle,
        slot: &mut WindowSlot,
    ) -> Option<CompactionJob> {
        if slot.compacting || slot.retired {
            return None;
        }
        let count = slot.window.eviction_size(
            self.config.short_term_window,
            self.config.compaction_batch(),
        )?;

        slot.compacting = true;
        Some(CompactionJob {
            conversation_id,
            slot: handle.clone(),
            batch: slot.window.oldest(count),
        })
    }

    fn trim_after_failures(&self, conversation_id: ConversationId, slot: &mut WindowSlot) {
        if slot.compacting || slot.failures < COMPACTION_FAILURES_BEFORE_TRIM {
            return;
        }
        let excess = slot
            .window
            .len()
            .saturating_sub(self.config.window_hard_limit());
        if excess == 0 {
            return;
        }

        let dropped = slot.window.evict(excess);
        warn!(
            conversation_id = %conversation_id,
            dropped,
            failures = slot.failures,
            "Long-term memory unreachable, dropped oldest short-term turns"
        );
    }

    /// Summarize the job's turns into long-term memory, then evict them
    ///
    /// No window lock is held while embedding or writing the record. On
    /// failure the turns stay in the window and the next append retries.
    pub async fn compact(&self, job: &CompactionJob) -> Result<CompactionReport> {
        let written = self.write_summary(job).await;
        let mut slot = job.slot.lock().await;

        match written {
            Ok(record_id) => {
                slot.failures = 0;
                let evicted = slot.window.evict(job.batch.len());
                info!(
                    conversation_id = %job.conversation_id,
                    evicted,
                    remaining = slot.window.len(),
                    "Compacted short-term window into long-term memory"
                );
                Ok(CompactionReport {
                    record_id,
                    evicted,
                    remaining: slot.window.len(),
                })
            }
            Err(e) => {
                slot.failures = slot.failures.saturating_add(1);
                Err(e)
            }
        }
    }

    async fn write_summary(&self, job: &CompactionJob) -> Result<RecordId> {
        let record = self.summarize_batch(job.conversation_id, &job.batch).await?;
        let record_id = record.id;
        self.index.insert(record).await?;
        Ok(record_id)
    }

    /// Release the job's claim on its window
    ///
    /// After a successful job a window still over K yields the next job
    /// straight away; otherwise the conversation goes idle.
    pub async fn finish_compaction(
        &self,
        job: CompactionJob,
        succeeded: bool,
    ) -> Option<CompactionJob> {
        let next = {
            let mut slot = job.slot.lock().await;
            slot.compacting = false;
            if succeeded {
                self.claim(job.conversation_id, &job.slot, &mut slot)
            } else {
                None
            }
        };

        if next.is_none() {
            self.idle.notify_waiters();
        }
        next
    }

    /// Wait until no compaction is running for the conversation
    pub async fn settled(&self, conversation_id: ConversationId) {
        loop {
            let idle = self.idle.notified();
            let busy = match self.live_slot(conversation_id) {
                Some(handle) => handle.lock().await.compacting,
                None => false,
            };
            if !busy {
                return;
            }
            idle.await;
        }
    }

    async fn summarize_batch(
        &self,
        conversation_id: ConversationId,
        batch: &[ShortTermTurn],
    ) -> Result<LongTermRecord> {
        let (first, last) = match (batch.first(), batch.last()) {
            (Some(first), Some(last)) => (first.message_id, last.message_id),
            _ => return Err(ChorusError::Other("empty compaction batch".to_string())),
        };

        let transcript = batch
            .iter()
            .map(|t| format!("{}: {}", t.author_name, t.text))
            .collect::<Vec<_>>()
            .join("\n");
        let keywords = self
            .keywords
            .extract_keywords(&transcript, usize::MAX);
        let summary_keywords: Vec<String> =
            keywords.iter().take(SUMMARY_KEYWORDS).cloned().collect();
        let summary = summarize_turns(batch, &summary_keywords);

        let excerpt = truncate_chars(&transcript, self.config.summary_excerpt_chars);
        let text = if excerpt.is_empty() {
            summary
        } else {
            format!("{}\n{}", summary, excerpt)
        };

        let embedding = self.embedder.embed(&text).await?;

        Ok(LongTermRecord {
            id: RecordId::new(),
            scope: MemoryScope::Conversation(conversation_id),
            text,
            keywords,
            embedding,
            created_at: self.clock.now(),
            provenance: Provenance::EvictedWindow {
                first_message: first,
                last_message: last,
                message_count: batch.len(),
            },
        })
    }

    /// Current short-term window, oldest first
    pub async fn window(&self, conversation_id: ConversationId) -> Vec<ShortTermTurn> {
        match self.live_slot(conversation_id) {
            Some(handle) => handle.lock().await.window.turns(),
            None => Vec::new(),
        }
    }

    /// Similarity search in one scope
    ///
    /// Any embedding or index failure is reported as `MemoryStoreUnavailable`.
    pub async fn search(
        &self,
        scope: MemoryScope,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        if top_k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let embedding = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| ChorusError::MemoryStoreUnavailable(e.to_string()))?;

        self.index
            .search(scope, &embedding, top_k)
            .await
            .map_err(|e| ChorusError::MemoryStoreUnavailable(e.to_string()))
    }

    /// Chunk, embed and store a personality knowledge document
    ///
    /// Nothing is stored if embedding fails.
    pub async fn ingest_personality(
        &self,
        entity_id: EntityId,
        document: &str,
        text: &str,
    ) -> Result<Vec<RecordId>> {
        let chunks = self.chunker.chunk_text(text);
        if chunks.is_empty() {
            debug!(entity_id = %entity_id, document, "Document produced no chunks");
            return Ok(Vec::new());
        }

        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let embeddings = self.embedder.embed_batch(&refs).await?;
        if embeddings.len() != chunks.len() {
            return Err(ChorusError::Embedding(format!(
                "Expected {} embeddings, got {}",
                chunks.len(),
                embeddings.len()
            )));
        }

        let total_chunks = chunks.len();
        let now = self.clock.now();
        let mut ids = Vec::with_capacity(total_chunks);

        for (chunk_index, (chunk, embedding)) in chunks.into_iter().zip(embeddings).enumerate() {
            let record = LongTermRecord {
                id: RecordId::new(),
                scope: MemoryScope::Personality(entity_id),
                keywords: self
                    .keywords
                    .extract_keywords(&chunk, SUMMARY_KEYWORDS),
                text: chunk,
                embedding,
                created_at: now,
                provenance: Provenance::PersonalityDocument {
                    document: document.to_string(),
                    chunk_index,
                    total_chunks,
                },
            };
            ids.push(record.id);
            self.index.insert(record).await?;
        }

        info!(
            entity_id = %entity_id,
            document,
            chunks = total_chunks,
            "Ingested personality document"
        );
        Ok(ids)
    }

    pub async fn long_term_count(&self, scope: MemoryScope) -> Result<usize> {
        self.index.count(scope).await
    }

    /// Drop the short-term window of a deleted conversation
    ///
    /// Later appends for the conversation are refused. A compaction already
    /// running still writes its summary.
    pub async fn forget_conversation(&self, conversation_id: ConversationId) {
        let removed = {
            let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
            windows.forgotten.insert(conversation_id);
            windows.live.remove(&conversation_id)
        };

        if let Some(handle) = removed {
            let mut slot = handle.lock().await;
            slot.retired = true;
            slot.window = ShortTermWindow::default();
            debug!(conversation_id = %conversation_id, "Dropped short-term window");
        }
        self.idle.notify_waiters();
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
        out.push_str("...");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::services::HashingEmbedder;
    use crate::types::{MessageId, ParticipantId, UserId};
    use async_trait::async_trait;
    use chrono::Utc;

    struct BrokenEmbedder;

    #[async_trait]
    impl EmbeddingService for BrokenEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(ChorusError::Embedding("offline".to_string()))
        }

        fn dimensions(&self) -> usize {
            8
        }

        fn model_name(&self) -> &str {
            "broken"
        }
    }

    fn store_with(window: usize, embedder: Arc<dyn EmbeddingService>) -> (MemoryStore, Arc<InMemoryVectorIndex>) {
        let index = Arc::new(InMemoryVectorIndex::new(embedder.dimensions()));
        let config = MemoryConfig {
            short_term_window: window,
            ..MemoryConfig::default()
        };
        let store = MemoryStore::new(
            config,
            KeywordConfig::default(),
            index.clone(),
            embedder,
            Arc::new(SystemClock),
        );
        (store, index)
    }

    fn turn(text: &str) -> ShortTermTurn {
        ShortTermTurn {
            message_id: MessageId::new(),
            author: ParticipantId::Human(UserId::new()),
            author_name: "alice".to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
        }
    }

    async fn run(store: &MemoryStore, job: CompactionJob) -> (Result<CompactionReport>, Option<CompactionJob>) {
        let result = store.compact(&job).await;
        let next = store.finish_compaction(job, result.is_ok()).await;
        (result, next)
    }

    #[tokio::test]
    async fn test_compaction_writes_one_record_per_batch() {
        let (store, index) = store_with(4, Arc::new(HashingEmbedder::new(32)));
        let conversation = ConversationId::new();

        for i in 0..4 {
            let job = store
                .append_turn(conversation, turn(&format!("message number {}", i)))
                .await
                .unwrap();
            assert!(job.is_none());
        }

        let job = store
            .append_turn(conversation, turn("the fifth message"))
            .await
            .unwrap()
            .expect("window over capacity must yield a job");
        // Batch defaults to K / 2 = 2; nothing leaves before the record exists
        assert_eq!(job.len(), 2);
        assert_eq!(store.window(conversation).await.len(), 5);

        let (report, next) = run(&store, job).await;
        let report = report.unwrap();
        assert!(next.is_none());
        assert_eq!(report.evicted, 2);
        assert_eq!(report.remaining, 3);
        assert_eq!(store.window(conversation).await.len(), 3);

        let records = index.records(MemoryScope::Conversation(conversation)).await;
        assert_eq!(records.len(), 1);
        assert!(matches!(
            records[0].provenance,
            Provenance::EvictedWindow { message_count: 2, .. }
        ));
        assert!(records[0].text.contains("message number 0"));
    }

    #[tokio::test]
    async fn test_one_job_per_window_at_a_time() {
        let (store, index) = store_with(2, Arc::new(HashingEmbedder::new(32)));
        let conversation = ConversationId::new();

        store.append_turn(conversation, turn("one")).await.unwrap();
        store.append_turn(conversation, turn("two")).await.unwrap();
        let job = store
            .append_turn(conversation, turn("three"))
            .await
            .unwrap()
            .unwrap();
        // Appends during a running job are not blocked and claim nothing
        assert!(store.append_turn(conversation, turn("four")).await.unwrap().is_none());

        let (_, next) = run(&store, job).await;
        let follow_up = next.expect("window still over K after the first batch");
        let (_, next) = run(&store, follow_up).await;
        assert!(next.is_none());

        let remaining: Vec<String> = store
            .window(conversation)
            .await
            .into_iter()
            .map(|t| t.text)
            .collect();
        assert_eq!(remaining, vec!["three".to_string(), "four".to_string()]);
        assert_eq!(
            index.count(MemoryScope::Conversation(conversation)).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_failed_compaction_keeps_turns() {
        let (store, index) = store_with(2, Arc::new(BrokenEmbedder));
        let conversation = ConversationId::new();

        store.append_turn(conversation, turn("one")).await.unwrap();
        store.append_turn(conversation, turn("two")).await.unwrap();
        let job = store
            .append_turn(conversation, turn("three"))
            .await
            .unwrap()
            .unwrap();

        let (result, next) = run(&store, job).await;
        assert!(result.is_err());
        assert!(next.is_none());
        assert_eq!(store.window(conversation).await.len(), 3);
        assert_eq!(
            index.count(MemoryScope::Conversation(conversation)).await.unwrap(),
            0
        );

        // The next append retries
        assert!(store.append_turn(conversation, turn("four")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_repeated_failures_cap_the_window() {
        let (store, _) = store_with(2, Arc::new(BrokenEmbedder));
        let conversation = ConversationId::new();
        let hard_limit = store.config().window_hard_limit();
        let mut longest = 0;

        for i in 0..30 {
            if let Some(job) = store
                .append_turn(conversation, turn(&format!("turn {}", i)))
                .await
                .unwrap()
            {
                assert!(job.len() <= hard_limit);
                let (result, _) = run(&store, job).await;
                assert!(result.is_err());
            }
            longest = longest.max(store.window(conversation).await.len());
        }

        let window = store.window(conversation).await;
        assert_eq!(window.len(), hard_limit);
        assert_eq!(window.last().unwrap().text, "turn 29");
        assert!(longest <= hard_limit + COMPACTION_FAILURES_BEFORE_TRIM as usize);
    }

    #[tokio::test]
    async fn test_forgotten_conversation_refuses_appends() {
        let (store, _) = store_with(4, Arc::new(HashingEmbedder::new(32)));
        let conversation = ConversationId::new();
        store.append_turn(conversation, turn("before")).await.unwrap();

        store.forget_conversation(conversation).await;

        assert!(matches!(
            store.append_turn(conversation, turn("after")).await,
            Err(ChorusError::ConversationNotFound(_))
        ));
        assert!(store.window(conversation).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_waits_for_running_job() {
        let (store, index) = store_with(2, Arc::new(HashingEmbedder::new(32)));
        let store = Arc::new(store);
        let conversation = ConversationId::new();

        for text in ["one", "two"] {
            store.append_turn(conversation, turn(text)).await.unwrap();
        }
        let job = store
            .append_turn(conversation, turn("three"))
            .await
            .unwrap()
            .unwrap();

        let worker = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            run(&worker, job).await;
        });

        store.settled(conversation).await;
        assert_eq!(store.window(conversation).await.len(), 2);
        assert_eq!(
            index.count(MemoryScope::Conversation(conversation)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_search_failure_maps_to_unavailable() {
        let (store, _) = store_with(4, Arc::new(BrokenEmbedder));
        let result = store
            .search(MemoryScope::Conversation(ConversationId::new()), "anything", 3)
            .await;
        assert!(matches!(result, Err(ChorusError::MemoryStoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_ingest_personality_chunks_document() {
        let (store, index) = store_with(4, Arc::new(HashingEmbedder::new(32)));
        let entity = EntityId::new();
        let document = "Sage studied astronomy for decades. ".repeat(40);

        let ids = store
            .ingest_personality(entity, "astronomy.txt", &document)
            .await
            .unwrap();

        assert!(ids.len() > 1);
        let records = index.records(MemoryScope::Personality(entity)).await;
        assert_eq!(records.len(), ids.len());
        for (i, record) in records.iter().enumerate() {
            assert_eq!(
                record.provenance,
                Provenance::PersonalityDocument {
                    document: "astronomy.txt".to_string(),
                    chunk_index: i,
                    total_chunks: ids.len(),
                }
            );
        }

        let hits = store
            .search(MemoryScope::Personality(entity), "astronomy", 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_ingest_empty_or_failing_document_stores_nothing() {
        let (store, _) = store_with(4, Arc::new(HashingEmbedder::new(32)));
        let entity = EntityId::new();
        assert!(store.ingest_personality(entity, "empty", "  \n").await.unwrap().is_empty());

        let (broken, index) = store_with(4, Arc::new(BrokenEmbedder));
        assert!(broken.ingest_personality(entity, "doc", "some text").await.is_err());
        assert_eq!(index.count(MemoryScope::Personality(entity)).await.unwrap(), 0);
    }
}
