//! Short-term window eviction into long-term memory

mod common;

use chorus_core::events::EventType;
use chorus_core::types::{MemoryScope, Provenance};
use chorus_core::memory::COMPACTION_FAILURES_BEFORE_TRIM;
use chorus_core::{Entity, MessageDraft, ResponseStrategy};
use common::{
    harness, harness_with_embedder, human, offline_index_harness, test_config, ScriptedProvider,
    SlowEmbedder,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test]
async fn test_overflow_evicts_one_batch_into_one_record() {
    let h = harness(Arc::new(ScriptedProvider::new("unused")));
    let alice = human();
    let sage = h
        .orchestrator
        .register_entity(Entity::new("Sage", ResponseStrategy::MentionOnly))
        .await
        .unwrap();
    let room = h
        .orchestrator
        .create_room([alice, sage.participant_id()])
        .await
        .unwrap();
    let scope = MemoryScope::Conversation(room.id);
    let mut rx = h.orchestrator.subscribe();

    // K = 6, default batch K/2 = 3
    let mut ids = Vec::new();
    for i in 1..=6 {
        let receipt = h
            .orchestrator
            .ingest(MessageDraft::new(alice, "alice", format!("telescope note {}", i)).in_room(room.id))
            .await
            .unwrap();
        ids.push(receipt.message.id);
    }
    assert_eq!(h.orchestrator.memory().window(room.id).await.len(), 6);
    assert!(h.index.records(scope).await.is_empty());

    let seventh = h
        .orchestrator
        .ingest(MessageDraft::new(alice, "alice", "telescope note 7").in_room(room.id))
        .await
        .unwrap();
    h.orchestrator.memory().settled(room.id).await;

    let window = h.orchestrator.memory().window(room.id).await;
    assert_eq!(window.len(), 4);
    assert_eq!(window[0].message_id, ids[3]);
    assert_eq!(window.last().unwrap().message_id, seventh.message.id);

    let records = h.index.records(scope).await;
    assert_eq!(records.len(), 1);
    match &records[0].provenance {
        Provenance::EvictedWindow {
            first_message,
            last_message,
            message_count,
        } => {
            assert_eq!(*first_message, ids[0]);
            assert_eq!(*last_message, ids[2]);
            assert_eq!(*message_count, 3);
        }
        other => panic!("Unexpected provenance: {:?}", other),
    }
    assert!(records[0].text.contains("telescope note 1"));

    let mut compacted = 0;
    while let Ok(event) = rx.try_recv() {
        if let EventType::MemoryCompacted { evicted, .. } = event.event_type {
            assert_eq!(evicted, 3);
            compacted += 1;
        }
    }
    assert_eq!(compacted, 1);
}

#[tokio::test]
async fn test_window_never_exceeds_capacity() {
    let h = harness(Arc::new(ScriptedProvider::new("Noted.")));
    let alice = human();
    let sage = h
        .orchestrator
        .register_entity(Entity::new("Sage", ResponseStrategy::Active))
        .await
        .unwrap();
    let room = h
        .orchestrator
        .create_room([alice, sage.participant_id()])
        .await
        .unwrap();

    for i in 0..20 {
        h.orchestrator
            .ingest(MessageDraft::new(alice, "alice", format!("entry {}", i)).in_room(room.id))
            .await
            .unwrap()
            .wait_all()
            .await;
        h.orchestrator.memory().settled(room.id).await;
        assert!(h.orchestrator.memory().window(room.id).await.len() <= 6);
    }

    // 40 turns in, every eviction was a single record
    let records = h.index.records(MemoryScope::Conversation(room.id)).await;
    let evicted: usize = records
        .iter()
        .map(|r| match r.provenance {
            Provenance::EvictedWindow { message_count, .. } => message_count,
            _ => 0,
        })
        .sum();
    let window = h.orchestrator.memory().window(room.id).await.len();
    assert_eq!(evicted + window, 40);
}

#[tokio::test]
async fn test_compacted_history_is_retrieved_later() {
    let provider = Arc::new(ScriptedProvider::new("I remember."));
    let h = harness(provider.clone());
    let alice = human();
    let sage = h
        .orchestrator
        .register_entity(Entity::new("Sage", ResponseStrategy::MentionOnly))
        .await
        .unwrap();
    let room = h
        .orchestrator
        .create_room([alice, sage.participant_id()])
        .await
        .unwrap();

    for i in 0..7 {
        h.orchestrator
            .ingest(MessageDraft::new(alice, "alice", format!("my cat Pixel knocked over vase {}", i)).in_room(room.id))
            .await
            .unwrap();
    }
    h.orchestrator.memory().settled(room.id).await;
    h.orchestrator
        .ingest(MessageDraft::new(alice, "alice", "Sage, what did my cat break?").in_room(room.id))
        .await
        .unwrap()
        .wait_all()
        .await;

    let prompt = &provider.requests()[0].system_prompt;
    assert!(prompt.contains("## Past Interactions:"));
}

#[tokio::test]
async fn test_deleted_conversation_forgets_window_but_keeps_records() {
    let h = harness(Arc::new(ScriptedProvider::new("unused")));
    let (alice, bob) = (human(), human());
    let room = h.orchestrator.create_room([alice, bob]).await.unwrap();

    for i in 0..7 {
        h.orchestrator
            .ingest(MessageDraft::new(alice, "alice", format!("line {}", i)).in_room(room.id))
            .await
            .unwrap();
    }
    h.orchestrator.memory().settled(room.id).await;
    h.orchestrator.delete_conversation(room.id).await.unwrap();

    assert!(h.orchestrator.memory().window(room.id).await.is_empty());
    assert_eq!(h.index.records(MemoryScope::Conversation(room.id)).await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ingest_does_not_wait_for_compaction() {
    let embedder = Arc::new(SlowEmbedder::new(Duration::from_secs(20)));
    let h = harness_with_embedder(
        test_config(),
        Arc::new(ScriptedProvider::new("unused")),
        embedder.clone(),
    );
    let (alice, bob) = (human(), human());
    let room = h.orchestrator.create_room([alice, bob]).await.unwrap();

    // K = 6; the seventh message starts a compaction
    for i in 0..7 {
        let started = Instant::now();
        h.orchestrator
            .ingest(MessageDraft::new(alice, "alice", format!("slow note {}", i)).in_room(room.id))
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO, "ingest {} waited", i);
    }
    assert_eq!(h.orchestrator.memory().window(room.id).await.len(), 7);

    let started = Instant::now();
    h.orchestrator.memory().settled(room.id).await;
    assert!(started.elapsed() >= Duration::from_secs(20));
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.orchestrator.memory().window(room.id).await.len(), 4);
    assert_eq!(h.index.records(MemoryScope::Conversation(room.id)).await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_appends_during_slow_compaction_are_kept() {
    let h = harness_with_embedder(
        test_config(),
        Arc::new(ScriptedProvider::new("unused")),
        Arc::new(SlowEmbedder::new(Duration::from_secs(20))),
    );
    let (alice, bob) = (human(), human());
    let room = h.orchestrator.create_room([alice, bob]).await.unwrap();

    for i in 0..7 {
        h.orchestrator
            .ingest(MessageDraft::new(alice, "alice", format!("line {}", i)).in_room(room.id))
            .await
            .unwrap();
    }
    // Let the compaction reach the embedder, then keep talking
    tokio::time::sleep(Duration::from_secs(5)).await;
    let mut late = Vec::new();
    for i in 7..10 {
        let receipt = h
            .orchestrator
            .ingest(MessageDraft::new(alice, "alice", format!("line {}", i)).in_room(room.id))
            .await
            .unwrap();
        late.push(receipt.message.id);
    }

    h.orchestrator.memory().settled(room.id).await;
    let window = h.orchestrator.memory().window(room.id).await;
    assert!(window.len() <= 6);
    let kept: Vec<_> = window.iter().map(|t| t.message_id).collect();
    for id in late {
        assert!(kept.contains(&id));
    }

    let evicted: usize = h
        .index
        .records(MemoryScope::Conversation(room.id))
        .await
        .iter()
        .map(|r| match r.provenance {
            Provenance::EvictedWindow { message_count, .. } => message_count,
            _ => 0,
        })
        .sum();
    assert_eq!(evicted + window.len(), 10);
}

#[tokio::test]
async fn test_offline_index_caps_window() {
    let orchestrator = offline_index_harness(Arc::new(ScriptedProvider::new("unused")));
    let (alice, bob) = (human(), human());
    let room = orchestrator.create_room([alice, bob]).await.unwrap();
    let hard_limit = orchestrator.config().memory.window_hard_limit();
    let mut longest = 0;

    for i in 0..40 {
        orchestrator
            .ingest(MessageDraft::new(alice, "alice", format!("entry {}", i)).in_room(room.id))
            .await
            .unwrap();
        orchestrator.memory().settled(room.id).await;
        longest = longest.max(orchestrator.memory().window(room.id).await.len());
    }

    let window = orchestrator.memory().window(room.id).await;
    assert_eq!(window.len(), hard_limit);
    assert_eq!(window.last().unwrap().text, "entry 39");
    assert!(longest <= hard_limit + COMPACTION_FAILURES_BEFORE_TRIM as usize);
}
