//! Cooldown gating through the full pipeline

mod common;

use chorus_core::orchestration::{SkipCause, SkipReason, TriggerVerdict, TurnState};
use chorus_core::storage::CooldownStore;
use chorus_core::types::CooldownKey;
use chorus_core::{Entity, MessageDraft, ResponseStrategy};
use common::{harness, human, ScriptedProvider};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_gate_closed_at_30s_open_at_61s() {
    let provider = Arc::new(ScriptedProvider::new("Sure."));
    let h = harness(provider.clone());
    let alice = human();
    let sage = h
        .orchestrator
        .register_entity(
            Entity::new("Sage", ResponseStrategy::Active).with_cooldown(Duration::from_secs(60)),
        )
        .await
        .unwrap();
    let room = h
        .orchestrator
        .create_room([alice, sage.participant_id()])
        .await
        .unwrap();
    let send = |text: &'static str| MessageDraft::new(alice, "alice", text).in_room(room.id);

    let first = h.orchestrator.ingest(send("first")).await.unwrap();
    assert!(first.wait_all().await[0].committed_message().is_some());

    h.clock.advance(Duration::from_secs(30));
    let second = h.orchestrator.ingest(send("second")).await.unwrap();
    assert!(second.jobs.is_empty());
    match second.evaluations[0].verdict {
        TriggerVerdict::Skip(SkipCause::Cooldown { remaining }) => {
            assert_eq!(remaining, Duration::from_secs(30))
        }
        ref other => panic!("Expected cooldown skip, got {:?}", other),
    }

    h.clock.advance(Duration::from_secs(31));
    let third = h.orchestrator.ingest(send("third")).await.unwrap();
    assert!(third.wait_all().await[0].committed_message().is_some());
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn test_cooldown_is_per_conversation() {
    let h = harness(Arc::new(ScriptedProvider::new("Hi.")));
    let alice = human();
    let sage = h
        .orchestrator
        .register_entity(
            Entity::new("Sage", ResponseStrategy::Active).with_cooldown(Duration::from_secs(60)),
        )
        .await
        .unwrap();
    let lobby = h
        .orchestrator
        .create_room([alice, sage.participant_id()])
        .await
        .unwrap();
    let library = h
        .orchestrator
        .create_room([alice, sage.participant_id()])
        .await
        .unwrap();

    for room in [lobby.id, library.id] {
        let reports = h
            .orchestrator
            .ingest(MessageDraft::new(alice, "alice", "hello").in_room(room))
            .await
            .unwrap()
            .wait_all()
            .await;
        assert!(reports[0].committed_message().is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_burst_within_interval_passes_gate_once() {
    let provider = Arc::new(ScriptedProvider::new("Only once."));
    let h = harness(provider.clone());
    let alice = human();
    let sage = h
        .orchestrator
        .register_entity(
            Entity::new("Sage", ResponseStrategy::Active).with_cooldown(Duration::from_secs(60)),
        )
        .await
        .unwrap();
    let room = h
        .orchestrator
        .create_room([alice, sage.participant_id()])
        .await
        .unwrap();
    let orchestrator = Arc::new(h.orchestrator);

    let mut tasks = Vec::new();
    for i in 0..24 {
        let orchestrator = orchestrator.clone();
        tasks.push(tokio::spawn(async move {
            let receipt = orchestrator
                .ingest(MessageDraft::new(alice, "alice", format!("message {}", i)).in_room(room.id))
                .await
                .unwrap();
            receipt.wait_all().await
        }));
    }

    let mut committed = 0;
    for task in tasks {
        for report in task.await.unwrap() {
            match report.state {
                TurnState::Committed(_) => committed += 1,
                TurnState::Skipped(SkipReason::Cooldown { .. }) => {}
                other => panic!("Unexpected turn outcome: {:?}", other),
            }
        }
    }

    assert_eq!(committed, 1);
    assert_eq!(provider.calls(), 1);

    let entry = h
        .storage
        .get_cooldown(CooldownKey::new(sage.id, room.id))
        .await
        .unwrap()
        .expect("cooldown debited");
    assert_eq!(entry.last_attempt, common::start_time());
}
