//! Response rate of probabilistic entities

mod common;

use chorus_core::orchestration::trigger::evaluate;
use chorus_core::types::RoutingTarget;
use chorus_core::{ConversationId, Entity, Message, MessageDraft, ResponseStrategy};
use common::{harness, human, start_time, ScriptedProvider};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;

#[test]
fn test_rate_converges_for_several_probabilities() {
    let room = ConversationId::new();
    let message = Message::from_draft(
        MessageDraft::new(human(), "alice", "anyone?").in_room(room),
        RoutingTarget::Room(room),
        start_time(),
    );
    let snapshot = HashMap::new();
    let trials = 20_000;

    for (seed, p) in [(1u64, 0.1), (2, 0.5), (3, 0.9)] {
        let entity = Entity::new("Echo", ResponseStrategy::Probabilistic { p });
        let mut rng = StdRng::seed_from_u64(seed);
        let hits = (0..trials)
            .filter(|_| {
                evaluate(&message, std::slice::from_ref(&entity), &snapshot, start_time(), &mut rng)[0]
                    .verdict
                    .is_candidate()
            })
            .count();
        let rate = hits as f64 / trials as f64;
        assert!((rate - p).abs() < 0.02, "p={} observed {}", p, rate);
    }
}

#[test]
fn test_entities_draw_independently() {
    let room = ConversationId::new();
    let message = Message::from_draft(
        MessageDraft::new(human(), "alice", "anyone?").in_room(room),
        RoutingTarget::Room(room),
        start_time(),
    );
    let entities = vec![
        Entity::new("A", ResponseStrategy::Probabilistic { p: 0.5 }),
        Entity::new("B", ResponseStrategy::Probabilistic { p: 0.5 }),
    ];
    let mut rng = StdRng::seed_from_u64(11);
    let trials = 10_000;

    let mut both = 0;
    for _ in 0..trials {
        let evaluations = evaluate(&message, &entities, &HashMap::new(), start_time(), &mut rng);
        if evaluations.iter().all(|e| e.verdict.is_candidate()) {
            both += 1;
        }
    }
    let rate = both as f64 / trials as f64;
    assert!((rate - 0.25).abs() < 0.03, "joint rate {}", rate);
}

#[tokio::test]
async fn test_probability_extremes_through_pipeline() {
    let h = harness(Arc::new(ScriptedProvider::new("Here!")));
    let alice = human();
    let never = h
        .orchestrator
        .register_entity(Entity::new("Never", ResponseStrategy::Probabilistic { p: 0.0 }))
        .await
        .unwrap();
    let always = h
        .orchestrator
        .register_entity(Entity::new("Always", ResponseStrategy::Probabilistic { p: 1.0 }))
        .await
        .unwrap();
    let room = h
        .orchestrator
        .create_room([alice, never.participant_id(), always.participant_id()])
        .await
        .unwrap();

    for i in 0..50 {
        let receipt = h
            .orchestrator
            .ingest(MessageDraft::new(alice, "alice", format!("ping {}", i)).in_room(room.id))
            .await
            .unwrap();
        assert_eq!(receipt.candidates().collect::<Vec<_>>(), vec![always.id]);
        receipt.wait_all().await;
    }
}
