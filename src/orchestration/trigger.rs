//! Response trigger evaluation
//!
//! Decides which entities of a conversation take a turn on a message. Gates
//! run in a fixed order: author, cooldown, strategy. Evaluation is pure and
//! never touches the cooldown ledger.

use crate::types::{Cooldown, CooldownKey, Entity, EntityId, Message, ResponseStrategy};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

/// Why an entity passed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriggerReason {
    /// Listed as an explicit addressee
    Addressed,
    /// Handle appears in the text
    Mentioned,
    /// Probabilistic draw below `p`
    Sampled { sample: f64 },
    Active,
}

/// Why an entity was left out
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipCause {
    OwnMessage,
    Cooldown { remaining: Duration },
    NotMentioned,
    SampleAbove { sample: f64, p: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriggerVerdict {
    Candidate(TriggerReason),
    Skip(SkipCause),
}

impl TriggerVerdict {
    pub fn is_candidate(&self) -> bool {
        matches!(self, TriggerVerdict::Candidate(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub entity_id: EntityId,
    pub verdict: TriggerVerdict,
}

/// Evaluate one entity
pub fn evaluate_entity<R: Rng>(
    message: &Message,
    entity: &Entity,
    last_attempt: Option<&Cooldown>,
    now: DateTime<Utc>,
    rng: &mut R,
) -> TriggerVerdict {
    if message.is_authored_by(entity.id) {
        return TriggerVerdict::Skip(SkipCause::OwnMessage);
    }

    if let Some(entry) = last_attempt {
        let gate = Cooldown {
            last_attempt: entry.last_attempt,
            min_interval: entity.min_interval(),
        };
        if let Some(remaining) = gate.remaining(now) {
            return TriggerVerdict::Skip(SkipCause::Cooldown { remaining });
        }
    }

    match entity.strategy {
        ResponseStrategy::MentionOnly => {
            if message.addressees.contains(&entity.id) {
                TriggerVerdict::Candidate(TriggerReason::Addressed)
            } else if mentions_handle(&message.text, &entity.handle) {
                TriggerVerdict::Candidate(TriggerReason::Mentioned)
            } else {
                TriggerVerdict::Skip(SkipCause::NotMentioned)
            }
        }
        ResponseStrategy::Probabilistic { p } => {
            let sample: f64 = rng.gen();
            if sample < p {
                TriggerVerdict::Candidate(TriggerReason::Sampled { sample })
            } else {
                TriggerVerdict::Skip(SkipCause::SampleAbove { sample, p })
            }
        }
        ResponseStrategy::Active => TriggerVerdict::Candidate(TriggerReason::Active),
    }
}

/// Evaluate every participant entity against a cooldown snapshot
///
/// Each entity draws its own sample, in the order given.
pub fn evaluate<R: Rng>(
    message: &Message,
    entities: &[Entity],
    snapshot: &HashMap<CooldownKey, Cooldown>,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Vec<Evaluation> {
    let conversation_id = message.conversation_id();
    entities
        .iter()
        .map(|entity| {
            let key = CooldownKey::new(entity.id, conversation_id);
            Evaluation {
                entity_id: entity.id,
                verdict: evaluate_entity(message, entity, snapshot.get(&key), now, rng),
            }
        })
        .collect()
}

/// Case-insensitive token match of a (possibly multi-word) handle
///
/// Tokens are runs of letters, digits and underscores, so `@Sage,` matches
/// `Sage` while `Sagebrush` does not.
pub fn mentions_handle(text: &str, handle: &str) -> bool {
    let needle = tokens(handle);
    if needle.is_empty() {
        return false;
    }
    let haystack = tokens(text);
    haystack
        .windows(needle.len())
        .any(|window| window == needle.as_slice())
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConversationId, MessageDraft, ParticipantId, RoutingTarget, UserId};
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn message(text: &str) -> Message {
        let room = ConversationId::new();
        Message::from_draft(
            MessageDraft::new(ParticipantId::Human(UserId::new()), "alice", text).in_room(room),
            RoutingTarget::Room(room),
            t(0),
        )
    }

    #[test]
    fn test_mention_scenario() {
        let sage = Entity::new("Sage", ResponseStrategy::MentionOnly);
        let mut rng = StdRng::seed_from_u64(7);

        let verdict = evaluate_entity(&message("Hey @Sage, thoughts?"), &sage, None, t(0), &mut rng);
        assert_eq!(verdict, TriggerVerdict::Candidate(TriggerReason::Mentioned));

        let verdict = evaluate_entity(&message("no mentions here"), &sage, None, t(0), &mut rng);
        assert_eq!(verdict, TriggerVerdict::Skip(SkipCause::NotMentioned));
    }

    #[test]
    fn test_mentions_handle_tokens() {
        assert!(mentions_handle("what does SAGE think", "Sage"));
        assert!(!mentions_handle("sagebrush everywhere", "Sage"));
        assert!(mentions_handle("ask @Old_Mira about it", "old_mira"));
        assert!(mentions_handle("I asked Doctor Who yesterday", "Doctor Who"));
        assert!(mentions_handle("Doctor, who is there?", "Doctor Who"));
        assert!(!mentions_handle("anything", "  "));
    }

    #[test]
    fn test_addressee_counts_as_mention() {
        let sage = Entity::new("Sage", ResponseStrategy::MentionOnly);
        let mut msg = message("what do you think?");
        msg.addressees.push(sage.id);

        let verdict = evaluate_entity(&msg, &sage, None, t(0), &mut StdRng::seed_from_u64(1));
        assert_eq!(verdict, TriggerVerdict::Candidate(TriggerReason::Addressed));
    }

    #[test]
    fn test_own_message_never_triggers() {
        let sage = Entity::new("Sage", ResponseStrategy::Active);
        let mut msg = message("talking to myself, Sage");
        msg.author = ParticipantId::Entity(sage.id);

        let verdict = evaluate_entity(&msg, &sage, None, t(0), &mut StdRng::seed_from_u64(1));
        assert_eq!(verdict, TriggerVerdict::Skip(SkipCause::OwnMessage));
    }

    #[test]
    fn test_cooldown_gate_before_strategy() {
        let sage = Entity::new("Sage", ResponseStrategy::Active).with_cooldown(Duration::from_secs(60));
        let entry = Cooldown {
            last_attempt: t(0),
            min_interval: Duration::from_secs(60),
        };
        let mut rng = StdRng::seed_from_u64(3);

        let at_30 = evaluate_entity(&message("hi"), &sage, Some(&entry), t(30), &mut rng);
        assert_eq!(
            at_30,
            TriggerVerdict::Skip(SkipCause::Cooldown {
                remaining: Duration::from_secs(30)
            })
        );

        let at_61 = evaluate_entity(&message("hi"), &sage, Some(&entry), t(61), &mut rng);
        assert_eq!(at_61, TriggerVerdict::Candidate(TriggerReason::Active));
    }

    #[test]
    fn test_probabilistic_rate() {
        let entity = Entity::new("Echo", ResponseStrategy::Probabilistic { p: 0.3 });
        let msg = message("hello everyone");
        let mut rng = StdRng::seed_from_u64(42);

        let trials = 10_000;
        let hits = (0..trials)
            .filter(|_| evaluate_entity(&msg, &entity, None, t(0), &mut rng).is_candidate())
            .count();
        let rate = hits as f64 / trials as f64;
        assert!((rate - 0.3).abs() < 0.03, "rate {} too far from 0.3", rate);
    }

    #[test]
    fn test_probability_bounds() {
        let msg = message("hello");
        let mut rng = StdRng::seed_from_u64(9);
        let never = Entity::new("Never", ResponseStrategy::Probabilistic { p: 0.0 });
        let always = Entity::new("Always", ResponseStrategy::Probabilistic { p: 1.0 });

        for _ in 0..1000 {
            assert!(!evaluate_entity(&msg, &never, None, t(0), &mut rng).is_candidate());
            assert!(evaluate_entity(&msg, &always, None, t(0), &mut rng).is_candidate());
        }
    }

    #[test]
    fn test_evaluate_uses_snapshot_per_conversation() {
        let msg = message("hi all");
        let cooling = Entity::new("Cooling", ResponseStrategy::Active).with_cooldown(Duration::from_secs(60));
        let fresh = Entity::new("Fresh", ResponseStrategy::Active).with_cooldown(Duration::from_secs(60));

        let mut snapshot = HashMap::new();
        snapshot.insert(
            CooldownKey::new(cooling.id, msg.conversation_id()),
            Cooldown {
                last_attempt: t(-10),
                min_interval: Duration::from_secs(60),
            },
        );
        // Same entity in another conversation does not matter
        snapshot.insert(
            CooldownKey::new(fresh.id, ConversationId::new()),
            Cooldown {
                last_attempt: t(-10),
                min_interval: Duration::from_secs(60),
            },
        );

        let evaluations = evaluate(
            &msg,
            &[cooling.clone(), fresh.clone()],
            &snapshot,
            t(0),
            &mut StdRng::seed_from_u64(5),
        );
        assert!(!evaluations[0].verdict.is_candidate());
        assert!(evaluations[1].verdict.is_candidate());
    }
}
