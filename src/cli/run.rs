//! `chorus run`: drive a scripted session through the orchestrator

use super::script::{MessageSpec, Script};
use anyhow::{anyhow, Context, Result};
use chorus_core::{
    ChorusConfig, ConversationId, Entity, EntityId, EventType, MessageDraft, Orchestrator,
    ParticipantId, PersonaProfile, TurnReport, TurnState, UserId,
};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Summary {
    sent: usize,
    rejected: usize,
    committed: usize,
    skipped: usize,
    failed: usize,
}

impl Summary {
    fn record(&mut self, report: &TurnReport) {
        match report.state {
            TurnState::Committed(_) => self.committed += 1,
            TurnState::Skipped(_) => self.skipped += 1,
            TurnState::Failed(_) => self.failed += 1,
            _ => {}
        }
    }
}

/// Participant lookups by script name
struct Cast {
    participants: HashMap<String, ParticipantId>,
    entities: HashMap<String, EntityId>,
    rooms: HashMap<String, ConversationId>,
}

impl Cast {
    fn participant(&self, name: &str) -> Result<ParticipantId> {
        self.participants
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("Unknown participant '{}'", name))
    }

    fn draft(&self, spec: &MessageSpec) -> Result<MessageDraft> {
        let mut draft = MessageDraft::new(self.participant(&spec.from)?, spec.from.clone(), spec.text.clone());
        if let Some(room) = &spec.room {
            let id = self
                .rooms
                .get(room)
                .ok_or_else(|| anyhow!("Unknown room '{}'", room))?;
            draft = draft.in_room(*id);
        }
        if let Some(peer) = &spec.to {
            draft = draft.to_peer(self.participant(peer)?);
        }
        if let Some(group) = &spec.group {
            let members = group
                .iter()
                .map(|name| self.participant(name))
                .collect::<Result<Vec<_>>>()?;
            draft = draft.to_group(members);
        }
        for name in &spec.addressing {
            let id = self
                .entities
                .get(name)
                .ok_or_else(|| anyhow!("Unknown entity '{}'", name))?;
            draft = draft.addressing(*id);
        }
        Ok(draft)
    }
}

fn entity_from_spec(spec: &super::script::EntitySpec) -> Entity {
    let mut entity = Entity::new(spec.handle.clone(), spec.strategy).with_persona(PersonaProfile {
        base_persona: spec.base_persona.clone(),
        speaking_style: spec.speaking_style.clone(),
        example_exchanges: spec.example_exchanges.clone(),
        guidelines: spec.guidelines.clone(),
        documents: Vec::new(),
    });
    if let Some(secs) = spec.cooldown_secs {
        entity = entity.with_cooldown(Duration::from_secs_f64(secs.max(0.0)));
    }
    if let Some(temperature) = spec.temperature {
        entity.temperature = temperature;
    }
    if let Some(max_tokens) = spec.max_tokens {
        entity.max_tokens = max_tokens;
    }
    entity
}

/// Handle `chorus run`
pub async fn handle(config: ChorusConfig, script_path: &Path) -> Result<()> {
    let script = Script::load(script_path)?;
    let base_dir = script_path.parent().unwrap_or_else(|| Path::new("."));
    let orchestrator = Orchestrator::from_config(config).context("Failed to start orchestrator")?;

    let mut cast = Cast {
        participants: HashMap::new(),
        entities: HashMap::new(),
        rooms: HashMap::new(),
    };
    for human in &script.humans {
        cast.participants
            .insert(human.name.clone(), ParticipantId::Human(UserId::new()));
    }
    for spec in &script.entities {
        let entity = orchestrator.register_entity(entity_from_spec(spec)).await?;
        cast.participants
            .insert(spec.handle.clone(), entity.participant_id());
        cast.entities.insert(spec.handle.clone(), entity.id);
    }
    for document in &script.documents {
        let text = Script::document_text(document, base_dir)?;
        let entity_id = *cast
            .entities
            .get(&document.entity)
            .ok_or_else(|| anyhow!("Unknown entity '{}'", document.entity))?;
        let records = orchestrator
            .ingest_personality(entity_id, &document.name, &text)
            .await
            .with_context(|| format!("Failed to upload document '{}'", document.name))?;
        info!(document = %document.name, chunks = records.len(), "Uploaded personality document");
    }

    let mut room_names = HashMap::new();
    for room in &script.rooms {
        let members = room
            .members
            .iter()
            .map(|name| cast.participant(name))
            .collect::<Result<Vec<_>>>()?;
        let conversation = orchestrator.create_room(members).await?;
        cast.rooms.insert(room.name.clone(), conversation.id);
        room_names.insert(conversation.id, room.name.clone());
    }

    let printer = spawn_printer(&orchestrator, room_names);

    let mut summary = Summary::default();
    let mut pending = Vec::new();
    for (i, spec) in script.messages.iter().enumerate() {
        let draft = cast.draft(spec)?;
        match orchestrator.ingest(draft).await {
            Ok(receipt) => {
                summary.sent += 1;
                debug!(
                    step = i + 1,
                    candidates = receipt.jobs.len(),
                    queue_depth = orchestrator.queue_depth(),
                    "Message ingested"
                );
                if spec.wait {
                    for report in receipt.wait_all().await {
                        summary.record(&report);
                    }
                } else {
                    pending.push(receipt);
                }
            }
            Err(e) if e.is_user_visible() => {
                summary.rejected += 1;
                eprintln!("Message {} rejected: {}", i + 1, e);
            }
            Err(e) => return Err(e.into()),
        }
    }

    let (queued, active) = (orchestrator.queue_depth(), orchestrator.active_jobs());
    for receipt in pending {
        for report in receipt.wait_all().await {
            summary.record(&report);
        }
    }
    orchestrator.shutdown().await;
    drop(orchestrator);
    if let Err(e) = printer.await {
        warn!(error = %e, "Event printer ended abnormally");
    }

    println!();
    println!("Session summary");
    println!("   Messages sent:   {}", summary.sent);
    println!("   Rejected:        {}", summary.rejected);
    println!("   Turns committed: {}", summary.committed);
    println!("   Turns skipped:   {}", summary.skipped);
    println!("   Turns failed:    {}", summary.failed);
    println!("   Still queued / active at end of script: {} / {}", queued, active);
    Ok(())
}

fn spawn_printer(
    orchestrator: &Orchestrator,
    room_names: HashMap<ConversationId, String>,
) -> tokio::task::JoinHandle<()> {
    let mut rx = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match event.event_type {
                    EventType::MessagePosted {
                        conversation_id,
                        message,
                        ..
                    } => {
                        let place = room_names
                            .get(&conversation_id)
                            .cloned()
                            .unwrap_or_else(|| message.target.kind().to_string());
                        println!("[{}] {}: {}", place, message.author_name, message.text);
                    }
                    EventType::TurnFailed { error, .. } => {
                        println!("   (turn failed: {})", error);
                    }
                    EventType::MemoryCompacted { evicted, .. } => {
                        debug!(evicted, "Memory compacted");
                    }
                    EventType::TurnSkipped { .. } => {}
                },
                Err(RecvError::Lagged(missed)) => warn!(missed, "Event printer fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
