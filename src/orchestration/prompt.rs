//! Provider request rendering
//!
//! Turns an entity's persona and an [`AssembledContext`] into the system
//! prompt plus ordered conversation payload the provider receives.

use crate::orchestration::assembler::{AssembledContext, Tier};
use crate::services::{ContextMessage, GenerationRequest};
use crate::types::Entity;

const MEMORY_HEADER: &str = "# YOUR MEMORY LAYERS\n\
Use these memories to personalize your responses and maintain conversation continuity:";

const PERSONALITY_HEADER: &str = "## Your Core Knowledge & Perspective:\n\
These reflect who you are. Let them shape your opinions and tone.";

const LONG_TERM_HEADER: &str = "## Past Interactions:\n\
Earlier parts of this conversation. Refer back to them when relevant.";

/// Build the system prompt for one turn
pub fn build_system_prompt(entity: &Entity, context: &AssembledContext) -> String {
    let persona = &entity.persona;
    let mut sections: Vec<String> = Vec::new();

    let base = persona.base_persona.trim();
    if base.is_empty() {
        sections.push(format!("You are {}.", entity.handle));
    } else {
        sections.push(format!("You are {}. {}", entity.handle, base));
    }

    for fragment in [
        &persona.speaking_style,
        &persona.example_exchanges,
        &persona.guidelines,
    ]
    .into_iter()
    .flatten()
    {
        let fragment = fragment.trim();
        if !fragment.is_empty() {
            sections.push(fragment.to_string());
        }
    }

    let personality: Vec<&str> = context.tier(Tier::Personality).collect();
    let long_term: Vec<&str> = context.tier(Tier::LongTerm).collect();
    if !personality.is_empty() || !long_term.is_empty() {
        let mut memory = String::from(MEMORY_HEADER);
        if !personality.is_empty() {
            memory.push_str("\n\n");
            memory.push_str(PERSONALITY_HEADER);
            push_bullets(&mut memory, &personality);
        }
        if !long_term.is_empty() {
            memory.push_str("\n\n");
            memory.push_str(LONG_TERM_HEADER);
            push_bullets(&mut memory, &long_term);
        }
        sections.push(memory);
    }

    sections.push(format!(
        "IMPORTANT: You respond directly as part of the conversation.\n\
         NEVER begin your responses with your name '{}:' or similar prefix formats.\n\
         Respond naturally and directly.",
        entity.handle
    ));

    sections.join("\n\n")
}

fn push_bullets(out: &mut String, items: &[&str]) {
    for item in items {
        out.push_str("\n- ");
        out.push_str(item);
    }
}

/// Full provider request: system prompt, short-term turns in order, sampling
pub fn build_request(entity: &Entity, context: &AssembledContext) -> GenerationRequest {
    GenerationRequest {
        entity_id: entity.id,
        system_prompt: build_system_prompt(entity, context),
        context: context
            .tier(Tier::ShortTerm)
            .map(ContextMessage::user)
            .collect(),
        temperature: entity.temperature,
        max_tokens: entity.max_tokens,
    }
}
