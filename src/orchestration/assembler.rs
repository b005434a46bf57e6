//! Context assembly
//!
//! Builds the bounded context for one entity turn from the three memory
//! tiers. Budget priority is short-term, then personality, then
//! conversation long-term: lower tiers are dropped first.

use crate::config::{KeywordConfig, MemoryConfig};
use crate::memory::MemoryStore;
use crate::text::KeywordExtractor;
use crate::types::{Entity, MemoryScope, Message, ShortTermTurn};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    ShortTerm,
    Personality,
    LongTerm,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextSegment {
    pub tier: Tier,
    pub text: String,
}

/// Output of one assembly
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AssembledContext {
    /// Short-term (chronological), then personality, then long-term
    pub segments: Vec<ContextSegment>,
    /// Keywords extracted from the triggering message
    pub keywords: Vec<String>,
    /// A similarity search failed and its tier is missing
    pub degraded: bool,
}

impl AssembledContext {
    pub fn total_chars(&self) -> usize {
        self.segments.iter().map(|s| s.text.chars().count()).sum()
    }

    pub fn tier(&self, tier: Tier) -> impl Iterator<Item = &str> {
        self.segments
            .iter()
            .filter(move |s| s.tier == tier)
            .map(|s| s.text.as_str())
    }
}

/// Budget and dedup settings for [`pack_segments`]
#[derive(Debug, Clone, Copy)]
pub struct PackLimits {
    pub budget_chars: usize,
    pub dedup_threshold: f32,
    pub min_snippet_chars: usize,
}

impl From<&MemoryConfig> for PackLimits {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            budget_chars: config.context_budget_chars,
            dedup_threshold: config.dedup_threshold,
            min_snippet_chars: config.min_snippet_chars,
        }
    }
}

pub struct MemoryAssembler {
    memory: Arc<MemoryStore>,
    keywords: KeywordExtractor,
    query_keywords: usize,
    limits: PackLimits,
    personality_top_n: usize,
    conversation_top_m: usize,
}

impl MemoryAssembler {
    pub fn new(memory: Arc<MemoryStore>, keyword_config: KeywordConfig) -> Self {
        let config = memory.config().clone();
        Self {
            query_keywords: keyword_config.query_keywords,
            keywords: KeywordExtractor::new(keyword_config),
            limits: PackLimits::from(&config),
            personality_top_n: config.personality_top_n,
            conversation_top_m: config.conversation_top_m,
            memory,
        }
    }

    /// Assemble context for `entity` answering `trigger`
    ///
    /// Never fails: an unavailable index only costs the retrieved tiers.
    pub async fn assemble(&self, entity: &Entity, trigger: &Message) -> AssembledContext {
        let conversation_id = trigger.conversation_id();

        let window = self.memory.window(conversation_id).await;
        let short_term: Vec<String> = window.iter().map(|t| render_turn(t, entity)).collect();

        let keywords = self
            .keywords
            .extract_keywords(&trigger.text, self.query_keywords);
        let query = if keywords.is_empty() {
            trigger.text.clone()
        } else {
            format!("{}\n{}", keywords.join(" "), trigger.text)
        };

        let mut degraded = false;
        let personality = match self
            .memory
            .search(MemoryScope::Personality(entity.id), &query, self.personality_top_n)
            .await
        {
            Ok(hits) => hits.into_iter().map(|h| h.text).collect(),
            Err(e) => {
                warn!(entity_id = %entity.id, error = %e, "Personality search failed, degrading");
                degraded = true;
                Vec::new()
            }
        };
        let long_term = match self
            .memory
            .search(
                MemoryScope::Conversation(conversation_id),
                &query,
                self.conversation_top_m,
            )
            .await
        {
            Ok(hits) => hits.into_iter().map(|h| h.text).collect(),
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "Long-term search failed, degrading");
                degraded = true;
                Vec::new()
            }
        };

        AssembledContext {
            segments: pack_segments(short_term, personality, long_term, self.limits),
            keywords,
            degraded,
        }
    }
}

/// How a short-term turn reads from `entity`'s point of view
pub fn render_turn(turn: &ShortTermTurn, entity: &Entity) -> String {
    if turn.author == entity.participant_id() {
        format!("You: {}", turn.text)
    } else {
        format!("{}: {}", turn.author_name, turn.text)
    }
}

/// Fit the three tiers into the character budget
///
/// Short-term keeps its newest turns (truncating the newest only if it alone
/// exceeds the budget). Retrieved spans that nearly duplicate something
/// already kept are skipped; the first retrieved span that does not fit is
/// truncated if enough room is left, and everything after it is dropped.
pub fn pack_segments(
    short_term: Vec<String>,
    personality: Vec<String>,
    long_term: Vec<String>,
    limits: PackLimits,
) -> Vec<ContextSegment> {
    let budget = limits.budget_chars;
    let mut used = 0;

    let mut recent: Vec<String> = Vec::new();
    let mut overflowed = false;
    for text in short_term.into_iter().rev() {
        let len = text.chars().count();
        if used + len <= budget {
            used += len;
            recent.push(text);
        } else {
            if recent.is_empty() && budget > 0 {
                let cut = truncate_chars(&text, budget);
                used += cut.chars().count();
                recent.push(cut);
            }
            overflowed = true;
            break;
        }
    }
    recent.reverse();

    let mut seen: Vec<HashSet<String>> = recent.iter().map(|t| token_set(t)).collect();
    let mut segments: Vec<ContextSegment> = recent
        .into_iter()
        .map(|text| ContextSegment {
            tier: Tier::ShortTerm,
            text,
        })
        .collect();
    if overflowed {
        return segments;
    }

    let retrieved = personality
        .into_iter()
        .map(|t| (Tier::Personality, t))
        .chain(long_term.into_iter().map(|t| (Tier::LongTerm, t)));

    for (tier, text) in retrieved {
        let tokens = token_set(&text);
        if tokens.is_empty()
            || seen
                .iter()
                .any(|other| jaccard(&tokens, other) >= limits.dedup_threshold)
        {
            continue;
        }

        let len = text.chars().count();
        let remaining = budget - used;
        if len <= remaining {
            used += len;
            seen.push(tokens);
            segments.push(ContextSegment { tier, text });
            continue;
        }

        if remaining >= limits.min_snippet_chars && remaining > 0 {
            let cut = truncate_chars(&text, remaining);
            segments.push(ContextSegment { tier, text: cut });
        }
        break;
    }

    segments
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    if max <= 3 {
        return text.chars().take(max).collect();
    }
    let mut out: String = text.chars().take(max - 3).collect();
    out.push_str("...");
    out
}

fn token_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f32 / union as f32
}
