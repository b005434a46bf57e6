//! Heuristic conversation summaries
//!
//! Rule-based, no model calls: who took part, plus a topic taken from the
//! opening human turn.

use crate::types::ShortTermTurn;

/// Characters of the opening turn used as the topic
pub const TOPIC_CHARS: usize = 100;

/// Summarize a batch of turns in one or two sentences
pub fn summarize_turns(turns: &[ShortTermTurn], keywords: &[String]) -> String {
    if turns.is_empty() {
        return "Empty conversation".to_string();
    }

    let participants = participant_names(turns);
    let topic = determine_topic(turns);

    let mut summary = match participants.as_slice() {
        [] => format!("Conversation about {}", topic),
        [only] => format!("{} talked about {}", only, topic),
        _ => format!("{} talked about {}", join_names(&participants), topic),
    };

    if !keywords.is_empty() {
        summary.push_str(&format!(". Key topics: {}", keywords.join(", ")));
    }
    summary
}

fn participant_names(turns: &[ShortTermTurn]) -> Vec<String> {
    let mut names: Vec<String> = turns
        .iter()
        .map(|t| t.author_name.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect();
    names.sort();
    names.dedup();
    names
}

fn join_names(names: &[String]) -> String {
    match names.split_last() {
        Some((last, rest)) if !rest.is_empty() => format!("{} and {}", rest.join(", "), last),
        Some((last, _)) => last.clone(),
        None => String::new(),
    }
}

fn determine_topic(turns: &[ShortTermTurn]) -> String {
    let source = turns
        .iter()
        .find(|t| t.author.is_human() && !t.text.trim().is_empty())
        .or_else(|| turns.iter().find(|t| !t.text.trim().is_empty()));

    match source {
        Some(turn) => {
            let head: String = turn.text.chars().take(TOPIC_CHARS).collect();
            let mut topic = head.split_whitespace().collect::<Vec<_>>().join(" ");
            if turn.text.chars().count() > TOPIC_CHARS {
                topic.push_str("...");
            }
            topic
        }
        None => "general conversation".to_string(),
    }
}
