//! Bounded per-conversation turn window

use crate::types::ShortTermTurn;
use std::collections::VecDeque;

/// Recent turns of one conversation, oldest first
#[derive(Debug, Clone, Default)]
pub struct ShortTermWindow {
    turns: VecDeque<ShortTermTurn>,
}

impl ShortTermWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: ShortTermTurn) {
        self.turns.push_back(turn);
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Snapshot in chronological order
    pub fn turns(&self) -> Vec<ShortTermTurn> {
        self.turns.iter().cloned().collect()
    }

    /// How many turns to evict for a window of capacity `capacity`, if any
    ///
    /// Once the length L exceeds the capacity, at least L - capacity turns
    /// must go; a larger `batch` amortizes compaction, capped at L.
    pub fn eviction_size(&self, capacity: usize, batch: usize) -> Option<usize> {
        let len = self.turns.len();
        if len <= capacity {
            return None;
        }
        Some(batch.clamp(len - capacity, len))
    }

    /// Copy of the oldest `count` turns
    pub fn oldest(&self, count: usize) -> Vec<ShortTermTurn> {
        self.turns.iter().take(count).cloned().collect()
    }

    /// Remove the oldest `count` turns
    pub fn evict(&mut self, count: usize) -> usize {
        let count = count.min(self.turns.len());
        self.turns.drain(..count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageId, ParticipantId, UserId};
    use chrono::Utc;

    fn window_of(n: usize) -> ShortTermWindow {
        let author = ParticipantId::Human(UserId::new());
        let mut window = ShortTermWindow::new();
        for i in 0..n {
            window.push(ShortTermTurn {
                message_id: MessageId::new(),
                author,
                author_name: "alice".to_string(),
                text: format!("turn {}", i),
                created_at: Utc::now(),
            });
        }
        window
    }

    #[test]
    fn test_eviction_size() {
        assert_eq!(window_of(20).eviction_size(20, 10), None);
        assert_eq!(window_of(21).eviction_size(20, 10), Some(10));
        // Batch smaller than the overflow still restores the bound
        assert_eq!(window_of(25).eviction_size(20, 2), Some(5));
        // Batch larger than the window is capped
        assert_eq!(window_of(3).eviction_size(2, 10), Some(3));
    }

    #[test]
    fn test_evict_removes_oldest() {
        let mut window = window_of(5);
        let oldest = window.oldest(2);
        assert_eq!(window.evict(2), 2);
        assert_eq!(window.len(), 3);
        assert_eq!(oldest[1].text, "turn 1");
        assert_eq!(window.turns()[0].text, "turn 2");
    }
}
