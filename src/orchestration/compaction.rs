//! Feeding short-term windows
//!
//! Appends happen inline on the ingest and commit paths; summarizing the
//! evicted turns runs on a spawned task so neither path waits on the
//! embedder or the index.

use crate::error::Result;
use crate::events::{Event, EventBroadcaster};
use crate::memory::{CompactionJob, MemoryStore};
use crate::types::{ConversationId, ShortTermTurn};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Append `turn` and start compaction in the background when it is due
///
/// Fails only when the conversation has been forgotten.
pub async fn feed_window(
    memory: &Arc<MemoryStore>,
    events: &Arc<EventBroadcaster>,
    conversation_id: ConversationId,
    turn: ShortTermTurn,
) -> Result<()> {
    if let Some(job) = memory.append_turn(conversation_id, turn).await? {
        spawn_compaction(memory.clone(), events.clone(), job);
    }
    Ok(())
}

/// Run `job`, then any follow-up job its window still needs
pub fn spawn_compaction(
    memory: Arc<MemoryStore>,
    events: Arc<EventBroadcaster>,
    job: CompactionJob,
) -> JoinHandle<()> {
    debug!(
        conversation_id = %job.conversation_id(),
        turns = job.len(),
        "Starting background compaction"
    );

    tokio::spawn(async move {
        let mut pending = Some(job);
        while let Some(job) = pending {
            let conversation_id = job.conversation_id();
            let succeeded = match memory.compact(&job).await {
                Ok(report) => {
                    events.broadcast(Event::memory_compacted(
                        conversation_id,
                        report.record_id,
                        report.evicted,
                    ));
                    true
                }
                Err(e) => {
                    warn!(
                        conversation_id = %conversation_id,
                        error = %e,
                        "Compaction failed, window stays over capacity"
                    );
                    false
                }
            };
            pending = memory.finish_compaction(job, succeeded).await;
        }
    })
}
