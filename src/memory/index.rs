//! Vector similarity index for long-term records
//!
//! Records are partitioned by [`MemoryScope`] and never mutated once
//! inserted.

use crate::error::{ChorusError, Result};
use crate::services::cosine_similarity;
use crate::types::{LongTermRecord, MemoryScope, SearchHit};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Similarity search boundary
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Append a record to its scope
    async fn insert(&self, record: LongTermRecord) -> Result<()>;

    /// Top `top_k` records of `scope` by similarity to `query`, best first
    async fn search(&self, scope: MemoryScope, query: &[f32], top_k: usize)
        -> Result<Vec<SearchHit>>;

    /// Number of records in a scope
    async fn count(&self, scope: MemoryScope) -> Result<usize>;
}

/// In-process brute-force cosine index
pub struct InMemoryVectorIndex {
    dimensions: usize,
    scopes: RwLock<HashMap<MemoryScope, Vec<LongTermRecord>>>,
}

impl InMemoryVectorIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            scopes: RwLock::new(HashMap::new()),
        }
    }

    /// Records of a scope in insertion order
    pub async fn records(&self, scope: MemoryScope) -> Vec<LongTermRecord> {
        self.scopes
            .read()
            .await
            .get(&scope)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn insert(&self, record: LongTermRecord) -> Result<()> {
        if record.embedding.len() != self.dimensions {
            return Err(ChorusError::Embedding(format!(
                "Expected {} dimensions, got {}",
                self.dimensions,
                record.embedding.len()
            )));
        }

        debug!(scope = %record.scope, record_id = %record.id, "Indexing long-term record");
        self.scopes
            .write()
            .await
            .entry(record.scope)
            .or_default()
            .push(record);
        Ok(())
    }

    async fn search(
        &self,
        scope: MemoryScope,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let scopes = self.scopes.read().await;
        let Some(records) = scopes.get(&scope) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<SearchHit> = records
            .iter()
            .map(|record| SearchHit {
                record_id: record.id,
                text: record.text.clone(),
                score: cosine_similarity(query, &record.embedding),
            })
            .filter(|hit| hit.score.is_finite())
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn count(&self, scope: MemoryScope) -> Result<usize> {
        Ok(self
            .scopes
            .read()
            .await
            .get(&scope)
            .map(Vec::len)
            .unwrap_or(0))
    }
}
