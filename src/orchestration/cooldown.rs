//! Cooldown ledger
//!
//! Per (entity, conversation) record of the last attempt. Evaluation reads a
//! snapshot; the dispatcher debits through an atomic test-and-set at job
//! start, before any generation happens.

use crate::error::{ChorusError, Result};
use crate::storage::CooldownStore;
use crate::types::{Cooldown, CooldownKey};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Compare-and-set rounds before giving up on a contended key
const MAX_CAS_ROUNDS: usize = 16;

/// Result of a debit attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DebitOutcome {
    /// The gate passed and `now` is recorded as the last attempt
    Debited { previous: Option<Cooldown> },
    /// Another attempt is too recent
    OnCooldown {
        last_attempt: DateTime<Utc>,
        remaining: Duration,
    },
}

impl DebitOutcome {
    pub fn is_debited(&self) -> bool {
        matches!(self, DebitOutcome::Debited { .. })
    }
}

pub struct CooldownLedger<S: ?Sized> {
    store: Arc<S>,
}

impl<S> CooldownLedger<S>
where
    S: CooldownStore + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Read-only view of the given keys; absent keys have never attempted
    pub async fn snapshot(&self, keys: &[CooldownKey]) -> Result<HashMap<CooldownKey, Cooldown>> {
        let mut entries = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.store.get_cooldown(*key).await? {
                entries.insert(*key, entry);
            }
        }
        Ok(entries)
    }

    /// Atomically check the gate and record `now` as the last attempt
    ///
    /// The gate uses the caller's current `min_interval`, so an entity whose
    /// cooldown was shortened becomes eligible under the new value.
    pub async fn try_debit(
        &self,
        key: CooldownKey,
        min_interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<DebitOutcome> {
        for _ in 0..MAX_CAS_ROUNDS {
            let current = self.store.get_cooldown(key).await?;

            if let Some(entry) = current {
                let gate = Cooldown {
                    last_attempt: entry.last_attempt,
                    min_interval,
                };
                if let Some(remaining) = gate.remaining(now) {
                    debug!(key = %key, ?remaining, "Cooldown gate closed");
                    return Ok(DebitOutcome::OnCooldown {
                        last_attempt: entry.last_attempt,
                        remaining,
                    });
                }
            }

            let debit = Cooldown {
                last_attempt: now,
                min_interval,
            };
            let expected = current.map(|c| c.last_attempt);
            if self.store.compare_and_set_cooldown(key, expected, debit).await? {
                debug!(key = %key, "Cooldown debited");
                return Ok(DebitOutcome::Debited { previous: current });
            }
        }

        warn!(key = %key, "Cooldown entry too contended to debit");
        Err(ChorusError::Other(format!(
            "cooldown entry {} changed on every attempt",
            key
        )))
    }
}
