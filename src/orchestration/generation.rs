//! Generation invoker
//!
//! Calls the provider with a bounded, per-attempt-timed retry loop and
//! cleans the produced text before it is committed.

pub use crate::services::RetryPolicy;
use crate::services::{
    Generation, GenerationError, GenerationProvider, GenerationRequest, PermanentKind, TransientKind,
};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Final result of an invocation together with the attempts it consumed
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationOutcome {
    pub result: Result<Generation, GenerationError>,
    pub attempts: u32,
}

pub struct GenerationInvoker {
    provider: Arc<dyn GenerationProvider>,
    policy: RetryPolicy,
}

impl GenerationInvoker {
    pub fn new(provider: Arc<dyn GenerationProvider>, policy: RetryPolicy) -> Self {
        Self { provider, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run the request until it succeeds, fails permanently or runs out of attempts
    pub async fn invoke(&self, request: &GenerationRequest) -> InvocationOutcome {
        let mut attempts = 0;

        loop {
            attempts += 1;
            let result = match timeout(self.policy.attempt_timeout, self.provider.generate(request)).await {
                Ok(result) => result,
                Err(_) => Err(GenerationError::transient(
                    TransientKind::Timeout,
                    format!("no response within {:?}", self.policy.attempt_timeout),
                )),
            };

            match result {
                Ok(generation) => {
                    debug!(
                        entity_id = %request.entity_id,
                        attempts,
                        completion_tokens = generation.usage.completion_tokens,
                        "Generation succeeded"
                    );
                    return InvocationOutcome {
                        result: Ok(generation),
                        attempts,
                    };
                }
                Err(error) if error.is_transient() && self.policy.allows_retry_after(attempts) => {
                    let delay = self.policy.backoff(attempts);
                    warn!(
                        entity_id = %request.entity_id,
                        attempt = attempts,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Generation attempt failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(error) => {
                    warn!(
                        entity_id = %request.entity_id,
                        attempts,
                        error = %error,
                        "Generation failed"
                    );
                    return InvocationOutcome {
                        result: Err(error),
                        attempts,
                    };
                }
            }
        }
    }
}

static GENERIC_PREFIXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"^\s*you\s*:\s*", r"^\s*ai\s*:\s*", r"^\s*assistant\s*:\s*", r"^\s*\[[^\]\n]{1,64}\]\s*:\s*"]
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .expect("valid prefix regex")
        })
        .collect()
});

/// Remove a parroted speaker prefix ("Sage: ...", "AI: ...", "[Sage]: ...")
///
/// Only the first matching pattern is stripped, and only at the start.
pub fn strip_name_prefix(text: &str, handle: &str) -> String {
    let own = RegexBuilder::new(&format!(r"^\s*{}\s*:\s*", regex::escape(handle.trim())))
        .case_insensitive(true)
        .build()
        .ok()
        .filter(|_| !handle.trim().is_empty());

    for pattern in own.iter().chain(GENERIC_PREFIXES.iter()) {
        if let Some(found) = pattern.find(text) {
            return text[found.end()..].trim().to_string();
        }
    }
    text.trim().to_string()
}

/// Strip prefixes and reject a reply that is empty afterwards
pub fn clean_generation(text: &str, handle: &str) -> Result<String, GenerationError> {
    let cleaned = strip_name_prefix(text, handle);
    if cleaned.is_empty() {
        return Err(GenerationError::permanent(
            PermanentKind::EmptyResponse,
            "reply was empty after removing the speaker prefix",
        ));
    }
    Ok(cleaned)
}
