//! Remote embedding service for OpenAI-compatible `/embeddings` endpoints
//!
//! Shares the generation provider's retry discipline: bounded attempts,
//! capped exponential backoff and a timeout per attempt. Only rate limits,
//! timeouts, connection failures and upstream 5xx are retried.

use super::embeddings::EmbeddingService;
use super::retry::RetryPolicy;
use crate::config::EmbeddingConfig;
use crate::error::{ChorusError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Inputs per request
const MAX_BATCH_SIZE: usize = 128;

pub struct RemoteEmbeddingService {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
    dimensions: usize,
    policy: RetryPolicy,
}

#[derive(Serialize)]
struct EmbeddingsBody<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbeddingsReply {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: Option<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Outcome of a single attempt
#[derive(Debug)]
enum AttemptError {
    Transient(String),
    Permanent(String),
}

impl RemoteEmbeddingService {
    pub fn new(
        api_key: String,
        model: String,
        api_base: &str,
        dimensions: usize,
        policy: RetryPolicy,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(ChorusError::InvalidConfig(
                "embedding API key cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            client: Client::builder().build()?,
            api_key,
            model,
            endpoint: format!("{}/embeddings", api_base.trim_end_matches('/')),
            dimensions,
            policy,
        })
    }

    pub fn from_config(config: &EmbeddingConfig, policy: RetryPolicy) -> Result<Self> {
        Self::new(
            config.api_key.clone().unwrap_or_default(),
            config.model.clone(),
            &config.api_base,
            config.dimension,
            policy,
        )
    }

    async fn request_with_retry(&self, inputs: &[&str]) -> Result<Vec<EmbeddingItem>> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = match timeout(self.policy.attempt_timeout, self.request(inputs)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(AttemptError::Transient(format!(
                    "no response within {:?}",
                    self.policy.attempt_timeout
                ))),
            };

            match outcome {
                Ok(items) => return Ok(items),
                Err(AttemptError::Transient(reason)) if self.policy.allows_retry_after(attempt) => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Embedding request failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(AttemptError::Transient(reason)) | Err(AttemptError::Permanent(reason)) => {
                    return Err(ChorusError::Embedding(reason));
                }
            }
        }
    }

    async fn request(&self, inputs: &[&str]) -> std::result::Result<Vec<EmbeddingItem>, AttemptError> {
        debug!(inputs = inputs.len(), model = %self.model, "Requesting embeddings");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingsBody {
                model: &self.model,
                input: inputs,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    AttemptError::Transient(e.to_string())
                } else {
                    AttemptError::Permanent(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<EmbeddingsReply>()
                .await
                .map(|reply| reply.data)
                .map_err(|e| AttemptError::Permanent(format!("malformed embeddings reply: {}", e)));
        }

        let detail = response
            .json::<ApiErrorBody>()
            .await
            .ok()
            .and_then(|body| body.error)
            .map(|e| e.message)
            .unwrap_or_default();

        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => AttemptError::Transient(format!("rate limited: {}", detail)),
            s if s.is_server_error() => AttemptError::Transient(format!("upstream {}: {}", s, detail)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                AttemptError::Permanent("embedding API rejected the credentials".to_string())
            }
            s => AttemptError::Permanent(format!("embedding API returned {}: {}", s, detail)),
        })
    }

    fn check_vector(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(ChorusError::Embedding(format!(
                "vector has {} dimensions, configured for {}",
                vector.len(),
                self.dimensions
            )));
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(ChorusError::Embedding("vector contains NaN or infinity".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EmbeddingService for RemoteEmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])
            .await?
            .pop()
            .ok_or_else(|| ChorusError::Embedding("no vector returned".to_string()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(ChorusError::Embedding("cannot embed blank text".to_string()));
        }

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(MAX_BATCH_SIZE) {
            let mut items = self.request_with_retry(batch).await?;
            if items.len() != batch.len() {
                return Err(ChorusError::Embedding(format!(
                    "sent {} inputs, received {} vectors",
                    batch.len(),
                    items.len()
                )));
            }

            items.sort_by_key(|item| item.index);
            for item in items {
                self.check_vector(&item.embedding)?;
                vectors.push(item.embedding);
            }
        }

        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
