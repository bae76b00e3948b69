//! Batched, rate-limited embedding generation with retries.
//!
//! [`EmbeddingGenerator`] wraps an [`EmbeddingProvider`] and adds what the
//! provider itself does not: batching, a concurrency cap, per-call timeouts,
//! retries with jittered backoff, and output validation. Every vector it
//! returns is finite, has the model's dimension and unit length.

use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use crate::model::ModelDescriptor;
use crate::provider::{EmbedRole, EmbeddingProvider, l2_normalize};
use crate::retry::RetryPolicy;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Outcome of embedding a keyed batch. Every input key ends up in exactly one
/// of the two lists.
#[derive(Debug)]
pub struct BatchOutcome<K> {
    pub embedded: Vec<(K, Vec<f32>)>,
    pub failed: Vec<(K, EmbedError)>,
}

impl<K> Default for BatchOutcome<K> {
    fn default() -> Self {
        Self {
            embedded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<K> BatchOutcome<K> {
    fn merge(&mut self, other: BatchOutcome<K>) {
        self.embedded.extend(other.embedded);
        self.failed.extend(other.failed);
    }
}

pub struct EmbeddingGenerator {
    provider: Arc<dyn EmbeddingProvider>,
    descriptor: ModelDescriptor,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
    batch_size: usize,
    timeout: Duration,
}

impl std::fmt::Debug for EmbeddingGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingGenerator")
            .field("model_id", &self.descriptor.model_id())
            .field("batch_size", &self.batch_size)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl EmbeddingGenerator {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbedConfig) -> Self {
        let descriptor = provider.descriptor();
        Self {
            provider,
            descriptor,
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            retry: config.retry,
            batch_size: config.batch_size.max(1),
            timeout: config.request_timeout(),
        }
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn model_id(&self) -> String {
        self.descriptor.model_id()
    }

    pub fn dimension(&self) -> usize {
        self.descriptor.dimension
    }

    /// Embed a single text, retrying transient failures.
    pub async fn embed(&self, text: &str, role: EmbedRole) -> Result<Vec<f32>> {
        let texts = [text.to_string()];
        let mut vectors = self.call_with_retry(&texts, role).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbedError::invalid_vector("provider returned no vectors"))
    }

    /// Embed keyed texts in batches. A batch that keeps failing after all
    /// retries is split and each text is tried once on its own, so a single
    /// bad text does not take its neighbours down with it.
    pub async fn embed_batch<K: Send>(
        &self,
        items: Vec<(K, String)>,
        role: EmbedRole,
    ) -> BatchOutcome<K> {
        let mut batches: Vec<Vec<(K, String)>> = Vec::new();
        let mut current = Vec::with_capacity(self.batch_size);
        for item in items {
            current.push(item);
            if current.len() == self.batch_size {
                batches.push(std::mem::replace(
                    &mut current,
                    Vec::with_capacity(self.batch_size),
                ));
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }

        let results = join_all(batches.into_iter().map(|batch| self.run_batch(batch, role))).await;
        let mut outcome = BatchOutcome::default();
        for result in results {
            outcome.merge(result);
        }
        outcome
    }

    async fn run_batch<K: Send>(&self, batch: Vec<(K, String)>, role: EmbedRole) -> BatchOutcome<K> {
        let (keys, texts): (Vec<K>, Vec<String>) = batch.into_iter().unzip();
        match self.call_with_retry(&texts, role).await {
            Ok(vectors) => BatchOutcome {
                embedded: keys.into_iter().zip(vectors).collect(),
                failed: Vec::new(),
            },
            Err(e) if keys.len() == 1 => {
                let mut outcome = BatchOutcome::default();
                if let Some(key) = keys.into_iter().next() {
                    outcome.failed.push((key, e));
                }
                outcome
            }
            Err(e) if e.is_retryable() => {
                // Retryable failures are provider-wide. Only rejected
                // content is split out text by text.
                tracing::warn!("Batch of {} texts failed: {}", keys.len(), e);
                let message = e.to_string();
                let mut first = Some(e);
                BatchOutcome {
                    embedded: Vec::new(),
                    failed: keys
                        .into_iter()
                        .map(|key| {
                            let err = first
                                .take()
                                .unwrap_or_else(|| EmbedError::provider(message.clone(), true));
                            (key, err)
                        })
                        .collect(),
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Batch of {} texts failed ({}), retrying texts individually",
                    keys.len(),
                    e
                );
                let mut outcome = BatchOutcome::default();
                for (key, text) in keys.into_iter().zip(texts) {
                    match self.call_once(std::slice::from_ref(&text), role).await {
                        Ok(mut vectors) => match vectors.pop() {
                            Some(vector) => outcome.embedded.push((key, vector)),
                            None => outcome.failed.push((
                                key,
                                EmbedError::invalid_vector("provider returned no vectors"),
                            )),
                        },
                        Err(e) => outcome.failed.push((key, e)),
                    }
                }
                outcome
            }
        }
    }

    async fn call_with_retry(&self, texts: &[String], role: EmbedRole) -> Result<Vec<Vec<f32>>> {
        let mut attempt = 1;
        loop {
            match self.call_once(texts, role).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        "Embedding attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        self.retry.attempts(),
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_once(&self, texts: &[String], role: EmbedRole) -> Result<Vec<Vec<f32>>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EmbedError::provider("embedding generator is shut down", false))?;

        let result = tokio::time::timeout(self.timeout, self.provider.embed_texts(texts, role))
            .await
            .map_err(|_| EmbedError::Timeout {
                after: self.timeout,
            })??;

        if result.embeddings.len() != texts.len() {
            return Err(EmbedError::invalid_vector(format!(
                "expected {} vectors, got {}",
                texts.len(),
                result.embeddings.len()
            )));
        }
        result
            .embeddings
            .into_iter()
            .map(|vector| self.validate(vector))
            .collect()
    }

    fn validate(&self, mut vector: Vec<f32>) -> Result<Vec<f32>> {
        if vector.len() != self.descriptor.dimension {
            return Err(EmbedError::DimensionMismatch {
                expected: self.descriptor.dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(EmbedError::invalid_vector("non-finite component"));
        }
        let norm = l2_normalize(&mut vector);
        if norm == 0.0 || !norm.is_finite() {
            return Err(EmbedError::invalid_vector("zero-norm vector"));
        }
        Ok(vector)
    }
}
