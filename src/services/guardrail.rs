//! Retry on safety-classifier false positives.
//!
//! The on-device classifier occasionally refuses harmless prompts. One fresh
//! attempt after a short pause usually gets through; anything else is passed
//! through untouched.

use crate::core::config::{GUARDRAIL_RETRY_ATTEMPTS, GUARDRAIL_RETRY_DELAY};
use crate::core::error::GenerationError;
use crate::core::state::{AttemptOutcome, StoryDraft};
use crate::services::llm::{run_cancellable, Availability, ChatPrompt, StoryBackend, StoryRequest};
use crate::services::progress::ProgressSink;
use async_trait::async_trait;
use log::warn;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const RETRY_MESSAGE: &str = "Safety filter triggered, retrying...";

#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: GUARDRAIL_RETRY_ATTEMPTS,
            delay: GUARDRAIL_RETRY_DELAY,
        }
    }
}

#[derive(Debug)]
enum RetryState {
    Attempting(u32),
    Done(Result<StoryDraft, GenerationError>),
}

/// Wraps a backend whose `generate` opens a fresh session per call.
#[derive(Debug)]
pub struct GuardrailRetry {
    inner: Arc<dyn StoryBackend>,
    config: RetryConfig,
}

impl GuardrailRetry {
    pub fn new(inner: Arc<dyn StoryBackend>) -> Self {
        Self::with_config(inner, RetryConfig::default())
    }

    pub fn with_config(inner: Arc<dyn StoryBackend>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    async fn step(
        &self,
        attempt: u32,
        request: &StoryRequest,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<RetryState, GenerationError> {
        let outcome = AttemptOutcome::from(self.inner.generate(request, progress, cancel).await);
        let next = match outcome {
            AttemptOutcome::RetryableFailure(GenerationError::GuardrailViolation(reason))
                if attempt < self.config.max_retries =>
            {
                warn!(
                    "Guardrail violation on attempt {} ({}), retrying with a fresh session",
                    attempt + 1,
                    reason
                );
                progress.status(RETRY_MESSAGE);
                let delay = self.config.delay;
                run_cancellable(cancel, async move {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await?;
                RetryState::Attempting(attempt + 1)
            }
            other => RetryState::Done(other.into_result()),
        };
        Ok(next)
    }
}

#[async_trait]
impl StoryBackend for GuardrailRetry {
    fn name(&self) -> String {
        self.inner.name()
    }

    async fn check_availability(&self) -> Availability {
        self.inner.check_availability().await
    }

    async fn chat(
        &self,
        prompt: &ChatPrompt,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError> {
        self.inner.chat(prompt, cancel).await
    }

    async fn generate(
        &self,
        request: &StoryRequest,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<StoryDraft, GenerationError> {
        let mut state = RetryState::Attempting(0);
        loop {
            state = match state {
                RetryState::Attempting(n) => self.step(n, request, progress, cancel).await?,
                RetryState::Done(result) => return result,
            };
        }
    }
}
