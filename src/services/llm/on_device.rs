//! Built-in model backend. Each attempt opens a fresh session so a retried
//! attempt carries nothing over from the one before.

use crate::core::config::{OnDeviceConfig, ON_DEVICE_TEMPERATURE};
use crate::core::error::GenerationError;
use crate::core::state::StoryDraft;
use crate::services::llm::ollama::{OllamaClient, TextStream};
use crate::services::llm::{run_cancellable, Availability, ChatPrompt, StoryBackend, StoryRequest};
use crate::services::progress::ProgressSink;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::Debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

static PAGE_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""text"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap());

#[async_trait]
pub trait OnDeviceRuntime: Send + Sync + Debug {
    async fn availability(&self) -> Availability;
    async fn open_session(&self) -> Result<Box<dyn OnDeviceSession>, GenerationError>;
}

#[async_trait]
pub trait OnDeviceSession: Send {
    async fn stream(&mut self, prompt: &ChatPrompt) -> Result<TextStream, GenerationError>;
}

/// Runtime backed by the local model daemon.
#[derive(Debug, Clone)]
pub struct DaemonRuntime {
    client: OllamaClient,
    model: String,
}

impl DaemonRuntime {
    pub fn new(config: &OnDeviceConfig) -> Self {
        Self {
            client: OllamaClient::new(&config.base_url, config.timeout_seconds),
            model: config.model.clone(),
        }
    }
}

#[derive(Debug)]
struct DaemonSession {
    client: OllamaClient,
    model: String,
}

#[async_trait]
impl OnDeviceSession for DaemonSession {
    async fn stream(&mut self, prompt: &ChatPrompt) -> Result<TextStream, GenerationError> {
        self.client.stream_chat(&self.model, prompt, true).await
    }
}

#[async_trait]
impl OnDeviceRuntime for DaemonRuntime {
    async fn availability(&self) -> Availability {
        match self.client.installed_models().await {
            Ok(models) => {
                let wanted = self.model.as_str();
                let installed = models
                    .iter()
                    .any(|m| m == wanted || m.strip_suffix(":latest") == Some(wanted));
                if installed {
                    Availability::Available
                } else {
                    Availability::Unavailable(format!(
                        "The on-device model {} is not installed yet. Please try again shortly.",
                        self.model
                    ))
                }
            }
            Err(e) => {
                debug!("On-device runtime check failed: {}", e);
                Availability::Unavailable(
                    "The on-device language model is currently unavailable.".to_string(),
                )
            }
        }
    }

    async fn open_session(&self) -> Result<Box<dyn OnDeviceSession>, GenerationError> {
        Ok(Box::new(DaemonSession {
            client: self.client.clone(),
            model: self.model.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct OnDeviceBackend {
    runtime: Arc<dyn OnDeviceRuntime>,
}

impl OnDeviceBackend {
    pub fn new(runtime: Arc<dyn OnDeviceRuntime>) -> Self {
        Self { runtime }
    }

    async fn collect(
        &self,
        prompt: &ChatPrompt,
        progress: Option<&ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError> {
        let mut session = self.runtime.open_session().await?;
        let mut stream = run_cancellable(cancel, session.stream(prompt)).await?;

        let mut text = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(delta)) => {
                    text.push_str(&delta);
                    if let Some(progress) = progress {
                        let preview = preview_pages(&text);
                        if !preview.is_empty() {
                            progress.partial(&preview);
                        }
                    }
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        Ok(text)
    }
}

/// Page texts completed so far in a partial JSON document.
pub fn preview_pages(partial: &str) -> String {
    let pages_start = partial.find("\"pages\"").unwrap_or(partial.len());
    PAGE_TEXT
        .captures_iter(&partial[pages_start..])
        .filter_map(|c| c.get(1))
        .map(|m| {
            serde_json::from_str::<String>(&format!("\"{}\"", m.as_str()))
                .unwrap_or_else(|_| m.as_str().to_string())
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl StoryBackend for OnDeviceBackend {
    fn name(&self) -> String {
        "on-device model".to_string()
    }

    async fn check_availability(&self) -> Availability {
        self.runtime.availability().await
    }

    async fn chat(
        &self,
        prompt: &ChatPrompt,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError> {
        self.collect(prompt, None, cancel).await
    }

    async fn generate(
        &self,
        request: &StoryRequest,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<StoryDraft, GenerationError> {
        progress.reset_partial();
        let prompt = request.prompt(ON_DEVICE_TEMPERATURE, request.token_budget());
        let text = self.collect(&prompt, Some(progress), cancel).await?;
        if text.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        let draft = request.decode(&text)?;
        info!("On-device draft complete: {} pages", draft.pages.len());
        Ok(draft)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use futures_util::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Runtime whose sessions replay scripted outcomes, one per session.
    #[derive(Debug, Default)]
    pub struct ScriptedRuntime {
        pub scripts: Mutex<VecDeque<Result<Vec<String>, GenerationError>>>,
        pub sessions_opened: Mutex<usize>,
    }

    impl ScriptedRuntime {
        pub fn push(&self, script: Result<Vec<String>, GenerationError>) {
            self.scripts.lock().unwrap().push_back(script);
        }

        pub fn sessions(&self) -> usize {
            *self.sessions_opened.lock().unwrap()
        }
    }

    struct ScriptedSession {
        script: Option<Result<Vec<String>, GenerationError>>,
    }

    #[async_trait]
    impl OnDeviceSession for ScriptedSession {
        async fn stream(&mut self, _prompt: &ChatPrompt) -> Result<TextStream, GenerationError> {
            match self.script.take() {
                Some(Ok(chunks)) => Ok(stream::iter(chunks.into_iter().map(Ok)).boxed()),
                Some(Err(e)) => Err(e),
                None => Err(GenerationError::EmptyResponse),
            }
        }
    }

    #[async_trait]
    impl OnDeviceRuntime for ScriptedRuntime {
        async fn availability(&self) -> Availability {
            Availability::Available
        }

        async fn open_session(&self) -> Result<Box<dyn OnDeviceSession>, GenerationError> {
            *self.sessions_opened.lock().unwrap() += 1;
            let script = self.scripts.lock().unwrap().pop_front();
            Ok(Box::new(ScriptedSession { script }))
        }
    }
}
