use crate::core::config::{LocalModelConfig, ON_DEVICE_TEMPERATURE};
use crate::core::error::GenerationError;
use crate::core::state::StoryDraft;
use crate::services::llm::ollama::{OllamaClient, TextStream};
use crate::services::llm::{run_cancellable, Availability, ChatPrompt, StoryBackend, StoryRequest};
use crate::services::progress::ProgressSink;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const MISSING_MODEL_ID: &str = "Set a local model ID in settings first.";

#[async_trait]
pub trait LoadedModel: Send + Sync + Debug {
    fn model_id(&self) -> &str;
    async fn stream(&self, prompt: &ChatPrompt) -> Result<TextStream, GenerationError>;
}

#[async_trait]
pub trait ModelLoader: Send + Sync + Debug {
    async fn load(
        &self,
        model_id: &str,
        progress: &ProgressSink,
    ) -> Result<Arc<dyn LoadedModel>, GenerationError>;
}

/// Single-slot cache of the last loaded model. Loads are serialized through
/// the slot lock, so two requests never load models at the same time.
#[derive(Debug, Default)]
pub struct ModelCache {
    slot: Mutex<Option<Arc<dyn LoadedModel>>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_load(
        &self,
        model_id: &str,
        loader: &dyn ModelLoader,
        progress: &ProgressSink,
    ) -> Result<Arc<dyn LoadedModel>, GenerationError> {
        let mut slot = self.slot.lock().await;
        if let Some(model) = slot.as_ref() {
            if model.model_id() == model_id {
                debug!("Model cache hit: {}", model_id);
                return Ok(model.clone());
            }
        }

        info!("Model cache miss, loading {}", model_id);
        // Release the previous model before loading the next one.
        *slot = None;
        let model = loader.load(model_id, progress).await?;
        *slot = Some(model.clone());
        Ok(model)
    }

    pub async fn cached_id(&self) -> Option<String> {
        self.slot
            .lock()
            .await
            .as_ref()
            .map(|m| m.model_id().to_string())
    }
}

/// Loads models by pulling them into the local runtime.
#[derive(Debug, Clone)]
pub struct OllamaLoader {
    client: OllamaClient,
}

impl OllamaLoader {
    pub fn new(config: &LocalModelConfig) -> Self {
        Self {
            client: OllamaClient::new(&config.base_url, config.timeout_seconds),
        }
    }
}

#[derive(Debug)]
struct OllamaModel {
    client: OllamaClient,
    model_id: String,
}

#[async_trait]
impl LoadedModel for OllamaModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn stream(&self, prompt: &ChatPrompt) -> Result<TextStream, GenerationError> {
        self.client.stream_chat(&self.model_id, prompt, true).await
    }
}

#[async_trait]
impl ModelLoader for OllamaLoader {
    async fn load(
        &self,
        model_id: &str,
        progress: &ProgressSink,
    ) -> Result<Arc<dyn LoadedModel>, GenerationError> {
        self.client
            .pull(model_id, |percent| progress.loading(percent))
            .await?;
        Ok(Arc::new(OllamaModel {
            client: self.client.clone(),
            model_id: model_id.to_string(),
        }))
    }
}

/// Open-weight model run by a local runtime, loaded on demand.
#[derive(Debug)]
pub struct LocalModelBackend {
    model_id: String,
    loader: Arc<dyn ModelLoader>,
    cache: Arc<ModelCache>,
}

impl LocalModelBackend {
    pub fn new(model_id: &str, loader: Arc<dyn ModelLoader>, cache: Arc<ModelCache>) -> Self {
        Self {
            model_id: model_id.trim().to_string(),
            loader,
            cache,
        }
    }

    async fn load(
        &self,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn LoadedModel>, GenerationError> {
        if self.model_id.is_empty() {
            return Err(GenerationError::NotConfigured(MISSING_MODEL_ID.to_string()));
        }
        run_cancellable(
            cancel,
            self.cache
                .get_or_load(&self.model_id, self.loader.as_ref(), progress),
        )
        .await
    }

    async fn collect(
        &self,
        model: &dyn LoadedModel,
        prompt: &ChatPrompt,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError> {
        let mut stream = run_cancellable(cancel, model.stream(prompt)).await?;
        let mut text = String::new();
        let mut drafting_reported = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Local generation cancelled");
                    return Err(GenerationError::Cancelled);
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) if !chunk.is_empty() => {
                    text.push_str(&chunk);
                    if !drafting_reported {
                        drafting_reported = true;
                        progress.status("Drafting pages and illustration prompts...");
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        Ok(text)
    }
}

#[async_trait]
impl StoryBackend for LocalModelBackend {
    fn name(&self) -> String {
        "local model".to_string()
    }

    async fn check_availability(&self) -> Availability {
        if self.model_id.is_empty() {
            Availability::Unavailable(MISSING_MODEL_ID.to_string())
        } else {
            Availability::Available
        }
    }

    async fn chat(
        &self,
        prompt: &ChatPrompt,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError> {
        let progress = ProgressSink::disabled();
        let model = self.load(&progress, cancel).await?;
        self.collect(model.as_ref(), prompt, &progress, cancel).await
    }

    async fn generate(
        &self,
        request: &StoryRequest,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<StoryDraft, GenerationError> {
        let model = self.load(progress, cancel).await?;
        progress.status("Model loaded. Drafting story...");

        let prompt = request.prompt(ON_DEVICE_TEMPERATURE, request.token_budget());
        let text = self.collect(model.as_ref(), &prompt, progress, cancel).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        request.decode(text)
    }
}
