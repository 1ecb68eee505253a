pub mod cloud;
pub mod http;
pub mod local;
pub mod ollama;
pub mod on_device;
pub mod remote;

use crate::core::config::{maximum_response_tokens, Audience, Config, TextProvider};
use crate::core::credentials::CredentialStore;
use crate::core::error::GenerationError;
use crate::core::safety::SafetyGate;
use crate::core::state::StoryDraft;
use crate::services::decoder::{decode_with, DecodeOptions};
use crate::services::guardrail::GuardrailRetry;
use crate::services::progress::ProgressSink;
use crate::services::prompts;
use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use self::cloud::{CloudBackend, CloudProvider};
use self::local::{LocalModelBackend, ModelCache, OllamaLoader};
use self::on_device::{DaemonRuntime, OnDeviceBackend};
use self::remote::{RemoteBackend, RemoteEndpointConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct ChatPrompt {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Everything a backend needs to draft one story.
#[derive(Debug, Clone)]
pub struct StoryRequest {
    pub concept: String,
    pub page_count: usize,
    pub audience: Audience,
    pub pad_missing_pages: bool,
    pub gate: Arc<dyn SafetyGate>,
}

impl StoryRequest {
    pub fn new(concept: &str, page_count: usize, gate: Arc<dyn SafetyGate>) -> Self {
        Self {
            concept: concept.to_string(),
            page_count,
            audience: Audience::default(),
            pad_missing_pages: false,
            gate,
        }
    }

    pub fn with_audience(mut self, audience: Audience) -> Self {
        self.audience = audience;
        self
    }

    pub fn padded(mut self, pad: bool) -> Self {
        self.pad_missing_pages = pad;
        self
    }

    pub fn prompt(&self, temperature: f32, max_tokens: u32) -> ChatPrompt {
        ChatPrompt {
            system: prompts::story_system_prompt(self.audience),
            user: prompts::story_user_prompt(&self.concept, self.page_count),
            temperature,
            max_tokens,
        }
    }

    pub fn token_budget(&self) -> u32 {
        maximum_response_tokens(self.page_count)
    }

    pub fn decode(&self, raw: &str) -> Result<StoryDraft, GenerationError> {
        let options =
            DecodeOptions::new(self.page_count, &self.concept).padded(self.pad_missing_pages);
        decode_with(raw, &options, self.gate.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable(String),
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }
}

/// A text-generation engine able to draft a story.
#[async_trait]
pub trait StoryBackend: Send + Sync + Debug {
    /// Display name used in progress messages.
    fn name(&self) -> String;

    async fn check_availability(&self) -> Availability;

    /// Single system + user exchange returning the model's text.
    async fn chat(
        &self,
        prompt: &ChatPrompt,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError>;

    async fn generate(
        &self,
        request: &StoryRequest,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<StoryDraft, GenerationError>;
}

/// Runs `fut` until it finishes or `cancel` fires, whichever is first.
/// Dropping the future closes any socket it holds.
pub async fn run_cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, GenerationError>
where
    F: Future<Output = Result<T, GenerationError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GenerationError::Cancelled),
        result = fut => result,
    }
}

/// Non-streaming generation shared by the HTTP backends.
pub(crate) async fn generate_via_chat<B>(
    backend: &B,
    request: &StoryRequest,
    prompt: ChatPrompt,
    progress: &ProgressSink,
    cancel: &CancellationToken,
) -> Result<StoryDraft, GenerationError>
where
    B: StoryBackend + ?Sized,
{
    progress.status(format!("Generating story with {}...", backend.name()));
    let text = backend.chat(&prompt, cancel).await?;
    progress.status("Parsing story response...");
    let draft = request.decode(&text)?;
    log::info!(
        "{} drafted '{}' with {} pages",
        backend.name(),
        draft.title,
        draft.pages.len()
    );
    Ok(draft)
}

/// Builds the backend for one provider choice. The on-device backend always
/// comes wrapped in the guardrail retry.
pub fn create_backend(
    provider: TextProvider,
    config: &Config,
    credentials: Arc<dyn CredentialStore>,
    cache: Arc<ModelCache>,
) -> Arc<dyn StoryBackend> {
    match provider {
        TextProvider::OnDevice => {
            let runtime = DaemonRuntime::new(&config.on_device);
            let backend = OnDeviceBackend::new(Arc::new(runtime));
            Arc::new(GuardrailRetry::new(Arc::new(backend)))
        }
        TextProvider::LocalModel => {
            let loader = OllamaLoader::new(&config.local_model);
            Arc::new(LocalModelBackend::new(
                &config.models.local_model_id,
                Arc::new(loader),
                cache,
            ))
        }
        TextProvider::OpenRouter | TextProvider::TogetherAi | TextProvider::HuggingFace => {
            let cloud = match provider {
                TextProvider::OpenRouter => CloudProvider::OpenRouter,
                TextProvider::TogetherAi => CloudProvider::TogetherAi,
                _ => CloudProvider::HuggingFace,
            };
            Arc::new(CloudBackend::new(
                cloud,
                cloud.configured_model(&config.models),
                credentials,
            ))
        }
        TextProvider::Remote => {
            let endpoint = RemoteEndpointConfig::from_env(&config.remote);
            Arc::new(RemoteBackend::new(endpoint))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted backend: pops one result per call, counting calls.
    #[derive(Debug)]
    pub struct MockBackend {
        pub name: String,
        pub availability: Availability,
        pub results: Mutex<VecDeque<Result<StoryDraft, GenerationError>>>,
        pub chat_replies: Mutex<VecDeque<Result<String, GenerationError>>>,
        pub calls: Arc<Mutex<usize>>,
        pub requests: Arc<Mutex<Vec<String>>>,
    }

    impl MockBackend {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                availability: Availability::Available,
                results: Mutex::new(VecDeque::new()),
                chat_replies: Mutex::new(VecDeque::new()),
                calls: Arc::new(Mutex::new(0)),
                requests: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn unavailable(mut self, reason: &str) -> Self {
            self.availability = Availability::Unavailable(reason.to_string());
            self
        }

        pub fn then(self, result: Result<StoryDraft, GenerationError>) -> Self {
            self.results.lock().unwrap().push_back(result);
            self
        }

        pub fn then_chat(self, reply: Result<String, GenerationError>) -> Self {
            self.chat_replies.lock().unwrap().push_back(reply);
            self
        }

        pub fn call_count(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl StoryBackend for MockBackend {
        fn name(&self) -> String {
            self.name.clone()
        }

        async fn check_availability(&self) -> Availability {
            self.availability.clone()
        }

        async fn chat(
            &self,
            prompt: &ChatPrompt,
            _cancel: &CancellationToken,
        ) -> Result<String, GenerationError> {
            *self.calls.lock().unwrap() += 1;
            self.requests.lock().unwrap().push(prompt.user.clone());
            self.chat_replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(GenerationError::EmptyResponse))
        }

        async fn generate(
            &self,
            request: &StoryRequest,
            _progress: &ProgressSink,
            cancel: &CancellationToken,
        ) -> Result<StoryDraft, GenerationError> {
            if cancel.is_cancelled() {
                return Err(GenerationError::Cancelled);
            }
            *self.calls.lock().unwrap() += 1;
            self.requests.lock().unwrap().push(request.concept.clone());
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(GenerationError::EmptyResponse))
        }
    }

    pub fn draft(title: &str) -> StoryDraft {
        use crate::core::state::StoryPage;
        StoryDraft {
            title: title.to_string(),
            author_line: "Written by StoryFox".into(),
            moral: "Be kind.".into(),
            character_descriptions: String::new(),
            pages: vec![StoryPage {
                page_number: 1,
                text: "Luna wakes up.".into(),
                illustration_prompt: "Luna, a small white rabbit".into(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::safety::BasicSafetyGate;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_cancellable_prefers_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = run_cancellable(&cancel, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(GenerationError::Cancelled));
    }

    #[test]
    fn test_request_prompt_and_decode() {
        let request = StoryRequest::new("a shy kitten", 4, Arc::new(BasicSafetyGate));
        let prompt = request.prompt(0.7, request.token_budget() * 2);
        assert_eq!(prompt.max_tokens, 1600);
        assert!(prompt.user.contains("a shy kitten"));

        let raw = r#"{"title":"T","authorLine":"A","moral":"M","pages":[{"pageNumber":1,"text":"x","imagePrompt":"y"}]}"#;
        let draft = request.clone().padded(true).decode(raw).unwrap();
        assert_eq!(draft.pages.len(), 4);
        assert_eq!(request.decode(raw).unwrap().pages.len(), 1);
    }
}
