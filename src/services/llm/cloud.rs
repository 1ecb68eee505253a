use crate::core::config::{ModelSelection, CLOUD_TEMPERATURE, CLOUD_TEXT_TIMEOUT_SECONDS};
use crate::core::credentials::CredentialStore;
use crate::core::error::GenerationError;
use crate::core::state::StoryDraft;
use crate::services::llm::http::{ChatCompletionClient, ChatRequest, Endpoint};
use crate::services::llm::{
    generate_via_chat, run_cancellable, Availability, ChatPrompt, StoryBackend, StoryRequest,
};
use crate::services::progress::ProgressSink;
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudProvider {
    OpenRouter,
    TogetherAi,
    HuggingFace,
}

impl CloudProvider {
    pub fn display_name(&self) -> &'static str {
        match self {
            CloudProvider::OpenRouter => "OpenRouter",
            CloudProvider::TogetherAi => "Together AI",
            CloudProvider::HuggingFace => "Hugging Face",
        }
    }

    pub fn chat_completion_url(&self) -> &'static str {
        match self {
            CloudProvider::OpenRouter => "https://openrouter.ai/api/v1/chat/completions",
            CloudProvider::TogetherAi => "https://api.together.xyz/v1/chat/completions",
            CloudProvider::HuggingFace => "https://router.huggingface.co/v1/chat/completions",
        }
    }

    pub fn default_text_model(&self) -> &'static str {
        match self {
            CloudProvider::OpenRouter => "meta-llama/llama-3.3-70b-instruct",
            CloudProvider::TogetherAi => "meta-llama/Llama-3.3-70B-Instruct-Turbo",
            CloudProvider::HuggingFace => "meta-llama/Llama-3.1-8B-Instruct",
        }
    }

    pub fn extra_headers(&self) -> Vec<(String, String)> {
        match self {
            CloudProvider::OpenRouter => vec![
                ("HTTP-Referer".into(), "https://storyfox.app".into()),
                ("X-Title".into(), "StoryFox".into()),
            ],
            _ => Vec::new(),
        }
    }

    /// The configured model id, or the provider default when blank.
    pub fn configured_model(&self, models: &ModelSelection) -> String {
        let configured = match self {
            CloudProvider::OpenRouter => &models.openrouter_text_model,
            CloudProvider::TogetherAi => &models.together_text_model,
            CloudProvider::HuggingFace => &models.hugging_face_text_model,
        };
        let trimmed = configured.trim();
        if trimmed.is_empty() {
            self.default_text_model().to_string()
        } else {
            trimmed.to_string()
        }
    }
}

/// Stateless single-request backend for hosted OpenAI-compatible APIs.
#[derive(Debug)]
pub struct CloudBackend {
    provider: CloudProvider,
    model: String,
    url: String,
    credentials: Arc<dyn CredentialStore>,
    client: ChatCompletionClient,
}

impl CloudBackend {
    pub fn new(provider: CloudProvider, model: String, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            provider,
            model,
            url: provider.chat_completion_url().to_string(),
            credentials,
            client: ChatCompletionClient::new(),
        }
    }

    /// Points the backend at a different base URL, e.g. a proxy.
    pub fn with_url(mut self, url: &str) -> Self {
        self.url = url.to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> Result<Endpoint, GenerationError> {
        let token = self
            .credentials
            .bearer_token(self.provider)
            .ok_or_else(|| GenerationError::NotConfigured(self.not_configured_reason()))?;
        Ok(Endpoint {
            url: self.url.clone(),
            auth: Some(("Authorization".to_string(), format!("Bearer {}", token))),
            extra_headers: self.provider.extra_headers(),
            timeout_seconds: CLOUD_TEXT_TIMEOUT_SECONDS,
        })
    }

    fn not_configured_reason(&self) -> String {
        format!(
            "{} is not configured. Add an API key in config.yml or the environment.",
            self.provider.display_name()
        )
    }
}

#[async_trait]
impl StoryBackend for CloudBackend {
    fn name(&self) -> String {
        self.provider.display_name().to_string()
    }

    async fn check_availability(&self) -> Availability {
        match self.credentials.bearer_token(self.provider) {
            Some(_) => Availability::Available,
            None => Availability::Unavailable(self.not_configured_reason()),
        }
    }

    async fn chat(
        &self,
        prompt: &ChatPrompt,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError> {
        let endpoint = self.endpoint()?;
        info!(
            "Cloud text request: provider={} model={}",
            self.provider.display_name(),
            self.model
        );
        let body = ChatRequest::new(Some(&self.model), prompt);
        run_cancellable(cancel, self.client.send(&endpoint, &body)).await
    }

    async fn generate(
        &self,
        request: &StoryRequest,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<StoryDraft, GenerationError> {
        let prompt = request.prompt(CLOUD_TEMPERATURE, request.token_budget() * 2);
        generate_via_chat(self, request, prompt, progress, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::credentials::StaticCredentials;
    use crate::core::safety::BasicSafetyGate;
    use crate::services::progress;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn story_json() -> String {
        json!({
            "title": "Pip's Garden",
            "authorLine": "Written by Pip",
            "moral": "Patience helps things grow.",
            "characterDescriptions": "Pip - a small orange fox in a green scarf",
            "pages": [
                {"pageNumber": 1, "text": "Pip plants a seed.", "imagePrompt": "Pip, planting"},
                {"pageNumber": 2, "text": "Pip waits.", "imagePrompt": "Pip, waiting"}
            ]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_missing_token_is_unavailable() {
        let backend = CloudBackend::new(
            CloudProvider::TogetherAi,
            "m".into(),
            Arc::new(StaticCredentials::default()),
        );
        match backend.check_availability().await {
            Availability::Unavailable(reason) => assert!(reason.contains("Together AI")),
            Availability::Available => panic!("expected unavailable"),
        }
        let request = StoryRequest::new("a fox", 4, Arc::new(BasicSafetyGate));
        let err = backend
            .generate(&request, &ProgressSink::disabled(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn test_openrouter_generation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer or-key"))
            .and(header("x-title", "StoryFox"))
            .and(body_partial_json(json!({"model": "meta-llama/llama-3.3-70b-instruct", "max_tokens": 1600})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": story_json()}}]
            })))
            .mount(&server)
            .await;

        let credentials = StaticCredentials::default().with(CloudProvider::OpenRouter, "or-key");
        let model = CloudProvider::OpenRouter.configured_model(&ModelSelection::default());
        let backend = CloudBackend::new(CloudProvider::OpenRouter, model, Arc::new(credentials))
            .with_url(&format!("{}/api/v1/chat/completions", server.uri()));

        let (sink, mut rx) = progress::channel();
        let request = StoryRequest::new("a fox who gardens", 4, Arc::new(BasicSafetyGate));
        let draft = backend
            .generate(&request, &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(draft.title, "Pip's Garden");
        assert_eq!(draft.pages.len(), 2);

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            progress::ProgressEvent::Status("Generating story with OpenRouter...".into())
        );
    }

    #[test]
    fn test_blank_model_uses_default() {
        let mut models = ModelSelection::default();
        models.hugging_face_text_model = "  ".into();
        assert_eq!(
            CloudProvider::HuggingFace.configured_model(&models),
            CloudProvider::HuggingFace.default_text_model()
        );
        models.together_text_model = "custom/model".into();
        assert_eq!(
            CloudProvider::TogetherAi.configured_model(&models),
            "custom/model"
        );
    }
}
