use crate::core::config::{RemoteSettings, CLOUD_TEMPERATURE};
use crate::core::error::GenerationError;
use crate::core::state::StoryDraft;
use crate::services::llm::http::{ChatCompletionClient, ChatMessage, Endpoint};
use crate::services::llm::{run_cancellable, Availability, ChatPrompt, StoryBackend, StoryRequest};
use crate::services::progress::ProgressSink;
use async_trait::async_trait;
use log::{info, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

const DEFAULT_TIMEOUT_SECONDS: u64 = 60;
const NOT_CONFIGURED: &str = "Remote large-model endpoint is not configured.";

/// A user-operated endpoint, resolved from the environment and `config.yml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpointConfig {
    pub endpoint: url::Url,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub api_header: String,
    pub api_prefix: String,
    pub timeout_seconds: u64,
}

impl RemoteEndpointConfig {
    pub fn from_env(settings: &RemoteSettings) -> Option<Self> {
        Self::resolve(settings, |key| std::env::var(key).ok())
    }

    /// First non-blank value wins, environment before file. Returns `None`
    /// when no valid endpoint URL is set.
    pub fn resolve<F>(settings: &RemoteSettings, env: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |keys: &[&str], file: &Option<String>| -> Option<String> {
            keys.iter()
                .filter_map(|k| env(k))
                .chain(file.iter().cloned())
                .map(|v| v.trim().to_string())
                .find(|v| !v.is_empty())
        };

        let raw = pick(
            &["STORYFOX_LARGE_MODEL_ENDPOINT", "STORYFOX_REMOTE_LLM_ENDPOINT"],
            &settings.endpoint,
        )?;
        let endpoint = match url::Url::parse(&raw) {
            Ok(url) => url,
            Err(e) => {
                warn!("Ignoring remote endpoint {:?}: {}", raw, e);
                return None;
            }
        };

        // The prefix may legitimately be empty, so it is not trimmed away.
        let api_prefix = ["STORYFOX_LARGE_MODEL_API_PREFIX", "STORYFOX_REMOTE_LLM_API_PREFIX"]
            .iter()
            .filter_map(|k| env(k))
            .find(|v| !v.trim().is_empty())
            .or_else(|| settings.api_prefix.clone())
            .unwrap_or_else(|| "Bearer ".to_string());

        let timeout_seconds = pick(
            &[
                "STORYFOX_LARGE_MODEL_TIMEOUT_SECONDS",
                "STORYFOX_REMOTE_LLM_TIMEOUT_SECONDS",
            ],
            &settings.timeout_seconds.map(|t| t.to_string()),
        )
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|t| *t > 0.0)
        .map(|t| t.ceil() as u64)
        .unwrap_or(DEFAULT_TIMEOUT_SECONDS);

        Some(Self {
            endpoint,
            api_key: pick(
                &["STORYFOX_LARGE_MODEL_API_KEY", "STORYFOX_REMOTE_LLM_API_KEY"],
                &settings.api_key,
            ),
            model: pick(
                &["STORYFOX_LARGE_MODEL_NAME", "STORYFOX_REMOTE_LLM_MODEL"],
                &settings.model,
            ),
            api_header: pick(
                &["STORYFOX_LARGE_MODEL_API_HEADER", "STORYFOX_REMOTE_LLM_API_HEADER"],
                &settings.api_header,
            )
            .unwrap_or_else(|| "Authorization".to_string()),
            api_prefix,
            timeout_seconds,
        })
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint {
            url: self.endpoint.to_string(),
            auth: self
                .api_key
                .as_ref()
                .map(|key| (self.api_header.clone(), format!("{}{}", self.api_prefix, key))),
            extra_headers: Vec::new(),
            timeout_seconds: self.timeout_seconds,
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RemoteRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(rename = "max_tokens")]
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    concept: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_count: Option<usize>,
}

impl<'a> RemoteRequest<'a> {
    fn new(model: Option<&'a str>, prompt: &ChatPrompt) -> Self {
        Self {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: prompt.system.clone(),
                },
                ChatMessage {
                    role: "user",
                    content: prompt.user.clone(),
                },
            ],
            temperature: prompt.temperature,
            max_tokens: prompt.max_tokens,
            concept: None,
            page_count: None,
        }
    }
}

/// Larger model hosted by the user. Absent configuration is an availability
/// state, not an error.
#[derive(Debug, Default)]
pub struct RemoteBackend {
    config: Option<RemoteEndpointConfig>,
    client: ChatCompletionClient,
}

impl RemoteBackend {
    pub fn new(config: Option<RemoteEndpointConfig>) -> Self {
        Self {
            config,
            client: ChatCompletionClient::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    fn config(&self) -> Result<&RemoteEndpointConfig, GenerationError> {
        self.config
            .as_ref()
            .ok_or_else(|| GenerationError::NotConfigured(NOT_CONFIGURED.to_string()))
    }

    async fn post(
        &self,
        body: &RemoteRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError> {
        let config = self.config()?;
        info!(
            "Remote text request: host={} model={}",
            config.endpoint.host_str().unwrap_or("unknown"),
            config.model.as_deref().unwrap_or("(default)")
        );
        run_cancellable(cancel, self.client.send(&config.endpoint(), body)).await
    }
}

#[async_trait]
impl StoryBackend for RemoteBackend {
    fn name(&self) -> String {
        "larger model".to_string()
    }

    async fn check_availability(&self) -> Availability {
        match &self.config {
            Some(_) => Availability::Available,
            None => Availability::Unavailable(NOT_CONFIGURED.to_string()),
        }
    }

    async fn chat(
        &self,
        prompt: &ChatPrompt,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError> {
        let config = self.config()?;
        let body = RemoteRequest::new(config.model.as_deref(), prompt);
        self.post(&body, cancel).await
    }

    async fn generate(
        &self,
        request: &StoryRequest,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<StoryDraft, GenerationError> {
        let config = self.config()?;
        let prompt = request.prompt(CLOUD_TEMPERATURE, request.token_budget());
        let mut body = RemoteRequest::new(config.model.as_deref(), &prompt);
        body.concept = Some(&request.concept);
        body.page_count = Some(request.page_count);

        progress.status(format!("Generating story with {}...", self.name()));
        let text = self.post(&body, cancel).await?;
        progress.status("Parsing story response...");
        request.decode(&text)
    }
}
