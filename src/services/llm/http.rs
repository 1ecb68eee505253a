//! OpenAI-compatible chat-completion transport shared by the cloud and remote
//! backends.

use crate::core::error::GenerationError;
use crate::services::decoder::extract_text_content;
use crate::services::llm::ChatPrompt;
use crate::utils::text::excerpt;
use log::{debug, info};
use reqwest::header::RETRY_AFTER;
use reqwest::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

const EXCERPT_CHARS: usize = 500;

/// Where and how to send a request.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: String,
    /// Header name and full value, e.g. ("Authorization", "Bearer sk-...").
    pub auth: Option<(String, String)>,
    pub extra_headers: Vec<(String, String)>,
    pub timeout_seconds: u64,
}

#[derive(Serialize, Debug)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Serialize, Debug)]
pub struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatRequest {
    pub fn new(model: Option<&str>, prompt: &ChatPrompt) -> Self {
        Self {
            model: model.map(str::to_string),
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
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatCompletionClient {
    client: reqwest::Client,
}

impl ChatCompletionClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// POSTs `body` and returns the generated text. Chat-completion envelopes
    /// are unwrapped; any other body is returned as-is for the decoder.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        endpoint: &Endpoint,
        body: &T,
    ) -> Result<String, GenerationError> {
        let host = url::Url::parse(&endpoint.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        info!("Chat completion -> {}", host);

        let mut request = self
            .client
            .post(&endpoint.url)
            .timeout(Duration::from_secs(endpoint.timeout_seconds))
            .json(body);
        if let Some((name, value)) = &endpoint.auth {
            request = request.header(name.as_str(), value.as_str());
        }
        for (name, value) in &endpoint.extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| GenerationError::from_reqwest(e, endpoint.timeout_seconds))?;
        let response = ensure_success(response).await?;
        let raw = response
            .text()
            .await
            .map_err(|e| GenerationError::from_reqwest(e, endpoint.timeout_seconds))?;
        debug!("Received {} bytes from {}", raw.len(), host);

        if raw.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        let text = serde_json::from_str::<serde_json::Value>(&raw)
            .ok()
            .and_then(|v| extract_text_content(&v))
            .unwrap_or(raw);
        Ok(text)
    }
}

/// Maps non-2xx responses: 429 keeps the Retry-After seconds, everything else
/// keeps the status and the start of the body.
pub async fn ensure_success(response: Response) -> Result<Response, GenerationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        return Err(GenerationError::RateLimited { retry_after });
    }

    let body = response.text().await.unwrap_or_default();
    Err(GenerationError::Http {
        status: status.as_u16(),
        excerpt: excerpt(&body, EXCERPT_CHARS),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoint(server: &MockServer) -> Endpoint {
        Endpoint {
            url: format!("{}/v1/chat/completions", server.uri()),
            auth: Some(("Authorization".into(), "Bearer sk-test".into())),
            extra_headers: vec![("X-Title".into(), "StoryFox".into())],
            timeout_seconds: 5,
        }
    }

    fn prompt() -> ChatPrompt {
        ChatPrompt {
            system: "sys".into(),
            user: "hello".into(),
            temperature: 0.7,
            max_tokens: 100,
        }
    }

    #[tokio::test]
    async fn test_chat_envelope_is_unwrapped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(header("x-title", "StoryFox"))
            .and(body_partial_json(json!({"model": "m", "max_tokens": 100})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "hi there"}}]
            })))
            .mount(&server)
            .await;

        let client = ChatCompletionClient::new();
        let text = client
            .send(&endpoint(&server), &ChatRequest::new(Some("m"), &prompt()))
            .await
            .unwrap();
        assert_eq!(text, "hi there");
    }

    #[tokio::test]
    async fn test_rate_limit_keeps_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
            .mount(&server)
            .await;

        let err = ChatCompletionClient::new()
            .send(&endpoint(&server), &ChatRequest::new(None, &prompt()))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GenerationError::RateLimited {
                retry_after: Some(30)
            }
        );
    }

    #[tokio::test]
    async fn test_server_error_excerpt_is_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(2000)))
            .mount(&server)
            .await;

        let err = ChatCompletionClient::new()
            .send(&endpoint(&server), &ChatRequest::new(None, &prompt()))
            .await
            .unwrap_err();
        match err {
            GenerationError::Http { status, excerpt } => {
                assert_eq!(status, 500);
                assert_eq!(excerpt.len(), 500);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let mut ep = endpoint(&server);
        ep.timeout_seconds = 1;
        let err = ChatCompletionClient::new()
            .send(&ep, &ChatRequest::new(None, &prompt()))
            .await
            .unwrap_err();
        assert_eq!(err, GenerationError::Timeout { seconds: 1 });
    }
}
