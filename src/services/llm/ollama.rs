//! Client for the local model daemon's streaming protocol: newline-delimited
//! JSON for `/api/chat` and `/api/pull`, plain JSON for `/api/tags`.

use crate::core::error::GenerationError;
use crate::services::llm::http::ensure_success;
use crate::services::llm::ChatPrompt;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// A stream of text deltas from one generation.
pub type TextStream = BoxStream<'static, Result<String, GenerationError>>;

#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    timeout_seconds: u64,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    options: Options,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct Options {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize, Debug, Default)]
struct ChatLine {
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct LineMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize, Debug)]
struct PullLine {
    #[serde(default)]
    status: String,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    completed: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize, Debug)]
struct TagEntry {
    name: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout_seconds: u64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_seconds,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Installed model names, or an error when the daemon is unreachable.
    pub async fn installed_models(&self) -> Result<Vec<String>, GenerationError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| GenerationError::from_reqwest(e, 5))?;
        let response = ensure_success(response).await?;
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Backend(format!("unexpected tags response: {}", e)))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Streams a chat completion. With `json_mode` the daemon constrains
    /// output to a JSON document.
    pub async fn stream_chat(
        &self,
        model: &str,
        prompt: &ChatPrompt,
        json_mode: bool,
    ) -> Result<TextStream, GenerationError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatBody {
            model,
            messages: vec![
                Message {
                    role: "system",
                    content: &prompt.system,
                },
                Message {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            stream: true,
            format: json_mode.then_some("json"),
            options: Options {
                temperature: prompt.temperature,
                num_predict: prompt.max_tokens,
            },
        };

        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(self.timeout_seconds))
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::from_reqwest(e, self.timeout_seconds))?;
        let response = ensure_success(response).await.map_err(classify_refusal)?;

        let deltas = ndjson_lines(response, self.timeout_seconds)
            .map(|line| {
                let line: ChatLine = serde_json::from_value(line?)
                    .map_err(|e| GenerationError::Backend(format!("bad stream line: {}", e)))?;
                if let Some(error) = line.error {
                    return Err(classify_refusal(GenerationError::Backend(error)));
                }
                if line.done && line.done_reason.as_deref() == Some("content_filter") {
                    return Err(GenerationError::GuardrailViolation(
                        "response stopped by the content filter".to_string(),
                    ));
                }
                Ok(line.message.map(|m| m.content).unwrap_or_default())
            })
            .boxed();
        Ok(deltas)
    }

    /// Pulls `model`, calling `on_percent` whenever the download percentage
    /// changes.
    pub async fn pull<F>(&self, model: &str, mut on_percent: F) -> Result<(), GenerationError>
    where
        F: FnMut(u8) + Send,
    {
        let url = format!("{}/api/pull", self.base_url);
        // No request timeout: it would cover the whole multi-gigabyte body.
        // Callers stop a stalled pull through cancellation.
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "model": model, "stream": true }))
            .send()
            .await
            .map_err(|e| GenerationError::from_reqwest(e, self.timeout_seconds))?;
        let response = ensure_success(response).await?;

        let mut lines = ndjson_lines(response, self.timeout_seconds);
        let mut last_percent: Option<u8> = None;
        while let Some(line) = lines.next().await {
            let line: PullLine = serde_json::from_value(line?)
                .map_err(|e| GenerationError::Backend(format!("bad pull line: {}", e)))?;
            if let Some(error) = line.error {
                return Err(GenerationError::Backend(format!(
                    "Could not load model {}: {}",
                    model, error
                )));
            }
            if let (Some(total), Some(completed)) = (line.total, line.completed) {
                if total > 0 {
                    let percent = ((completed.min(total) * 100) / total) as u8;
                    if last_percent != Some(percent) {
                        last_percent = Some(percent);
                        on_percent(percent);
                    }
                }
            }
            if line.status == "success" {
                debug!("Model {} ready", model);
                break;
            }
        }
        Ok(())
    }
}

/// Safety-classifier refusals become `GuardrailViolation`; everything else is
/// left alone.
pub fn classify_refusal(err: GenerationError) -> GenerationError {
    let message = match &err {
        GenerationError::Backend(m) => m.clone(),
        GenerationError::Http { excerpt, .. } => excerpt.clone(),
        _ => return err,
    };
    let lower = message.to_lowercase();
    if lower.contains("guardrail") || lower.contains("safety") || lower.contains("content_filter") {
        GenerationError::GuardrailViolation(message)
    } else {
        err
    }
}

/// Splits a streamed body into JSON values, one per non-blank line.
pub fn ndjson_lines(
    response: reqwest::Response,
    timeout_seconds: u64,
) -> BoxStream<'static, Result<Value, GenerationError>> {
    let bytes = response.bytes_stream().boxed();
    stream::unfold(
        (bytes, Vec::<u8>::new(), false),
        move |(mut bytes, mut buf, mut finished)| async move {
            loop {
                let line = if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    buf.drain(..=pos).collect::<Vec<u8>>()
                } else if finished {
                    if buf.is_empty() {
                        return None;
                    }
                    std::mem::take(&mut buf)
                } else {
                    match bytes.next().await {
                        Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                        Some(Err(e)) => {
                            buf.clear();
                            return Some((
                                Err(GenerationError::from_reqwest(e, timeout_seconds)),
                                (bytes, buf, true),
                            ));
                        }
                        None => finished = true,
                    }
                    continue;
                };

                let text = String::from_utf8_lossy(&line);
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                let item = serde_json::from_str::<Value>(text)
                    .map_err(|e| GenerationError::Backend(format!("invalid stream line: {}", e)));
                return Some((item, (bytes, buf, finished)));
            }
        },
    )
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn prompt() -> ChatPrompt {
        ChatPrompt {
            system: "s".into(),
            user: "u".into(),
            temperature: 1.2,
            max_tokens: 50,
        }
    }

    async fn collect(mut stream: TextStream) -> Result<String, GenerationError> {
        let mut out = String::new();
        while let Some(delta) = stream.next().await {
            out.push_str(&delta?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_stream_chat_joins_deltas() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"{\\\"a\\\"\"},\"done\":false}\n",
            "\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\":1}\"},\"done\":false}\n",
            "{\"done\":true,\"done_reason\":\"stop\"}"
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(serde_json::json!({"format": "json", "stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let client = OllamaClient::new(&server.uri(), 5);
        let stream = client.stream_chat("m", &prompt(), true).await.unwrap();
        assert_eq!(collect(stream).await.unwrap(), "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_content_filter_is_guardrail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("{\"done\":true,\"done_reason\":\"content_filter\"}\n"),
            )
            .mount(&server)
            .await;

        let client = OllamaClient::new(&server.uri(), 5);
        let stream = client.stream_chat("m", &prompt(), true).await.unwrap();
        assert!(collect(stream).await.unwrap_err().is_safety());
    }

    #[tokio::test]
    async fn test_pull_reports_percentages() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"status\":\"pulling manifest\"}\n",
            "{\"status\":\"downloading\",\"total\":200,\"completed\":50}\n",
            "{\"status\":\"downloading\",\"total\":200,\"completed\":51}\n",
            "{\"status\":\"downloading\",\"total\":200,\"completed\":200}\n",
            "{\"status\":\"success\"}\n"
        );
        Mock::given(method("POST"))
            .and(path("/api/pull"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let client = OllamaClient::new(&server.uri(), 5);
        let mut seen = Vec::new();
        client.pull("m", |p| seen.push(p)).await.unwrap();
        assert_eq!(seen, vec![25, 100]);
    }

    #[tokio::test]
    async fn test_pull_outlives_request_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/pull"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("{\"status\":\"downloading\",\"total\":4,\"completed\":4}\n")
                    .set_delay(Duration::from_millis(1500)),
            )
            .mount(&server)
            .await;

        let client = OllamaClient::new(&server.uri(), 1);
        let mut seen = Vec::new();
        client.pull("m", |p| seen.push(p)).await.unwrap();
        assert_eq!(seen, vec![100]);
    }

    #[test]
    fn test_classify_refusal() {
        assert!(classify_refusal(GenerationError::Backend(
            "Blocked by safety guardrail".into()
        ))
        .is_safety());
        assert_eq!(
            classify_refusal(GenerationError::Backend("model not found".into())),
            GenerationError::Backend("model not found".into())
        );
    }
}
