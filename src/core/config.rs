use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const MIN_PAGES: usize = 4;
pub const MAX_PAGES: usize = 16;
pub const DEFAULT_PAGES: usize = 8;

pub const ON_DEVICE_TEMPERATURE: f32 = 1.2;
pub const CLOUD_TEMPERATURE: f32 = 0.7;

/// Retries granted after a guardrail false positive.
pub const GUARDRAIL_RETRY_ATTEMPTS: u32 = 1;
pub const GUARDRAIL_RETRY_DELAY: Duration = Duration::from_millis(500);

pub const CLOUD_TEXT_TIMEOUT_SECONDS: u64 = 120;
pub const QA_MAX_ROUNDS: usize = 4;
pub const QA_MAX_TOKENS: u32 = 1200;

pub const CONCEPT_MAX_LENGTH: usize = 220;
pub const ENRICHED_CONCEPT_MAX_LENGTH: usize = 1500;

/// Token budget: ~150 tokens per page for text and prompt plus structural overhead.
pub fn maximum_response_tokens(page_count: usize) -> u32 {
    (150 * page_count + 200) as u32
}

pub fn clamp_page_count(page_count: usize) -> usize {
    page_count.clamp(MIN_PAGES, MAX_PAGES)
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default)]
    pub text: TextConfig,

    #[serde(default)]
    pub models: ModelSelection,

    #[serde(default)]
    pub on_device: OnDeviceConfig,

    #[serde(default)]
    pub local_model: LocalModelConfig,

    #[serde(default)]
    pub remote: RemoteSettings,

    #[serde(default)]
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TextProvider {
    #[default]
    OnDevice,
    LocalModel,
    OpenRouter,
    TogetherAi,
    HuggingFace,
    Remote,
}

impl TextProvider {
    pub fn is_cloud(&self) -> bool {
        matches!(
            self,
            TextProvider::OpenRouter | TextProvider::TogetherAi | TextProvider::HuggingFace
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    #[default]
    Kid,
    Adult,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TextConfig {
    #[serde(default)]
    pub provider: TextProvider,
    #[serde(default = "default_true")]
    pub enable_fallback: bool,
    #[serde(default)]
    pub audience: Audience,
    #[serde(default = "default_page_count")]
    pub page_count: usize,
    #[serde(default = "default_true")]
    pub pad_missing_pages: bool,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            provider: TextProvider::default(),
            enable_fallback: true,
            audience: Audience::default(),
            page_count: DEFAULT_PAGES,
            pad_missing_pages: true,
        }
    }
}

/// Per-provider model identifiers. Blank cloud ids mean "use the provider default".
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelSelection {
    #[serde(default = "default_local_model_id")]
    pub local_model_id: String,
    #[serde(default)]
    pub openrouter_text_model: String,
    #[serde(default)]
    pub together_text_model: String,
    #[serde(default)]
    pub hugging_face_text_model: String,
}

impl Default for ModelSelection {
    fn default() -> Self {
        Self {
            local_model_id: default_local_model_id(),
            openrouter_text_model: String::new(),
            together_text_model: String::new(),
            hugging_face_text_model: String::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OnDeviceConfig {
    #[serde(default = "default_daemon_url")]
    pub base_url: String,
    #[serde(default = "default_on_device_model")]
    pub model: String,
    #[serde(default = "default_on_device_timeout")]
    pub timeout_seconds: u64,
}

impl Default for OnDeviceConfig {
    fn default() -> Self {
        Self {
            base_url: default_daemon_url(),
            model: default_on_device_model(),
            timeout_seconds: default_on_device_timeout(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LocalModelConfig {
    #[serde(default = "default_daemon_url")]
    pub base_url: String,
    #[serde(default = "default_local_timeout")]
    pub timeout_seconds: u64,
}

impl Default for LocalModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_daemon_url(),
            timeout_seconds: default_local_timeout(),
        }
    }
}

/// File-level remote endpoint settings; environment variables take precedence.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RemoteSettings {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub api_header: Option<String>,
    pub api_prefix: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CredentialsConfig {
    pub openrouter: Option<String>,
    pub together_ai: Option<String>,
    pub hugging_face: Option<String>,
}

fn default_output() -> String {
    "output".to_string()
}
fn default_true() -> bool {
    true
}
fn default_page_count() -> usize {
    DEFAULT_PAGES
}
fn default_local_model_id() -> String {
    "qwen2.5:3b-instruct".to_string()
}
fn default_daemon_url() -> String {
    "http://127.0.0.1:11434".to_string()
}
fn default_on_device_model() -> String {
    "llama3.2:3b".to_string()
}
fn default_on_device_timeout() -> u64 {
    120
}
fn default_local_timeout() -> u64 {
    300
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Path::new("config.yml");
        if !path.exists() {
            anyhow::bail!("config.yml not found. Please create one.");
        }
        Self::load_from(path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.output_folder)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yml");
        fs::write(&path, "{}")?;

        let config = Config::load_from(&path)?;
        assert_eq!(config.text.provider, TextProvider::OnDevice);
        assert!(config.text.enable_fallback);
        assert_eq!(config.text.page_count, DEFAULT_PAGES);
        assert_eq!(config.output_folder, "output");
        assert!(config.remote.endpoint.is_none());
        Ok(())
    }

    #[test]
    fn test_provider_and_remote_parsing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yml");
        fs::write(
            &path,
            r#"
text:
  provider: together_ai
  enable_fallback: false
  audience: adult
models:
  together_text_model: "meta-llama/Llama-3.3-70B-Instruct-Turbo"
remote:
  endpoint: "https://llm.example.com/v1/chat/completions"
  api_header: "X-Api-Key"
  api_prefix: ""
  timeout_seconds: 90
"#,
        )?;

        let config = Config::load_from(&path)?;
        assert_eq!(config.text.provider, TextProvider::TogetherAi);
        assert!(config.text.provider.is_cloud());
        assert!(!config.text.enable_fallback);
        assert_eq!(config.text.audience, Audience::Adult);
        assert_eq!(config.remote.api_header.as_deref(), Some("X-Api-Key"));
        assert_eq!(config.remote.timeout_seconds, Some(90));
        Ok(())
    }

    #[test]
    fn test_invalid_yaml_is_reported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yml");
        fs::write(&path, "text:\n  provider: carrier_pigeon\n")?;
        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
        Ok(())
    }

    #[test]
    fn test_page_budget() {
        assert_eq!(maximum_response_tokens(8), 1400);
        assert_eq!(clamp_page_count(1), MIN_PAGES);
        assert_eq!(clamp_page_count(40), MAX_PAGES);
    }
}
