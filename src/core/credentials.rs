use crate::core::config::CredentialsConfig;
use crate::services::llm::cloud::CloudProvider;
use std::collections::HashMap;
use std::fmt::Debug;

pub trait CredentialStore: Send + Sync + Debug {
    fn bearer_token(&self, provider: CloudProvider) -> Option<String>;
}

type EnvLookup = fn(&str) -> Option<String>;

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Reads tokens from the environment first, then from `config.yml`.
#[derive(Debug, Clone)]
pub struct EnvCredentialStore {
    configured: CredentialsConfig,
    env: EnvLookup,
}

impl Default for EnvCredentialStore {
    fn default() -> Self {
        Self::new(CredentialsConfig::default())
    }
}

impl EnvCredentialStore {
    pub fn new(configured: CredentialsConfig) -> Self {
        Self {
            configured,
            env: process_env,
        }
    }

    /// Replaces the process environment as the first lookup.
    pub fn with_env(mut self, env: EnvLookup) -> Self {
        self.env = env;
        self
    }

    fn env_keys(provider: CloudProvider) -> &'static [&'static str] {
        match provider {
            CloudProvider::OpenRouter => &["OPENROUTER_API_KEY"],
            CloudProvider::TogetherAi => &["TOGETHER_API_KEY"],
            CloudProvider::HuggingFace => &["HF_TOKEN", "HUGGING_FACE_HUB_TOKEN"],
        }
    }
}

impl CredentialStore for EnvCredentialStore {
    fn bearer_token(&self, provider: CloudProvider) -> Option<String> {
        let from_env = Self::env_keys(provider)
            .iter()
            .filter_map(|key| (self.env)(key))
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty());
        if from_env.is_some() {
            return from_env;
        }

        let configured = match provider {
            CloudProvider::OpenRouter => &self.configured.openrouter,
            CloudProvider::TogetherAi => &self.configured.together_ai,
            CloudProvider::HuggingFace => &self.configured.hugging_face,
        };
        configured
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

/// Fixed token map, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    tokens: HashMap<CloudProvider, String>,
}

impl StaticCredentials {
    pub fn with(mut self, provider: CloudProvider, token: &str) -> Self {
        self.tokens.insert(provider, token.to_string());
        self
    }
}

impl CredentialStore for StaticCredentials {
    fn bearer_token(&self, provider: CloudProvider) -> Option<String> {
        self.tokens.get(&provider).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_key: &str) -> Option<String> {
        None
    }

    fn configured() -> CredentialsConfig {
        CredentialsConfig {
            together_ai: Some("  tok-123  ".into()),
            openrouter: Some("   ".into()),
            hugging_face: None,
        }
    }

    #[test]
    fn test_configured_token_is_trimmed() {
        let store = EnvCredentialStore::new(configured()).with_env(no_env);
        assert_eq!(
            store.bearer_token(CloudProvider::TogetherAi).as_deref(),
            Some("tok-123")
        );
        assert_eq!(store.bearer_token(CloudProvider::OpenRouter), None);
        assert_eq!(store.bearer_token(CloudProvider::HuggingFace), None);
    }

    #[test]
    fn test_environment_wins_over_config() {
        let store = EnvCredentialStore::new(configured()).with_env(|key| match key {
            "TOGETHER_API_KEY" => Some("env-tok".into()),
            "HF_TOKEN" => Some("  ".into()),
            "HUGGING_FACE_HUB_TOKEN" => Some("hf_env".into()),
            _ => None,
        });
        assert_eq!(
            store.bearer_token(CloudProvider::TogetherAi).as_deref(),
            Some("env-tok")
        );
        assert_eq!(
            store.bearer_token(CloudProvider::HuggingFace).as_deref(),
            Some("hf_env")
        );
        assert_eq!(store.bearer_token(CloudProvider::OpenRouter), None);
    }

    #[test]
    fn test_static_credentials() {
        let store = StaticCredentials::default().with(CloudProvider::HuggingFace, "hf_x");
        assert_eq!(
            store.bearer_token(CloudProvider::HuggingFace).as_deref(),
            Some("hf_x")
        );
        assert_eq!(store.bearer_token(CloudProvider::OpenRouter), None);
    }
}
