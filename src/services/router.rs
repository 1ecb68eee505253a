//! Chooses a backend, runs it, and falls over once to the on-device model.

use crate::core::config::{Config, TextConfig, TextProvider};
use crate::core::credentials::CredentialStore;
use crate::core::error::GenerationError;
use crate::core::state::StoryDraft;
use crate::services::llm::local::ModelCache;
use crate::services::llm::remote::RemoteEndpointConfig;
use crate::services::llm::{
    create_backend, run_cancellable, Availability, ChatPrompt, StoryBackend, StoryRequest,
};
use crate::services::progress::ProgressSink;
use log::{info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Which providers serve a request, derived from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutePlan {
    pub primary: TextProvider,
    pub fallback: Option<TextProvider>,
    pub fallback_enabled: bool,
}

impl RoutePlan {
    pub fn from_config(text: &TextConfig, remote_configured: bool) -> Self {
        match text.provider {
            TextProvider::OnDevice if remote_configured => Self {
                primary: TextProvider::Remote,
                fallback: Some(TextProvider::OnDevice),
                fallback_enabled: true,
            },
            TextProvider::OnDevice => Self {
                primary: TextProvider::OnDevice,
                fallback: None,
                fallback_enabled: false,
            },
            provider => Self {
                primary: provider,
                fallback: Some(TextProvider::OnDevice),
                fallback_enabled: text.enable_fallback,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Router {
    primary: Arc<dyn StoryBackend>,
    fallback: Option<Arc<dyn StoryBackend>>,
    enable_fallback: bool,
}

impl Router {
    pub fn new(primary: Arc<dyn StoryBackend>) -> Self {
        Self {
            primary,
            fallback: None,
            enable_fallback: false,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn StoryBackend>, enabled: bool) -> Self {
        self.fallback = Some(fallback);
        self.enable_fallback = enabled;
        self
    }

    pub fn from_config(
        config: &Config,
        credentials: Arc<dyn CredentialStore>,
        cache: Arc<ModelCache>,
    ) -> Self {
        let remote_configured = RemoteEndpointConfig::from_env(&config.remote).is_some();
        let plan = RoutePlan::from_config(&config.text, remote_configured);
        info!("Route plan: {:?}", plan);

        let router = Router::new(create_backend(
            plan.primary,
            config,
            credentials.clone(),
            cache.clone(),
        ));
        match plan.fallback {
            Some(fallback) => router.with_fallback(
                create_backend(fallback, config, credentials, cache),
                plan.fallback_enabled,
            ),
            None => router,
        }
    }

    pub fn primary_name(&self) -> String {
        self.primary.name()
    }

    pub async fn generate(
        &self,
        request: &StoryRequest,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<StoryDraft, GenerationError> {
        let primary_result = match availability(self.primary.as_ref(), cancel).await? {
            Availability::Available => {
                progress.status(format!(
                    "Using {} for story drafting...",
                    self.primary.name()
                ));
                self.primary.generate(request, progress, cancel).await
            }
            Availability::Unavailable(reason) => Err(GenerationError::NotConfigured(reason)),
        };

        let err = match primary_result {
            Ok(draft) => return Ok(draft),
            Err(err) => err,
        };

        match self.eligible_fallback(&err, cancel).await? {
            Some(fallback) => {
                warn!(
                    "{} failed ({}), falling back to {}",
                    self.primary.name(),
                    err,
                    fallback.name()
                );
                progress.status(self.switch_message(fallback.as_ref()));
                progress.reset_partial();
                fallback.generate(request, progress, cancel).await
            }
            None => Err(err),
        }
    }

    /// Plain chat exchange with the same fallback rules.
    pub async fn chat(
        &self,
        prompt: &ChatPrompt,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError> {
        let primary_result = match availability(self.primary.as_ref(), cancel).await? {
            Availability::Available => self.primary.chat(prompt, cancel).await,
            Availability::Unavailable(reason) => Err(GenerationError::NotConfigured(reason)),
        };

        let err = match primary_result {
            Ok(text) => return Ok(text),
            Err(err) => err,
        };

        match self.eligible_fallback(&err, cancel).await? {
            Some(fallback) => {
                warn!("{} chat failed ({}), using {}", self.primary.name(), err, fallback.name());
                fallback.chat(prompt, cancel).await
            }
            None => Err(err),
        }
    }

    async fn eligible_fallback(
        &self,
        err: &GenerationError,
        cancel: &CancellationToken,
    ) -> Result<Option<&Arc<dyn StoryBackend>>, GenerationError> {
        if err.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        if err.is_safety() || !self.enable_fallback {
            return Ok(None);
        }
        let Some(fallback) = self.fallback.as_ref() else {
            return Ok(None);
        };
        match availability(fallback.as_ref(), cancel).await? {
            Availability::Available => Ok(Some(fallback)),
            Availability::Unavailable(reason) => {
                info!("Fallback {} unavailable: {}", fallback.name(), reason);
                Ok(None)
            }
        }
    }

    fn switch_message(&self, fallback: &dyn StoryBackend) -> String {
        let primary = self.primary.name();
        let mut chars = primary.chars();
        let capitalised = match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
            None => primary.clone(),
        };
        format!(
            "{} unavailable, switching to {}...",
            capitalised,
            fallback.name()
        )
    }
}

async fn availability(
    backend: &dyn StoryBackend,
    cancel: &CancellationToken,
) -> Result<Availability, GenerationError> {
    run_cancellable(cancel, async { Ok(backend.check_availability().await) }).await
}
