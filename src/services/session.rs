use crate::core::config::{
    clamp_page_count, Audience, TextConfig, CONCEPT_MAX_LENGTH, ENRICHED_CONCEPT_MAX_LENGTH,
};
use crate::core::error::GenerationError;
use crate::core::safety::{ConceptCheck, SafetyGate};
use crate::core::state::Story;
use crate::services::llm::StoryRequest;
use crate::services::progress::ProgressSink;
use crate::services::repair;
use crate::services::router::Router;
use log::{info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed(Story),
    /// User-facing message; the session stays usable.
    Failed(String),
    /// Silent reset, never shown as an error.
    Cancelled,
}

/// Runs one story attempt at a time. Starting a new attempt cancels the one
/// in flight.
#[derive(Debug)]
pub struct GenerationSession {
    router: Arc<Router>,
    gate: Arc<dyn SafetyGate>,
    audience: Audience,
    pad_missing_pages: bool,
    next_attempt: AtomicU64,
    current: Mutex<Option<(u64, CancellationToken)>>,
}

impl GenerationSession {
    pub fn new(router: Arc<Router>, gate: Arc<dyn SafetyGate>) -> Self {
        Self {
            router,
            gate,
            audience: Audience::default(),
            pad_missing_pages: true,
            next_attempt: AtomicU64::new(1),
            current: Mutex::new(None),
        }
    }

    pub fn from_config(router: Arc<Router>, gate: Arc<dyn SafetyGate>, text: &TextConfig) -> Self {
        Self::new(router, gate)
            .with_audience(text.audience)
            .padded(text.pad_missing_pages)
    }

    pub fn with_audience(mut self, audience: Audience) -> Self {
        self.audience = audience;
        self
    }

    pub fn padded(mut self, pad: bool) -> Self {
        self.pad_missing_pages = pad;
        self
    }

    /// Aborts the active attempt, if any.
    pub fn cancel(&self) {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((id, token)) = current.as_ref() {
            info!("Cancelling generation attempt {}", id);
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub async fn generate(
        &self,
        concept: &str,
        page_count: usize,
        enriched: bool,
        progress: &ProgressSink,
    ) -> SessionOutcome {
        let max_length = if enriched {
            ENRICHED_CONCEPT_MAX_LENGTH
        } else {
            CONCEPT_MAX_LENGTH
        };
        let concept = match self.gate.validate_concept(concept, max_length) {
            // Enriched concepts keep their line structure.
            ConceptCheck::Allowed(_) if enriched => concept.trim().to_string(),
            ConceptCheck::Allowed(clean) => clean,
            ConceptCheck::Blocked(reason) => {
                info!("Concept rejected: {}", reason);
                return SessionOutcome::Failed(reason);
            }
        };

        let (id, cancel) = self.begin_attempt();
        let page_count = clamp_page_count(page_count);
        info!(
            "Attempt {}: drafting {} pages (enriched: {})",
            id, page_count, enriched
        );

        progress.reset_partial();
        let request = StoryRequest::new(&concept, page_count, self.gate.clone())
            .with_audience(self.audience)
            .padded(self.pad_missing_pages);
        let result = self.router.generate(&request, progress, &cancel).await;
        self.finish_attempt(id);

        match result {
            Ok(draft) => {
                let story = repair::enrich(draft);
                info!(
                    "Attempt {} complete: '{}' ({} pages, {} characters)",
                    id,
                    story.title,
                    story.pages.len(),
                    story.characters.len()
                );
                SessionOutcome::Completed(story)
            }
            Err(GenerationError::Cancelled) => {
                info!("Attempt {} cancelled", id);
                SessionOutcome::Cancelled
            }
            Err(e) => {
                warn!("Attempt {} failed: {}", id, e);
                SessionOutcome::Failed(e.user_message())
            }
        }
    }

    fn begin_attempt(&self) -> (u64, CancellationToken) {
        let id = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((previous, old)) = current.replace((id, token.clone())) {
            info!("Attempt {} superseded by {}", previous, id);
            old.cancel();
        }
        (id, token)
    }

    fn finish_attempt(&self, id: u64) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(current.as_ref(), Some((active, _)) if *active == id) {
            *current = None;
        }
    }
}
