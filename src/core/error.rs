use thiserror::Error;

/// Failure kinds shared by every backend, the decoder and the orchestrator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("Model response could not be parsed into a story.")]
    Unparsable,

    #[error("Model response did not include valid pages.")]
    ContentRejected,

    #[error("rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("HTTP {status}: {excerpt}")]
    Http { status: u16, excerpt: String },

    #[error("request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("safety guardrail violation: {0}")]
    GuardrailViolation(String),

    #[error("generation cancelled")]
    Cancelled,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("backend failure: {0}")]
    Backend(String),

    #[error("backend returned an empty response")]
    EmptyResponse,
}

impl GenerationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GenerationError::Cancelled)
    }

    /// Safety refusals never trigger fallback; the user has to rephrase.
    pub fn is_safety(&self) -> bool {
        matches!(self, GenerationError::GuardrailViolation(_))
    }

    /// Whether trying again later (same or different backend) may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::RateLimited { .. }
            | GenerationError::Timeout { .. }
            | GenerationError::Transport(_)
            | GenerationError::GuardrailViolation(_)
            | GenerationError::Unparsable
            | GenerationError::ContentRejected
            | GenerationError::EmptyResponse => true,
            GenerationError::Http { status, .. } => *status >= 500 || *status == 408,
            GenerationError::NotConfigured(_)
            | GenerationError::Backend(_)
            | GenerationError::Cancelled => false,
        }
    }

    /// Text shown to the user. Every message leaves the session retryable.
    pub fn user_message(&self) -> String {
        match self {
            GenerationError::NotConfigured(reason) => reason.clone(),
            GenerationError::Unparsable | GenerationError::ContentRejected => {
                format!("{} Please try again.", self)
            }
            GenerationError::RateLimited {
                retry_after: Some(secs),
            } => format!(
                "The provider is rate limiting requests. Try again in {} seconds.",
                secs
            ),
            GenerationError::RateLimited { retry_after: None } => {
                "The provider is rate limiting requests. Please wait a moment and try again."
                    .to_string()
            }
            GenerationError::Http { status, excerpt } => {
                format!("Story request failed ({}): {}", status, excerpt)
            }
            GenerationError::Timeout { .. } => {
                "The story request took too long. Please try again.".to_string()
            }
            GenerationError::GuardrailViolation(_) => {
                "The safety filter blocked this request. Please rephrase with gentler, \
                 child-friendly wording and try again."
                    .to_string()
            }
            GenerationError::Cancelled => String::new(),
            GenerationError::Transport(msg) => {
                format!("Could not reach the story provider: {}", msg)
            }
            GenerationError::Backend(msg) => msg.clone(),
            GenerationError::EmptyResponse => {
                "The story generator returned an empty response. Please try again.".to_string()
            }
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, timeout_seconds: u64) -> Self {
        if err.is_timeout() {
            GenerationError::Timeout {
                seconds: timeout_seconds,
            }
        } else {
            GenerationError::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(GenerationError::Cancelled.is_cancelled());
        assert!(GenerationError::GuardrailViolation("x".into()).is_safety());
        assert!(!GenerationError::Unparsable.is_safety());
        assert!(GenerationError::Http {
            status: 503,
            excerpt: String::new()
        }
        .is_retryable());
        assert!(!GenerationError::Http {
            status: 401,
            excerpt: String::new()
        }
        .is_retryable());
        assert!(!GenerationError::NotConfigured("no key".into()).is_retryable());
    }

    #[test]
    fn test_user_messages() {
        let msg = GenerationError::RateLimited {
            retry_after: Some(30),
        }
        .user_message();
        assert!(msg.contains("30 seconds"));
        assert!(GenerationError::GuardrailViolation("blocked".into())
            .user_message()
            .contains("rephrase"));
        assert_eq!(
            GenerationError::NotConfigured("Add an API key.".into()).user_message(),
            "Add an API key."
        );
        assert!(GenerationError::Cancelled.user_message().is_empty());
    }
}
