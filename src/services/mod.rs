pub mod decoder;
pub mod guardrail;
pub mod llm;
pub mod progress;
pub mod prompts;
pub mod qa;
pub mod repair;
pub mod router;
pub mod session;
pub mod suggestions;
