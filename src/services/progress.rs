//! Progress reporting from backends to the caller.
//!
//! Backends push [`ProgressEvent`]s into an unbounded channel; the consumer
//! decides how to coalesce them. A closed receiver is not an error: progress is
//! advisory and generation keeps going.

use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Human-readable transition, e.g. "Using OpenRouter for story drafting...".
    Status(String),
    /// Story text visible so far for the current attempt.
    Partial(String),
    /// Local model download/load progress.
    ModelLoading { percent: u8 },
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::Status(text) | ProgressEvent::Partial(text) => f.write_str(text),
            ProgressEvent::ModelLoading { percent } => {
                write!(f, "Downloading model\u{2026} {}%", percent)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Option<UnboundedSender<ProgressEvent>>,
    last_partial_len: Arc<Mutex<usize>>,
}

pub fn channel() -> (ProgressSink, UnboundedReceiver<ProgressEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSink::new(tx), rx)
}

impl ProgressSink {
    pub fn new(tx: UnboundedSender<ProgressEvent>) -> Self {
        Self {
            tx: Some(tx),
            last_partial_len: Arc::new(Mutex::new(0)),
        }
    }

    /// A sink that drops everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            last_partial_len: Arc::new(Mutex::new(0)),
        }
    }

    pub fn status(&self, message: impl Into<String>) {
        self.send(ProgressEvent::Status(message.into()));
    }

    pub fn loading(&self, percent: u8) {
        self.send(ProgressEvent::ModelLoading {
            percent: percent.min(100),
        });
    }

    /// Emits partial text only when it is more complete than the last one sent.
    pub fn partial(&self, text: &str) {
        if let Ok(mut last) = self.last_partial_len.lock() {
            if text.len() <= *last {
                return;
            }
            *last = text.len();
        }
        self.send(ProgressEvent::Partial(text.to_string()));
    }

    /// Starts a new attempt: partial text may begin from empty again.
    pub fn reset_partial(&self) {
        if let Ok(mut last) = self.last_partial_len.lock() {
            *last = 0;
        }
    }

    fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
