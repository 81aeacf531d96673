use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::models::GenerationParams;

/// A generation request as it enters the Request Gate.
///
/// The deadline is not part of the request: the gate stamps it once, at
/// admission, from `timeout` (or the configured default).
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub id: String,
    pub prompt: String,
    pub params: GenerationParams,
    pub timeout: Option<Duration>,
}

impl InferenceRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            params: GenerationParams::default(),
            timeout: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Why generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// EOS token or a stop sequence.
    Stop,
    /// `max_tokens` or the context window was exhausted.
    MaxTokens,
    Timeout,
    Cancelled,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::MaxTokens => "max_tokens",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Outcome of a successful request, passed back to the caller unmodified.
#[derive(Debug, Clone)]
pub struct InferenceResult {
    pub id: String,
    pub text: String,
    pub prompt_tokens: u64,
    pub tokens_generated: u64,
    pub finish_reason: FinishReason,
    /// Time spent inside `generate`.
    pub elapsed: Duration,
    /// Time spent waiting for the inference slot.
    pub queued_for: Duration,
}
