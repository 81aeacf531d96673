use std::fmt;

use thiserror::Error;

/// Where a request was when its deadline passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    /// Still waiting for the inference slot; `generate` was never called.
    Queued,
    /// Admitted into the slot; the result was discarded.
    Running,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => f.write_str("queued"),
            Self::Running => f.write_str("running"),
        }
    }
}

/// Typed error variants for the hearth inference service.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Model load failed: {0}")]
    Load(String),

    #[error("Request rejected: waiting queue is full ({capacity} slots)")]
    Rejected { capacity: usize },

    #[error("Request timed out after {elapsed_ms} ms while {stage}")]
    Timeout { stage: TimeoutStage, elapsed_ms: u64 },

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Service not ready: {0}")]
    NotReady(String),

    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Return a machine-readable error code string for this error variant.
    pub fn code(&self) -> &str {
        match self {
            Self::Load(_) => "LOAD_ERROR",
            Self::Rejected { .. } => "REJECTED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Inference(_) => "INFERENCE_ERROR",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::NotReady(_) => "NOT_READY",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Transient errors the caller may retry later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Rejected { .. } | Self::Timeout { .. } | Self::NotReady(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(EngineError::Rejected { capacity: 2 }.code(), "REJECTED");
        assert_eq!(EngineError::Inference("x".into()).code(), "INFERENCE_ERROR");
        assert_eq!(EngineError::ShuttingDown.code(), "SHUTTING_DOWN");
    }

    #[test]
    fn timeout_message_names_stage() {
        let err = EngineError::Timeout {
            stage: TimeoutStage::Queued,
            elapsed_ms: 2000,
        };
        assert_eq!(err.to_string(), "Request timed out after 2000 ms while queued");
        assert!(err.is_transient());
    }

    #[test]
    fn load_and_inference_are_not_transient() {
        assert!(!EngineError::Load("bad".into()).is_transient());
        assert!(!EngineError::Inference("bad".into()).is_transient());
    }
}
