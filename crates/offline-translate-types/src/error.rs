//! Error taxonomy shared by the caller side and the compute worker.
//!
//! Errors cross the channel as `error` envelopes, so both the kind and the
//! payload shape are serializable.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of failure kinds.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidInput,
    UnsupportedLanguagePair,
    ModelLoadFailed,
    TranslationFailed,
    TranslationTimeout,
    WorkerError,
    WorkerInitializationFailed,
    WorkerCommunicationError,
    Cancelled,
    Reset,
}

impl ErrorKind {
    /// Transient kinds that the default retry predicate retries.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::WorkerError
                | ErrorKind::TranslationTimeout
                | ErrorKind::WorkerCommunicationError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::UnsupportedLanguagePair => "UNSUPPORTED_LANGUAGE_PAIR",
            ErrorKind::ModelLoadFailed => "MODEL_LOAD_FAILED",
            ErrorKind::TranslationFailed => "TRANSLATION_FAILED",
            ErrorKind::TranslationTimeout => "TRANSLATION_TIMEOUT",
            ErrorKind::WorkerError => "WORKER_ERROR",
            ErrorKind::WorkerInitializationFailed => "WORKER_INITIALIZATION_FAILED",
            ErrorKind::WorkerCommunicationError => "WORKER_COMMUNICATION_ERROR",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Reset => "RESET",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged error. Also the payload of an `error` envelope.
#[derive(thiserror::Error, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct TranslateError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl TranslateError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn unsupported_pair(source: &str, target: &str) -> Self {
        Self::new(
            ErrorKind::UnsupportedLanguagePair,
            format!("Unsupported language pair: {source} -> {target}"),
        )
    }

    pub fn cancelled(request_id: &str) -> Self {
        Self::new(
            ErrorKind::Cancelled,
            format!("Request {request_id} was cancelled"),
        )
    }

    pub fn reset() -> Self {
        Self::new(ErrorKind::Reset, "Translation service was reset")
    }

    pub fn timeout(request_id: &str, timeout_ms: u64) -> Self {
        Self::new(
            ErrorKind::TranslationTimeout,
            format!("Request {request_id} timed out after {timeout_ms}ms"),
        )
    }

    pub fn worker(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::WorkerError, message)
    }

    pub fn communication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::WorkerCommunicationError, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}
