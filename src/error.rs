//! Engine error kinds.
//!
//! Everything is propagated as `anyhow::Error`; the loop downcasts to
//! `EngineError` to decide whether a failure ends the process.

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineError {
    /// Bad or missing configuration. Fatal at startup.
    Configuration(String),
    /// A payload that does not parse as the expected message. The message is dropped.
    MalformedMessage { topic: String, reason: String },
    /// A message arrived on a topic that is not wired to any source.
    UnknownSource(String),
    /// An ingestion worker stopped running.
    WorkerLiveness(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::MalformedMessage { .. } => "MALFORMED_MESSAGE",
            Self::UnknownSource(_) => "UNKNOWN_SOURCE",
            Self::WorkerLiveness(_) => "WORKER_LIVENESS",
        }
    }

    /// Only malformed payloads are recovered from; everything else stops the engine.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::MalformedMessage { .. })
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn malformed(topic: &str, reason: impl std::fmt::Display) -> Self {
        Self::MalformedMessage {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration(message) => write!(f, "{}: {}", self.code(), message),
            Self::MalformedMessage { topic, reason } => {
                write!(f, "{}: topic {}: {}", self.code(), topic, reason)
            }
            Self::UnknownSource(topic) => {
                write!(f, "{}: received a message from unknown topic {}", self.code(), topic)
            }
            Self::WorkerLiveness(detail) => write!(f, "{}: {}", self.code(), detail),
        }
    }
}

impl std::error::Error for EngineError {}

/// Returns true when `err` wraps an `EngineError` the loop may continue past.
pub fn is_recoverable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<EngineError>()
        .map(EngineError::is_recoverable)
        .unwrap_or(false)
}
