//! Error taxonomy for the engine (§7 of the design document).
//!
//! Recoverable kinds are handled inline by the component that produced them
//! (turned into an `ExceptionEncountered`/`BufferStateChanged` event) and
//! never bubble up as an `Err`. `Fatal` is the one variant that propagates,
//! via the `CriticalFailureHook` capability rather than a plain `Err` return,
//! so the caller can decide to tear the connection down and reconnect.

use crate::topic::Topic;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed message on {topic}: {reason}")]
    MalformedMessage { topic: Topic, reason: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("buffer overrun on {topic}, sequence {sequence}")]
    Overrun { topic: Topic, sequence: u32 },

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("missing-message timeout on {0}")]
    Timeout(Topic),
}

impl EngineError {
    pub fn malformed(topic: Topic, reason: impl Into<String>) -> Self {
        EngineError::MalformedMessage {
            topic,
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        EngineError::Fatal(reason.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Fatal(_))
    }
}

/// Invoked when an `EngineError::Fatal` occurs. The runtime above the core
/// engine is responsible for actually tearing the connection down and
/// reconnecting; this hook only notifies it.
pub trait CriticalFailureHook: Send + Sync {
    fn on_fatal(&self, err: &EngineError);
}

/// A hook that just logs. Useful for tests and as a fallback default.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCriticalFailureHook;

impl CriticalFailureHook for LoggingCriticalFailureHook {
    fn on_fatal(&self, err: &EngineError) {
        tracing::error!(error = %err, "fatal engine error");
    }
}
