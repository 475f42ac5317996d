//! Error types.

use std::path::PathBuf;

use crate::status::{IllegalTransition, ServerState, TransitionHistory};

/// Internal invariant violations raised by lifecycle operations.
///
/// None of these are network failures: those are reported as state changes
/// and events. Seeing one of these means the caller (usually the dispatcher)
/// drove the connection through a path it must never take.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("{operation} requires state {expected}, but state is {actual}\n\n{history}")]
    UnexpectedState {
        operation: &'static str,
        expected: ServerState,
        actual: ServerState,
        history: TransitionHistory,
    },

    #[error("connection attempt while a transport is still active (state: {state})")]
    TransportStillActive { state: ServerState },

    #[error("{operation} requires an active transport (state: {state})")]
    NoTransport {
        operation: &'static str,
        state: ServerState,
    },
}

impl SessionError {
    /// Transition history attached to the error, if it carries one.
    pub fn history(&self) -> Option<&TransitionHistory> {
        match self {
            SessionError::IllegalTransition(err) => Some(&err.history),
            SessionError::UnexpectedState { history, .. } => Some(history),
            _ => None,
        }
    }
}

/// Errors loading configuration or addresses.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("can't read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bad config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid server address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("invalid ignore pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
