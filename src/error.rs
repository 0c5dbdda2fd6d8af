//! Error types for the bridge
//!
//! Construction-time failures are returned synchronously from `create`/`start`.
//! Runtime failures reported by the engine reach the application through the
//! consumer's terminal notification instead.

use std::fmt;

use crate::engine::EngineError;
use crate::pipeline::state::PipelineState;
use crate::pipeline::types::PipelineId;

/// Result alias used across the crate
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Why the engine ended a pipeline on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    /// The graph drained all of its sources
    EndOfStream,
    /// A stage reported an unrecoverable error
    Fatal {
        message: String,
        debug: Option<String>,
    },
}

impl fmt::Display for TerminalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalEvent::EndOfStream => write!(f, "end of stream"),
            TerminalEvent::Fatal { message, .. } => write!(f, "fatal error: {}", message),
        }
    }
}

/// Errors surfaced by the bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The pipeline description could not be turned into a graph
    #[error("invalid pipeline description: {0}")]
    Configuration(String),

    /// A mandatory named stage is missing at start
    #[error("mandatory stage `{stage}` is missing from the pipeline")]
    Wiring { stage: String },

    /// The engine ended the pipeline (end-of-stream or fatal error)
    #[error("engine terminated the pipeline: {0}")]
    TerminalEngine(TerminalEvent),

    /// A non-mandatory stage is absent; callers log it and carry on
    #[error("optional stage `{0}` is not present")]
    MissingOptionalStage(String),

    /// The requested lifecycle transition is not allowed from the current state
    #[error("cannot move pipeline from {from} to {to}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },

    /// The pipeline has been stopped and its graph released
    #[error("pipeline {0} has been stopped")]
    Closed(PipelineId),

    /// A call into the engine failed
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// A configuration file could not be read or parsed
    #[error("invalid bridge settings: {0}")]
    Settings(String),
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Settings(err.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Settings(err.to_string())
    }
}
