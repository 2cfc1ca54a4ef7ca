//! Errors surfaced by the agent's fallible entry points.
use crate::trace::{TraceParentError, TraceStateError};
use std::sync::PoisonError;
use std::time::Duration;

/// Result type used by the agent's fallible operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors reported by configuration parsing, trace context handling and the
/// event pipeline.
///
/// Instrumentation entry points never return these to the application; they
/// log through the internal logger and fall back to a safe default. The error
/// type is exposed for the places where the caller owns the decision, such as
/// flushing or shutting down an [`EventQueue`](crate::export::EventQueue).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum AgentError {
    /// A configuration value could not be parsed or is out of range.
    #[error("invalid value {value:?} for {key}")]
    InvalidConfig {
        /// Name of the setting or environment variable.
        key: String,
        /// The rejected raw value.
        value: String,
    },

    /// A trace parent header could not be parsed.
    #[error(transparent)]
    TraceParent(#[from] TraceParentError),

    /// A tracestate entry was rejected.
    #[error(transparent)]
    TraceState(#[from] TraceStateError),

    /// The event queue was already shut down.
    #[error("event queue already shut down")]
    AlreadyShutdown,

    /// Waiting for the background queue thread timed out.
    #[error("timed out after {0:?}")]
    ExportTimedOut(Duration),

    /// An exporter failed to deliver a batch.
    #[error("export failed: {0}")]
    ExportFailed(String),

    /// An event could not be serialized.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// Other failures not covered by the variants above.
    #[error("{0}")]
    Other(String),
}

impl<T> From<PoisonError<T>> for AgentError {
    fn from(err: PoisonError<T>) -> Self {
        AgentError::Other(err.to_string())
    }
}

impl AgentError {
    pub(crate) fn invalid_config(key: impl Into<String>, value: impl Into<String>) -> Self {
        AgentError::InvalidConfig {
            key: key.into(),
            value: value.into(),
        }
    }
}
