//! Error types for the widget synchronization engine.
//!
//! Every failure is local to one model or one manager operation. Misuse is
//! reported synchronously; everything else surfaces through the `Result` of
//! the deferred operation that hit it.

use std::sync::Arc;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = WidgetError> = std::result::Result<T, E>;

/// Errors produced by models, views, the manager and the buffer codec.
#[derive(Debug, Error)]
pub enum WidgetError {
    /// The caller passed arguments that can never succeed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A model or view class could not be located.
    #[error("Class {name:?} from module {module:?}@{version} could not be resolved")]
    ClassResolution {
        name: String,
        module: String,
        version: String,
        #[source]
        source: Option<Box<WidgetError>>,
    },

    /// Creating a model failed; the registry entry has been rolled back.
    #[error("Could not create model {model_id}")]
    ModelCreation {
        model_id: String,
        #[source]
        source: Box<WidgetError>,
    },

    /// Creating or rendering a view failed.
    #[error("Could not create a view for model {model_id}")]
    ViewCreation {
        model_id: String,
        #[source]
        source: Box<WidgetError>,
    },

    /// Displaying a view through the host failed.
    #[error("Could not display model {model_id}")]
    Display {
        model_id: String,
        #[source]
        source: Box<WidgetError>,
    },

    /// A view class failed to instantiate or render.
    #[error("View error: {context}")]
    View {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    /// A background task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The host or the comm reported a failure.
    #[error("Transport error: {context}")]
    Transport {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    /// An attribute could not be serialized for the wire.
    #[error("Failed to serialize attribute {attribute:?}: {message}")]
    Serialization { attribute: String, message: String },

    /// An attribute received from the wire could not be deserialized.
    #[error("Failed to deserialize attribute {attribute:?}: {message}")]
    Deserialization { attribute: String, message: String },

    /// A buffer path does not locate a slot in the decoded structure.
    #[error("Invalid buffer path {path}: {reason}")]
    InvalidBufferPath { path: String, reason: String },

    /// A message did not follow the wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON (de)serialization of a wire payload failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An operation did not complete within its window.
    #[error("Timed out after {0}ms")]
    Timeout(u64),

    /// The model or comm has been closed.
    #[error("Model {0} is closed")]
    Closed(String),

    /// A referenced model is not registered.
    #[error("Model not found: {0}")]
    NotFound(String),

    /// The remote peer requires a version we do not satisfy.
    #[error("Version mismatch: {0}")]
    VersionMismatch(String),

    /// An error observed through a shared deferred value.
    #[error(transparent)]
    Shared(#[from] Arc<WidgetError>),
}

impl WidgetError {
    /// Wrap a host-side failure with a short description of what was attempted.
    pub fn transport(context: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }

    /// Walk through `Shared` wrappers to the error that actually occurred.
    pub fn root(&self) -> &WidgetError {
        match self {
            Self::Shared(inner) => inner.root(),
            other => other,
        }
    }
}
