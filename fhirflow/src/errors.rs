//! Error types for the fhirflow crate.
//!
//! Foreseeable stage failures are not errors at this level: they travel as
//! [`ClassifiedError`](crate::core::ClassifiedError) values inside a
//! [`StageResult`](crate::core::StageResult) and end in a retry or the
//! exception path. [`FhirflowError`] covers the internal faults that must fail
//! a batch run loudly.

use crate::core::{ItemPhase, StageName};
use thiserror::Error;

/// The main error type for fhirflow operations.
#[derive(Debug, Error)]
pub enum FhirflowError {
    /// No handler is registered for a stage of the chain.
    #[error("No handler registered for stage '{0}'")]
    MissingStageHandler(StageName),

    /// An item attempted a transition the state machine does not allow.
    #[error("Invalid transition for item '{item_id}': {from} -> {to}")]
    InvalidTransition {
        /// The item id.
        item_id: String,
        /// Current phase.
        from: ItemPhase,
        /// Requested phase.
        to: ItemPhase,
    },

    /// The stage chain definition is unusable.
    #[error("Invalid stage chain: {0}")]
    InvalidChain(String),

    /// A stage handler reported an internal fault.
    #[error("Stage '{stage}' failed internally: {message}")]
    StageExecution {
        /// The stage.
        stage: StageName,
        /// The fault description.
        message: String,
    },

    /// A durable store operation failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Publishing a notification failed.
    #[error("Notification failed: {0}")]
    Notification(String),

    /// The finalize collaborator failed.
    #[error("Finalize failed for batch '{batch_id}': {message}")]
    Finalize {
        /// The batch id.
        batch_id: String,
        /// The failure description.
        message: String,
    },

    /// Configuration could not be loaded.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// An item task panicked or was cancelled.
    #[error("Item task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FhirflowError {
    /// Creates a stage execution error.
    #[must_use]
    pub fn stage(stage: StageName, message: impl Into<String>) -> Self {
        Self::StageExecution {
            stage,
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Errors raised by durable store implementations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The referenced document does not exist.
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    /// The backing store is unavailable or rejected the operation.
    #[error("Store '{store}' unavailable: {message}")]
    Unavailable {
        /// The store name.
        store: String,
        /// The failure description.
        message: String,
    },
}

impl StoreError {
    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            store: store.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config '{path}': {source}")]
    Read {
        /// The path.
        path: String,
        /// The IO error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parse error.
    #[error("Invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON parse error.
    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    /// The file extension does not select a format.
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// A value is out of range or unknown.
    #[error("Invalid config value for '{key}': {message}")]
    InvalidValue {
        /// The key.
        key: String,
        /// The problem.
        message: String,
    },
}

impl ConfigError {
    /// Creates an invalid value error.
    #[must_use]
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}
