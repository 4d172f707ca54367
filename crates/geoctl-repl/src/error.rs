//! Error types for the replication subsystem.

use thiserror::Error;

/// Errors that can occur while locating a primary or attaching a secondary.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Local configuration does not allow the operation. Not retryable.
    #[error("configuration error: {msg}")]
    Configuration {
        /// Error message describing the issue.
        msg: String,
    },

    /// The registry answered but returned no primary candidates.
    #[error("no primary found for {query}")]
    NotFound {
        /// The fully qualified record name that was queried.
        query: String,
    },

    /// DNS transport or query failure, passed through from the resolver.
    #[error(transparent)]
    Dns(#[from] hickory_resolver::error::ResolveError),

    /// The base backup or follow step failed.
    #[error("replication of slot {slot} failed: {msg}")]
    Replication {
        /// The slot being attached.
        slot: String,
        /// Error message describing the failure.
        msg: String,
    },

    /// A slot with the same name is already active on this node.
    #[error("replication slot {slot} is already attached to {host}")]
    AlreadyAttached {
        /// The slot name.
        slot: String,
        /// The host the existing slot follows.
        host: String,
    },

    /// The attach was cancelled by the operator.
    #[error("replication of slot {slot} cancelled")]
    Cancelled {
        /// The slot being attached.
        slot: String,
    },

    /// Slot registry could not be encoded or decoded.
    #[error("slot registry serialization error")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl ReplError {
    /// Shorthand for a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        ReplError::Configuration { msg: msg.into() }
    }

    /// Returns true when the error may go away after operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReplError::NotFound { .. } | ReplError::Dns(_))
    }
}
