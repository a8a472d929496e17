//! Common error types for Strata components.

use thiserror::Error;

/// Common errors across Strata components
#[derive(Debug, Error)]
pub enum StrataError {
    /// Stream creation, discovery, push or pull failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Payload could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// A request/response-shaped operation did not complete in time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A peer broke the coordination protocol
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Coordinator and participant disagree on the active protocol
    #[error("Protocol mismatch: expected '{expected}', coordinator announced '{received}'")]
    ProtocolMismatch { expected: String, received: String },

    /// The coordinator refused our join request
    #[error("Join rejected by coordinator {0}")]
    JoinRejected(String),

    /// Operation is not valid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Pause/resume requested on a layer that is not pausable
    #[error("Layer '{0}' is not pausable")]
    NotPausable(String),

    /// Send requested on a layer that owns no outlet
    #[error("Layer '{0}' has no outlet")]
    NoOutlet(String),

    /// Layer id not part of the active protocol
    #[error("Unknown layer: {0}")]
    UnknownLayer(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// High-frequency worker failed or went away
    #[error("Worker error: {0}")]
    Worker(String),
}

impl StrataError {
    /// Returns true if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }

    /// Returns true for protocol-level failures that abort the initiating operation
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation(_) | Self::ProtocolMismatch { .. } | Self::JoinRejected(_)
        )
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

/// Result alias used across Strata crates
pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StrataError::Transport("push failed".into()).is_retryable());
        assert!(StrataError::Timeout("join".into()).is_retryable());
        assert!(!StrataError::NotPausable("game".into()).is_retryable());
    }

    #[test]
    fn test_protocol_errors() {
        let err = StrataError::ProtocolMismatch {
            expected: "a".into(),
            received: "b".into(),
        };
        assert!(err.is_protocol_error());
        assert!(err.to_string().contains("'b'"));
        assert!(!StrataError::Config("x".into()).is_protocol_error());
    }
}
