//! Error types for the interception engine

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while configuring or hosting the engine (never by the
/// per-request pipeline, which reports through [`InterceptError`]).
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid configuration values
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Rule or environment documents could not be loaded or saved
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Admin API socket errors
    #[error("Network error: {0}")]
    Network(String),

    /// Subscriber setup failures
    #[error("Logging error: {0}")]
    Logging(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for configuration, persistence and hosting operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Classification of a failed network call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorKind {
    Connection,
    Timeout,
    Dns,
    Tls,
    Other,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NetworkErrorKind::Connection => "Connection",
            NetworkErrorKind::Timeout => "Timeout",
            NetworkErrorKind::Dns => "DNS",
            NetworkErrorKind::Tls => "TLS",
            NetworkErrorKind::Other => "Network",
        };
        f.write_str(label)
    }
}

/// Outcome surfaced to the host application when an intercepted request
/// does not produce a response.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterceptError {
    /// An operator cancelled the request at a breakpoint
    #[error("Request cancelled by operator")]
    Cancelled,

    /// Transport failure, real or simulated by a mock rule
    #[error("{kind} error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    /// Trust evaluation or certificate pinning rejected the connection
    #[error("TLS trust rejected for {host}: {reason}")]
    TrustRejected { host: String, reason: String },

    /// The request could not be processed at all (e.g. an unparseable URL)
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl InterceptError {
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        InterceptError::Network {
            kind,
            message: message.into(),
        }
    }

    /// Classified kind as the control surface displays it
    pub fn kind(&self) -> NetworkErrorKind {
        match self {
            InterceptError::Network { kind, .. } => *kind,
            InterceptError::TrustRejected { .. } => NetworkErrorKind::Tls,
            InterceptError::Cancelled | InterceptError::InvalidRequest { .. } => {
                NetworkErrorKind::Other
            }
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, InterceptError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trust_rejection_is_classified_as_tls() {
        let err = InterceptError::TrustRejected {
            host: "a.test".to_string(),
            reason: "pin mismatch".to_string(),
        };
        assert_eq!(err.kind(), NetworkErrorKind::Tls);
        assert!(!err.is_cancellation());
    }

    #[test]
    fn test_error_display() {
        let err = InterceptError::network(NetworkErrorKind::Timeout, "no reply in 30s");
        assert_eq!(err.to_string(), "Timeout error: no reply in 30s");
        assert_eq!(
            InterceptError::Cancelled.to_string(),
            "Request cancelled by operator"
        );
    }
}
