//! Error taxonomy shared by every Unison crate.
//!
//! Transport failures are grouped under [`TransportError`] so callers can tell
//! a timeout from a refused connection without ever seeing the underlying
//! protocol library's error type.

use thiserror::Error;

/// Result type used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Failures raised at the transport client boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Cannot establish or maintain a connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed or unexpected protocol frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Address cannot be parsed or resolved
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Read failed for a reason not better classified above
    #[error("Read error: {0}")]
    Read(String),

    /// Write failed for a reason not better classified above
    #[error("Write error: {0}")]
    Write(String),

    /// Operation is not supported by this transport or address family
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// True for failures caused by the link itself rather than the request.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// True when the operation ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Invalid argument or configuration value
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Value cannot be cast to the requested type
    #[error("Type error: cannot use {value} as {target}")]
    Type { value: String, target: String },

    /// Missing entity, pointer target or TLV field
    #[error("Not found: {0}")]
    NotFound(String),

    /// Entity with the same key already registered
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Write was accepted but the read-back did not match
    #[error("Confirmation failed for '{attribute}': expected {expected}, got {actual}")]
    Confirmation {
        attribute: String,
        expected: String,
        actual: String,
    },

    /// Caller is not allowed to perform the operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Task bookkeeping failure
    #[error("Task error: {0}")]
    Task(String),

    /// Configuration could not be parsed or normalized
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence collaborator failure
    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Build a [`Error::Type`] from any displayable value.
    pub fn type_error(value: impl std::fmt::Display, target: impl Into<String>) -> Self {
        Self::Type {
            value: value.to_string(),
            target: target.into(),
        }
    }

    /// Build an [`Error::InvalidInput`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Build an [`Error::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// The transport error wrapped by this error, if any.
    pub fn as_transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_is_transparent() {
        let err: Error = TransportError::Timeout("read took 5s".into()).into();
        assert_eq!(err.to_string(), "Timeout: read took 5s");
        assert!(err.as_transport().is_some_and(TransportError::is_timeout));
    }

    #[test]
    fn test_type_error_names_value_and_target() {
        let err = Error::type_error("true", "int");
        assert_eq!(err.to_string(), "Type error: cannot use true as int");
    }
}
