//! Error types for the RemoteIO control plane

use std::time::Duration;
use thiserror::Error;

use crate::protocol::{ConnectionId, DeviceScope};

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connect(#[from] ConnectError),

    #[error("{0}")]
    NotFound(#[from] NotFoundError),

    #[error("{0}")]
    State(#[from] StateError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of an outbound connect or inbound admission
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("already connected to {0}")]
    AlreadyConnected(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("connect attempt {0} was cancelled")]
    Cancelled(ConnectionId),

    #[error("handshake rejected: {0}")]
    Rejected(String),
}

/// Lookup failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotFoundError {
    #[error("connection not found: {0}")]
    Connection(ConnectionId),

    #[error("device not found: {name} ({scope})")]
    Device { name: String, scope: DeviceScope },

    #[error("no output device available ({0})")]
    NoOutput(DeviceScope),
}

/// Lifecycle violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("connection {0} is not active")]
    ConnectionNotActive(ConnectionId),
}

/// Device inventory errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device enumeration failed: {0}")]
    Enumeration(String),

    #[error("audio backend error: {0}")]
    Backend(String),
}

/// Transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Link closed")]
    Closed,

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Encoding failed: {0}")]
    Encode(#[from] bincode::Error),
}

impl Error {
    /// True when the error came from validating a command rather than from I/O
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::State(_)
                | Error::Connect(ConnectError::InvalidAddress(_))
                | Error::Connect(ConnectError::AlreadyConnected(_))
        )
    }
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_displayable_verbatim() {
        let err = Error::from(StateError::ConnectionNotActive(ConnectionId(7)));
        assert_eq!(err.to_string(), "connection 7 is not active");

        let err = Error::from(NotFoundError::Device {
            name: "Mic1".into(),
            scope: DeviceScope::Remote(ConnectionId(2)),
        });
        assert_eq!(err.to_string(), "device not found: Mic1 (remote:2)");
    }

    #[test]
    fn test_rejection_classification() {
        assert!(Error::from(ConnectError::InvalidAddress("x".into())).is_rejection());
        assert!(!Error::from(ConnectError::Unreachable("x".into())).is_rejection());
        assert!(!Error::from(DeviceError::Enumeration("boom".into())).is_rejection());
    }
}
