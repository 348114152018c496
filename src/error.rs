//! Error types returned by the client.
//!
//! Every request-issuing method returns `Result<T, ClientError>`; callers
//! decide which outcomes are normal branches. `NotFound` in particular is an
//! expected result (see [`ClientError::is_expected`]).

use std::time::Duration;

use thiserror::Error;

use crate::models::Version;
use crate::protocol::CommandId;

/// Client-side error taxonomy.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The required connection layer is not up.
    #[error("Not connected")]
    NotConnected,

    /// No response within the configured budget.
    #[error("Timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The endpoint refused or does not exist.
    #[error("Connection refused: {0}")]
    ConnectionRefused(#[source] std::io::Error),

    /// Server major version differs from ours.
    #[error("Version mismatch: client {client}, server {server}")]
    VersionMismatch {
        /// Our version
        client: Version,
        /// Version reported by the server
        server: Version,
    },

    /// Lookup target does not exist. Expected, not fatal.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A data request with this id is already registered.
    #[error("Data request {0} already exists")]
    AlreadyExists(u32),

    /// The session ended while the request was outstanding.
    #[error("Request cancelled by disconnect")]
    Cancelled,

    /// The client was disposed.
    #[error("Client has been disposed")]
    Disposed,

    /// Frame could not be sent or received.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or unroutable frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Caller supplied a value the protocol cannot carry.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Server answered with a Nak.
    #[error("Server rejected {command}: {reason}")]
    ServerRejected {
        /// The command that was refused
        command: CommandId,
        /// Reason string from the Nak
        reason: String,
    },
}

impl ClientError {
    /// True for outcomes that are a normal branch rather than a failure.
    pub fn is_expected(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    /// True when the error means the session is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ClientError::NotConnected | ClientError::Cancelled | ClientError::Disposed
        )
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                ClientError::ConnectionRefused(err)
            }
            _ => ClientError::Transport(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_error_mapping() {
        let err: ClientError = io::Error::new(io::ErrorKind::NotFound, "no socket").into();
        assert!(matches!(err, ClientError::ConnectionRefused(_)));

        let err: ClientError = io::Error::new(io::ErrorKind::ConnectionRefused, "nope").into();
        assert!(matches!(err, ClientError::ConnectionRefused(_)));

        let err: ClientError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, ClientError::Transport(_)));

        // Socket timeouts carry no budget, so they stay transport errors.
        let err: ClientError = io::Error::new(io::ErrorKind::TimedOut, "read timed out").into();
        assert!(matches!(err, ClientError::Transport(_)));
        assert!(err.to_string().contains("read timed out"));
    }

    #[test]
    fn test_not_found_is_expected() {
        assert!(ClientError::NotFound("X".into()).is_expected());
        assert!(!ClientError::Timeout(Duration::from_millis(5)).is_expected());
        assert!(!ClientError::Cancelled.is_expected());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            ClientError::Timeout(Duration::from_millis(1500)).to_string(),
            "Timed out after 1500ms"
        );
        assert_eq!(
            ClientError::AlreadyExists(4).to_string(),
            "Data request 4 already exists"
        );
        let err = ClientError::ServerRejected {
            command: CommandId::Get,
            reason: "bad name".into(),
        };
        assert_eq!(err.to_string(), "Server rejected Get: bad name");
        let err = ClientError::VersionMismatch {
            client: Version::new(1, 0, 0, 0),
            server: Version::new(2, 1, 0, 0),
        };
        assert_eq!(
            err.to_string(),
            "Version mismatch: client 1.0.0.0, server 2.1.0.0"
        );
    }
}
