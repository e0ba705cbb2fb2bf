//! Transport error types.

use thiserror::Error;

/// Errors produced by a transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The wire exchange failed or the connection was reset.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server rejected the statement.
    #[error("server error {number}: {message}")]
    Server {
        /// Error number.
        number: i32,
        /// Error class/severity (0-25).
        class: u8,
        /// Error message.
        message: String,
    },

    /// The connection was already closed.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Whether the connection that produced this error must not be reused.
    ///
    /// SQL Server classes 20-25 terminate the connection; lower classes
    /// leave the session usable.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            Self::Protocol(_) | Self::Closed | Self::Connect(_) => true,
            Self::Server { class, .. } => *class >= 20,
        }
    }

    /// Get the error class/severity if this is a server error.
    #[must_use]
    pub fn class(&self) -> Option<u8> {
        match self {
            Self::Server { class, .. } => Some(*class),
            _ => None,
        }
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn server(class: u8) -> TransportError {
        TransportError::Server {
            number: 208,
            class,
            message: "Invalid object name 'nope'.".into(),
        }
    }

    #[test]
    fn test_user_errors_keep_connection() {
        assert!(!server(16).is_connection_fatal());
        assert_eq!(server(16).class(), Some(16));
    }

    #[test]
    fn test_fatal_errors_break_connection() {
        assert!(server(20).is_connection_fatal());
        assert!(TransportError::Protocol("reset".into()).is_connection_fatal());
        assert!(TransportError::Closed.is_connection_fatal());
        assert_eq!(TransportError::Closed.class(), None);
    }
}
