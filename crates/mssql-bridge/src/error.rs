//! Error types for the caller-facing API.

use std::time::Duration;

use mssql_bridge_pool::{PoolError, SlotError};
use mssql_bridge_transport::TransportError;
use mssql_bridge_types::TypeError;
use thiserror::Error;

use crate::pending::RequestId;

/// Errors returned to callers of the bridge.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// A connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The wire exchange failed; the connection it ran on is discarded.
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

    /// Every pooled connection stayed busy for the whole acquire timeout.
    #[error("no connection became available within {0:?}")]
    PoolExhaustedTimeout(Duration),

    /// The pool has been closed.
    #[error("pool is closed")]
    PoolClosed,

    /// A transaction was used after it ended.
    #[error("transaction error: {0}")]
    TransactionState(String),

    /// A pending request was resolved twice.
    ///
    /// Raised by the pending table and logged by the resolution driver;
    /// callers never see it.
    #[error("request {0} was already resolved")]
    DoubleResolution(RequestId),

    /// The caller stopped waiting for a command.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// The connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The execution substrate could not be started.
    #[error("substrate error: {0}")]
    Substrate(String),

    /// The request was dropped without producing an outcome.
    #[error("request cancelled before completion")]
    Cancelled,

    /// A value could not be read out of a row.
    #[error("type error: {0}")]
    Type(#[from] TypeError),
}

impl Error {
    /// Check if this error is transient and may succeed on retry.
    ///
    /// Transient errors include timeouts, connection issues, and server
    /// errors known to clear up on their own (deadlocks, Azure throttling
    /// and failover).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect(_)
            | Self::Timeout(_)
            | Self::ConnectionClosed
            | Self::PoolExhaustedTimeout(_) => true,
            Self::Server { number, .. } => is_transient_server_error(*number),
            _ => false,
        }
    }

    /// Check if this error indicates a protocol failure.
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// Check if this is a server error with the given number.
    #[must_use]
    pub fn is_server_error(&self, number: i32) -> bool {
        matches!(self, Self::Server { number: n, .. } if *n == number)
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

fn is_transient_server_error(number: i32) -> bool {
    matches!(
        number,
        1205    // deadlock victim
        | 40197 // service error processing request
        | 40501 // service busy
        | 40613 // database unavailable
        | 49918 // not enough resources
        | 49919 // too many create/update operations
        | 49920 // too many operations in progress
    )
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Connect(message) => Self::Connect(message),
            TransportError::Protocol(message) => Self::Protocol(message),
            TransportError::Server {
                number,
                class,
                message,
            } => Self::Server {
                number,
                class,
                message,
            },
            TransportError::Closed => Self::ConnectionClosed,
        }
    }
}

impl From<PoolError> for Error {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::PoolExhaustedTimeout(waited) => Self::PoolExhaustedTimeout(waited),
            PoolError::PoolClosed => Self::PoolClosed,
            PoolError::Connect(TransportError::Connect(message)) => Self::Connect(message),
            PoolError::Connect(other) => Self::Connect(other.to_string()),
            PoolError::Configuration(message) => Self::Configuration(message),
            PoolError::Slot(SlotError::Broken(_)) => Self::ConnectionClosed,
            PoolError::Slot(e @ SlotError::AlreadyBusy(_)) => Self::Protocol(e.to_string()),
        }
    }
}

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Timeout(Duration::from_secs(1)).is_transient());
        assert!(Error::PoolExhaustedTimeout(Duration::from_secs(1)).is_transient());
        assert!(Error::ConnectionClosed.is_transient());
        assert!(!Error::PoolClosed.is_transient());
        assert!(!Error::TransactionState("done".into()).is_transient());

        let deadlock = Error::Server {
            number: 1205,
            class: 13,
            message: "deadlocked".into(),
        };
        assert!(deadlock.is_transient());
        assert!(deadlock.is_server_error(1205));
        assert_eq!(deadlock.class(), Some(13));

        let syntax = Error::Server {
            number: 102,
            class: 15,
            message: "Incorrect syntax".into(),
        };
        assert!(!syntax.is_transient());
    }

    #[test]
    fn test_from_transport() {
        let e: Error = TransportError::Protocol("reset".into()).into();
        assert!(e.is_protocol_error());
        let e: Error = TransportError::Closed.into();
        assert!(matches!(e, Error::ConnectionClosed));
        let e: Error = TransportError::Connect("refused".into()).into();
        assert_eq!(e.to_string(), "connection failed: refused");
    }

    #[test]
    fn test_from_pool() {
        let e: Error = PoolError::PoolClosed.into();
        assert!(matches!(e, Error::PoolClosed));
        let e: Error = PoolError::Connect(TransportError::Connect("refused".into())).into();
        assert!(matches!(e, Error::Connect(ref m) if m == "refused"));
        let e: Error = PoolError::Slot(SlotError::Broken(3)).into();
        assert!(matches!(e, Error::ConnectionClosed));
    }
}
