//! Pool error types.

use std::time::Duration;

use mssql_bridge_transport::TransportError;
use thiserror::Error;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every connection stayed busy for the whole acquire timeout.
    #[error("connection acquisition timeout after {0:?}")]
    PoolExhaustedTimeout(Duration),

    /// Pool is closed.
    #[error("pool is closed")]
    PoolClosed,

    /// Opening a connection failed.
    #[error("failed to create connection: {0}")]
    Connect(#[source] TransportError),

    /// Pool configuration error.
    #[error("pool configuration error: {0}")]
    Configuration(String),

    /// Slot state machine violation.
    #[error(transparent)]
    Slot(#[from] SlotError),
}

/// Errors raised by the slot state machine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    /// The slot was already checked out.
    #[error("slot {0} is already busy")]
    AlreadyBusy(u64),

    /// The slot's connection failed and it may not be reused.
    #[error("slot {0} is broken")]
    Broken(u64),
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
