//! Connector and connection traits.
//!
//! Both traits are object safe via `#[async_trait]` so that the pool can
//! hold connectors and connections of any transport behind a box.

use async_trait::async_trait;
use mssql_bridge_types::{ResultSet, SqlValue};

use crate::error::Result;
use crate::target::{Credentials, Endpoint};

/// An open transport connection.
pub type ConnectionHandle = Box<dyn TransportConnection>;

/// Opens transport connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new connection.
    ///
    /// Failures should be reported as [`TransportError::Connect`](crate::TransportError::Connect).
    async fn open(&self, endpoint: &Endpoint, credentials: &Credentials)
    -> Result<ConnectionHandle>;
}

/// A single established connection.
///
/// Callers guarantee exclusive access: at most one call is in flight per
/// connection at any time.
#[async_trait]
pub trait TransportConnection: Send + 'static {
    /// Execute a statement with positional parameters.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<ResultSet>;

    /// Begin a transaction.
    async fn begin(&mut self) -> Result<()>;

    /// Commit the current transaction.
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the current transaction.
    async fn rollback(&mut self) -> Result<()>;

    /// Close the connection. Must be safe to call more than once.
    async fn close(&mut self);

    /// Cheap liveness probe that does not touch the wire.
    fn is_valid(&self) -> bool;
}
