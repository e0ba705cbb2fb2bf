//! # mssql-bridge
//!
//! Non-blocking SQL Server access for callers on a single-threaded,
//! cooperative tokio runtime.
//!
//! Connection I/O never runs on the caller's runtime. A [`Bridge`] owns a
//! small multi-thread runtime (the execution substrate) on which
//! connections are opened, statements executed and connections closed.
//! Each request the caller makes is registered in a pending table, run on
//! the substrate, and resolved exactly once by a driver task back on the
//! caller's runtime.
//!
//! ## Features
//!
//! - **Pooling**: min/max sizing, FIFO waiters with direct hand-off,
//!   broken-connection replacement and graceful close
//! - **Pinned connections**: statements on a [`Connection`] run in issue
//!   order on one transport connection
//! - **Transactions**: exactly one verdict per transaction, automatic
//!   rollback on error and on drop, isolation levels
//! - **Cancellation-safe**: dropping a future never corrupts a connection;
//!   the work finishes on the substrate and the connection is released
//! - **Tracing**: every request runs in a span with its id and sanitized SQL
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_bridge::{ConnectOptions, PoolConfig, SqlValue, create_pool};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), mssql_bridge::Error> {
//!     let options = ConnectOptions::new(connector, endpoint, credentials);
//!     let pool = create_pool(options, PoolConfig::new().max_connections(8)).await?;
//!
//!     let rows = pool
//!         .fetch("SELECT id, name FROM users WHERE active = @p1", &[SqlValue::Bool(true)])
//!         .await?;
//!     for row in &rows {
//!         let name: String = row.get("name")?;
//!         println!("User: {name}");
//!     }
//!
//!     let mut tx = pool.transaction().await?;
//!     tx.execute("UPDATE users SET active = 0 WHERE id = @p1", &[SqlValue::Int(7)])
//!         .await?;
//!     tx.commit().await?;
//!
//!     pool.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod instrumentation;
pub mod pending;
pub mod pool;
pub mod transaction;

mod session;
mod statement;
mod substrate;

pub use bridge::{Bridge, Completion};
pub use config::{BridgeConfig, ConnectOptions};
pub use connection::Connection;
pub use error::{Error, Result};
pub use pending::{RequestId, RequestKind};
pub use pool::{Pool, PoolConnection};
pub use session::SessionHandle;
pub use statement::{Outcome, Reply};
pub use transaction::{IsolationLevel, Transaction, TransactionState};

pub use mssql_bridge_pool::{PoolConfig, PoolStatus};
pub use mssql_bridge_transport::{Connector, Credentials, Endpoint, TransportConnection};
pub use mssql_bridge_types::{Column, FromSql, ResultSet, Row, SqlValue};

/// Open a single connection on a private bridge.
///
/// The bridge's substrate lives as long as the connection.
pub async fn connect(options: ConnectOptions) -> Result<Connection> {
    Bridge::new(BridgeConfig::default())?.connect(options).await
}

/// Create a connection pool on a private bridge.
///
/// `config.min_connections` connections are opened before this returns.
pub async fn create_pool(options: ConnectOptions, config: PoolConfig) -> Result<Pool> {
    Bridge::new(BridgeConfig::default())?
        .create_pool(options, config)
        .await
}
