//! # mssql-testing
//!
//! Test infrastructure for the SQL Server bridge.
//!
//! This crate provides an in-memory transport that stands in for a real
//! SQL Server connection. Responses are scripted per SQL text, and every
//! connection records what happened to it so tests can assert on ordering,
//! concurrency and lifecycle.
//!
//! ## Features
//!
//! - Scripted responses: rows, scalars, affected counts, server errors
//! - Fault injection: connect failures, protocol errors, killed connections
//! - [`Gate`]s that hold a statement in flight until the test opens them
//! - Event log of opens, statements, transaction control and closes
//! - In-flight gauge recording the highest observed concurrency
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_testing::{MockConnector, MockResponse};
//!
//! let mock = MockConnector::builder()
//!     .with_response("SELECT 1", MockResponse::scalar_int(1))
//!     .with_response("SELECT boom", MockResponse::protocol_error("reset"))
//!     .build();
//!
//! let pool = SlotPool::builder()
//!     .connector(mock.connector())
//!     // ...
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod gate;
pub mod mock;

pub use gate::Gate;
pub use mock::{
    MockConnection, MockConnector, MockConnectorBuilder, MockEvent, MockEventKind, MockResponse,
};

use mssql_bridge_transport::{Credentials, Endpoint};

/// Endpoint used by tests that never touch the network.
#[must_use]
pub fn test_endpoint() -> Endpoint {
    Endpoint::new("mock.local").database("bridge_test")
}

/// Credentials used by tests that never touch the network.
#[must_use]
pub fn test_credentials() -> Credentials {
    Credentials::sql_server("sa", "MockPassw0rd")
}
