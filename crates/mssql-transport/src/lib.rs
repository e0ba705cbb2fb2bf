//! # mssql-bridge-transport
//!
//! The seam between the bridge and whatever actually speaks TDS.
//!
//! A [`Connector`] opens connections to an [`Endpoint`] with a set of
//! [`Credentials`]; each connection is a boxed [`TransportConnection`]
//! that executes one statement at a time. The bridge never runs two
//! statements on the same connection concurrently, so implementations can
//! assume exclusive `&mut self` access for the lifetime of each call.
//!
//! Connection failures and wire failures are reported through
//! [`TransportError`], which also tells the pool whether the connection is
//! still fit for reuse ([`TransportError::is_connection_fatal`]).

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connection;
pub mod error;
pub mod target;

pub use connection::{ConnectionHandle, Connector, TransportConnection};
pub use error::{Result, TransportError};
pub use target::{Credentials, Endpoint};
