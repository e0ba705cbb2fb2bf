//! # mssql-bridge-pool
//!
//! Connection slot pool for SQL Server.
//!
//! Each pooled connection lives in a [`Slot`] whose Idle/Busy/Broken state
//! is an atomic compare-and-set cell. The [`SlotPool`] hands slots out,
//! queues callers in FIFO order once `max_connections` are open, and gives
//! a returning slot straight to the longest waiter without passing through
//! Idle. Slots whose connection failed at the transport level are closed
//! and replaced in the background.
//!
//! ## Features
//!
//! - Configurable min/max pool sizes with eager warm-up
//! - FIFO waiter hand-off with an optional acquire timeout
//! - Liveness probe on checkout
//! - Idle timeout, maximum lifetime and background replenishment
//! - Graceful close with a bounded grace period
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_bridge_pool::{PoolConfig, SlotPool};
//!
//! let pool = SlotPool::builder()
//!     .connector(connector)
//!     .endpoint(Endpoint::new("localhost"))
//!     .credentials(Credentials::sql_server("sa", "password"))
//!     .config(PoolConfig::new().min_connections(2).max_connections(8))
//!     .build()
//!     .await?;
//!
//! let mut slot = pool.acquire().await?;
//! let rows = slot.execute("SELECT 1", &[]).await?;
//! // Slot automatically returned to the pool on drop
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod pool;
pub mod slot;

pub use config::PoolConfig;
pub use error::{PoolError, Result, SlotError};
pub use pool::{PoolBuilder, PoolStatus, PooledSlot, SlotPool};
pub use slot::{Slot, SlotMetadata, SlotOutcome, SlotShared, SlotState};
