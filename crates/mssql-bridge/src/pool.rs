//! The caller-facing connection pool.

use std::ops::{Deref, DerefMut};

use futures_util::future::BoxFuture;
use mssql_bridge_pool::{PoolStatus, SlotMetadata, SlotPool};
use mssql_bridge_types::{Row, SqlValue};

use crate::bridge::Bridge;
use crate::connection::{Connection, first_value};
use crate::error::{Error, Result};
use crate::statement::{Outcome, Statement};
use crate::transaction::{Holder, IsolationLevel, Transaction};

/// A pool of SQL Server connections driven by a [`Bridge`].
///
/// Statements issued directly on the pool run on whichever connection is
/// free; there is no ordering between them. Use [`acquire`](Self::acquire)
/// or [`transaction`](Self::transaction) when statements must share a
/// connection.
///
/// Cloning is cheap; clones share the same connections.
#[derive(Clone)]
pub struct Pool {
    bridge: Bridge,
    slots: SlotPool,
}

impl Pool {
    pub(crate) fn new(bridge: Bridge, slots: SlotPool) -> Self {
        Self { bridge, slots }
    }

    /// Borrow a connection for several statements.
    ///
    /// The connection goes back to the pool on
    /// [`release`](PoolConnection::release), on close, or when dropped.
    pub async fn acquire(&self) -> Result<PoolConnection> {
        let session = self.bridge.open_session(&self.slots).await?;
        Ok(PoolConnection {
            conn: Connection::pooled(self.bridge.clone(), session, self.slots.clone()),
        })
    }

    /// Run a query and return all rows.
    pub async fn fetch(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.run(Statement::query(sql, params)).await?.into_rows()
    }

    /// Run a query and return the first row, if any.
    pub async fn fetchrow(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        Ok(self.fetch(sql, params).await?.into_iter().next())
    }

    /// Run a query and return the first column of the first row.
    pub async fn fetchval(&self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlValue>> {
        self.fetchval_column(sql, params, 0).await
    }

    /// Run a query and return column `column` of the first row.
    pub async fn fetchval_column(
        &self,
        sql: &str,
        params: &[SqlValue],
        column: usize,
    ) -> Result<Option<SqlValue>> {
        first_value(self.fetchrow(sql, params).await?, column)
    }

    /// Run a command and return the number of rows affected.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        self.run(Statement::execute(sql, params)).await?.into_affected()
    }

    /// Run a command once per parameter set on a single connection.
    ///
    /// Stops at the first failing set; earlier sets are not undone.
    pub async fn executemany<I>(&self, sql: &str, param_sets: I) -> Result<u64>
    where
        I: IntoIterator,
        I::Item: AsRef<[SqlValue]>,
    {
        self.run(Statement::execute_many(sql, param_sets))
            .await?
            .into_affected()
    }

    /// Begin a transaction on a dedicated connection.
    ///
    /// The connection returns to the pool when the transaction ends.
    pub async fn transaction(&self) -> Result<Transaction<'static>> {
        self.begin(None).await
    }

    /// Begin a transaction at the given isolation level.
    pub async fn transaction_with_isolation(
        &self,
        level: IsolationLevel,
    ) -> Result<Transaction<'static>> {
        self.begin(Some(level)).await
    }

    /// Run `f` inside a transaction on a dedicated connection.
    ///
    /// Commits when `f` returns `Ok` and rolls back when it returns `Err`.
    pub async fn run_in_transaction<R, E, F>(&self, f: F) -> std::result::Result<R, E>
    where
        F: for<'t> FnOnce(&'t mut Transaction<'_>) -> BoxFuture<'t, std::result::Result<R, E>>,
        E: From<Error>,
    {
        let tx = self.transaction().await?;
        tx.scope(f).await
    }

    /// Number of open connections, idle and in use.
    #[must_use]
    pub fn get_size(&self) -> usize {
        self.slots.status().total
    }

    /// Number of idle connections.
    #[must_use]
    pub fn get_idle_size(&self) -> usize {
        self.slots.status().idle
    }

    /// Configured minimum number of connections.
    #[must_use]
    pub fn get_min_size(&self) -> usize {
        self.slots.config().min_connections as usize
    }

    /// Configured maximum number of connections.
    #[must_use]
    pub fn get_max_size(&self) -> usize {
        self.slots.config().max_connections as usize
    }

    /// Detailed pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.slots.status()
    }

    /// Metadata for every open connection.
    #[must_use]
    pub fn connections(&self) -> Vec<SlotMetadata> {
        self.slots.slots()
    }

    /// Whether the pool has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    /// Close the pool.
    ///
    /// Queued acquires fail with [`Error::PoolClosed`], idle connections are
    /// closed at once and connections in use are closed when they come
    /// back. Calling this more than once is a no-op.
    pub async fn close(&self) {
        self.slots.close().await;
    }

    /// The bridge this pool runs on.
    #[must_use]
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    async fn run(&self, statement: Statement) -> Outcome {
        self.bridge.run_unpinned(&self.slots, statement).await
    }

    async fn begin(&self, isolation: Option<IsolationLevel>) -> Result<Transaction<'static>> {
        let conn = self.acquire().await?.into_inner();
        Transaction::begin(Holder::Owned(conn), isolation).await
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

/// A connection borrowed from a [`Pool`].
///
/// Derefs to [`Connection`]. Goes back to the pool on
/// [`release`](Self::release), [`Connection::close`], or drop.
#[derive(Debug)]
pub struct PoolConnection {
    conn: Connection,
}

impl PoolConnection {
    /// Return the connection to the pool.
    ///
    /// An open transaction is rolled back first.
    pub async fn release(mut self) -> Result<()> {
        self.conn.close().await
    }

    /// Take the underlying connection.
    #[must_use]
    pub fn into_inner(self) -> Connection {
        self.conn
    }
}

impl Deref for PoolConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for PoolConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}
