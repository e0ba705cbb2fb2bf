//! Pinned connections.

use futures_util::future::BoxFuture;
use mssql_bridge_pool::SlotPool;
use mssql_bridge_types::{Row, SqlValue};

use crate::bridge::Bridge;
use crate::error::{Error, Result};
use crate::session::{SessionCommand, SessionHandle};
use crate::statement::{Outcome, Reply, Statement};
use crate::transaction::{Holder, IsolationLevel, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Opened by `connect`; owns a private single-slot pool.
    Standalone,
    /// Borrowed from a shared pool.
    Pooled,
}

/// A connection pinned to one transport connection.
///
/// Statements run on the substrate, one at a time, in the order they were
/// issued. Call [`close`](Self::close) to give the connection back cleanly;
/// dropping it does the same in the background.
pub struct Connection {
    // Dropped first so the session sees its queue close before the bridge
    // goes away.
    session: Option<SessionHandle>,
    slots: SlotPool,
    origin: Origin,
    bridge: Bridge,
}

impl Connection {
    pub(crate) fn standalone(bridge: Bridge, session: SessionHandle, slots: SlotPool) -> Self {
        Self {
            session: Some(session),
            slots,
            origin: Origin::Standalone,
            bridge,
        }
    }

    pub(crate) fn pooled(bridge: Bridge, session: SessionHandle, slots: SlotPool) -> Self {
        Self {
            session: Some(session),
            slots,
            origin: Origin::Pooled,
            bridge,
        }
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
    ///
    /// `None` when the query returned no rows.
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

    /// Run a command once per parameter set, in order.
    ///
    /// Stops at the first failing set. Sets that already ran are not undone
    /// unless the call is made inside a transaction. Returns the total
    /// number of rows affected.
    pub async fn executemany<I>(&self, sql: &str, param_sets: I) -> Result<u64>
    where
        I: IntoIterator,
        I::Item: AsRef<[SqlValue]>,
    {
        self.run(Statement::execute_many(sql, param_sets))
            .await?
            .into_affected()
    }

    /// Begin a transaction.
    ///
    /// The connection is borrowed until the transaction ends. If the
    /// transaction is dropped without a commit it is rolled back.
    pub async fn transaction(&mut self) -> Result<Transaction<'_>> {
        Transaction::begin(Holder::Borrowed(self), None).await
    }

    /// Begin a transaction at the given isolation level.
    pub async fn transaction_with_isolation(
        &mut self,
        level: IsolationLevel,
    ) -> Result<Transaction<'_>> {
        Transaction::begin(Holder::Borrowed(self), Some(level)).await
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok` and rolls back when it returns `Err`.
    ///
    /// ```rust,ignore
    /// let id = conn
    ///     .run_in_transaction(|tx| {
    ///         Box::pin(async move {
    ///             tx.execute("INSERT INTO t (v) VALUES (@p1)", &[1.into()]).await?;
    ///             tx.fetchval("SELECT SCOPE_IDENTITY()", &[]).await
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn run_in_transaction<R, E, F>(&mut self, f: F) -> std::result::Result<R, E>
    where
        F: for<'t> FnOnce(&'t mut Transaction<'_>) -> BoxFuture<'t, std::result::Result<R, E>>,
        E: From<Error>,
    {
        let tx = self.transaction().await?;
        tx.scope(f).await
    }

    /// Close the connection.
    ///
    /// An open transaction is rolled back first. A pooled connection goes
    /// back to its pool; a standalone one is closed. Calling this more than
    /// once is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        let released = self.bridge.release(session).await;
        if self.origin == Origin::Standalone {
            self.slots.close().await;
        }
        released.and_then(Reply::into_done)
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.session.is_none()
    }

    /// Identifier of the pinned slot, until the connection is closed.
    #[must_use]
    pub fn slot_id(&self) -> Option<u64> {
        self.session.as_ref().map(SessionHandle::slot_id)
    }

    /// The bridge this connection runs on.
    #[must_use]
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub(crate) async fn run(&self, statement: Statement) -> Outcome {
        let session = self.session.as_ref().ok_or(Error::ConnectionClosed)?;
        self.bridge.dispatch(session, statement).await
    }

    /// Queue a rollback of the open transaction without waiting for it.
    pub(crate) fn abort_transaction(&self) {
        if let Some(session) = &self.session {
            let _ = session.send(SessionCommand::Abort);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("slot_id", &self.slot_id())
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Column `column` of `row`, or `None` without a row.
pub(crate) fn first_value(row: Option<Row>, column: usize) -> Result<Option<SqlValue>> {
    match row {
        Some(row) => Ok(Some(row.value(column)?.clone())),
        None => Ok(None),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mssql_bridge_types::{Column, ResultSet};

    #[test]
    fn test_first_value() {
        let rows = ResultSet::new(
            vec![Column::new("a", 0), Column::new("b", 1)],
            vec![vec![SqlValue::Int(1), SqlValue::from("x")]],
        )
        .into_rows();
        let row = rows.into_iter().next();
        assert_eq!(first_value(row.clone(), 1).unwrap(), Some(SqlValue::from("x")));
        assert!(matches!(first_value(row, 9), Err(Error::Type(_))));
        assert_eq!(first_value(None, 0).unwrap(), None);
    }
}
