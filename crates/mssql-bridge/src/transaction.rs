//! Transaction support.
//!
//! A [`Transaction`] runs every statement on the connection it was begun
//! on and ends in exactly one verdict: committed or rolled back. A failed
//! statement rolls the transaction back before its error is returned, and
//! dropping a transaction that is still open queues a rollback on the
//! connection ahead of anything issued afterwards.

use std::fmt;

use futures_util::future::BoxFuture;
use mssql_bridge_types::{Row, SqlValue};

use crate::connection::{Connection, first_value};
use crate::error::{Error, Result};
use crate::statement::{Outcome, Reply, Statement};

/// Transaction isolation level.
///
/// SQL Server supports these isolation levels for transaction management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read uncommitted (dirty reads allowed).
    ///
    /// Lowest isolation - transactions can read uncommitted changes from
    /// other transactions. Offers best performance but no consistency guarantees.
    ReadUncommitted,

    /// Read committed (default for SQL Server).
    ///
    /// Transactions can only read committed data. Prevents dirty reads
    /// but allows non-repeatable reads and phantom reads.
    #[default]
    ReadCommitted,

    /// Repeatable read.
    ///
    /// Ensures rows read by a transaction don't change during the transaction.
    /// Prevents dirty reads and non-repeatable reads, but allows phantom reads.
    RepeatableRead,

    /// Serializable (highest isolation).
    ///
    /// Strictest isolation - transactions are completely isolated from
    /// each other. Prevents all read phenomena but has highest lock contention.
    Serializable,

    /// Snapshot isolation.
    ///
    /// Uses row versioning to provide a point-in-time view of data.
    /// Requires snapshot isolation to be enabled on the database.
    Snapshot,
}

impl IsolationLevel {
    /// Get the SQL statement to set this isolation level.
    #[must_use]
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED",
            Self::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            Self::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            Self::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
            Self::Snapshot => "SET TRANSACTION ISOLATION LEVEL SNAPSHOT",
        }
    }

    /// Get the isolation level name as used in SQL Server.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
            Self::Snapshot => "SNAPSHOT",
        }
    }
}

/// Where a transaction is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Statements may be issued.
    Open,
    /// Ended by a successful commit.
    Committed,
    /// Ended by a rollback, explicit or automatic.
    RolledBack,
    /// Ended by a commit whose outcome is unknown because the caller's
    /// command timeout elapsed first.
    Indeterminate,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
            Self::Indeterminate => "indeterminate",
        })
    }
}

/// The connection a transaction runs on.
pub(crate) enum Holder<'c> {
    /// Borrowed from the caller for the transaction's lifetime.
    Borrowed(&'c mut Connection),
    /// Checked out of a pool for this transaction alone.
    Owned(Connection),
}

impl Holder<'_> {
    fn get(&self) -> &Connection {
        match self {
            Self::Borrowed(conn) => conn,
            Self::Owned(conn) => conn,
        }
    }
}

/// An open transaction on a pinned connection.
pub struct Transaction<'c> {
    conn: Holder<'c>,
    state: TransactionState,
    isolation: Option<IsolationLevel>,
    log: Vec<String>,
}

impl<'c> Transaction<'c> {
    pub(crate) async fn begin(conn: Holder<'c>, isolation: Option<IsolationLevel>) -> Result<Self> {
        let statement = Statement::Begin { isolation };
        let entry = statement.describe();
        let begun = conn.get().run(statement).await.and_then(Reply::into_done);
        if let Err(e) = begun {
            // A begin that timed out may still land; make sure it does not
            // leave the connection inside a transaction.
            conn.get().abort_transaction();
            if let Holder::Owned(mut conn) = conn {
                if let Err(e) = conn.close().await {
                    tracing::warn!(error = %e, "failed to return connection after failed begin");
                }
            }
            return Err(e);
        }
        tracing::debug!(
            slot_id = conn.get().slot_id(),
            isolation = isolation.map(|l| l.name()),
            "transaction started"
        );
        Ok(Self {
            conn,
            state: TransactionState::Open,
            isolation,
            log: vec![entry],
        })
    }

    /// Run a query and return all rows.
    pub async fn fetch(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.run(Statement::query(sql, params)).await?.into_rows()
    }

    /// Run a query and return the first row, if any.
    pub async fn fetchrow(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        Ok(self.fetch(sql, params).await?.into_iter().next())
    }

    /// Run a query and return the first column of the first row.
    pub async fn fetchval(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlValue>> {
        self.fetchval_column(sql, params, 0).await
    }

    /// Run a query and return column `column` of the first row.
    pub async fn fetchval_column(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        column: usize,
    ) -> Result<Option<SqlValue>> {
        first_value(self.fetchrow(sql, params).await?, column)
    }

    /// Run a command and return the number of rows affected.
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        self.run(Statement::execute(sql, params)).await?.into_affected()
    }

    /// Run a command once per parameter set.
    ///
    /// A failing set rolls back the whole transaction, including the sets
    /// that ran before it.
    pub async fn executemany<I>(&mut self, sql: &str, param_sets: I) -> Result<u64>
    where
        I: IntoIterator,
        I::Item: AsRef<[SqlValue]>,
    {
        self.run(Statement::execute_many(sql, param_sets))
            .await?
            .into_affected()
    }

    /// Commit the transaction.
    ///
    /// A commit the server rejects ends
    /// [`RolledBack`](TransactionState::RolledBack) without a separate
    /// rollback being sent. A commit that outlives the command timeout ends
    /// [`Indeterminate`](TransactionState::Indeterminate).
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.finish(Statement::Commit).await
    }

    /// Roll the transaction back.
    pub async fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.finish(Statement::Rollback).await
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Whether statements may still be issued.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == TransactionState::Open
    }

    /// Isolation level requested at begin, if any.
    #[must_use]
    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    /// Every statement issued in this transaction, in order, including the
    /// begin and the final commit or rollback.
    #[must_use]
    pub fn statements(&self) -> &[String] {
        &self.log
    }

    /// Run `f`, then commit on `Ok` or roll back on `Err`.
    pub(crate) async fn scope<R, E, F>(mut self, f: F) -> std::result::Result<R, E>
    where
        F: for<'t> FnOnce(&'t mut Transaction<'_>) -> BoxFuture<'t, std::result::Result<R, E>>,
        E: From<Error>,
    {
        let result = f(&mut self).await;
        match result {
            Ok(value) => {
                if self.is_open() {
                    self.commit().await?;
                }
                Ok(value)
            }
            Err(e) => {
                if self.is_open() {
                    if let Err(rollback) = self.rollback().await {
                        tracing::warn!(error = %rollback, "rollback after failed transaction body failed");
                    }
                }
                Err(e)
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            TransactionState::Open => Ok(()),
            ended => Err(Error::TransactionState(format!(
                "transaction already {ended}"
            ))),
        }
    }

    async fn run(&mut self, statement: Statement) -> Outcome {
        self.ensure_open()?;
        self.log.push(statement.describe());
        let outcome = self.conn.get().run(statement).await;
        if let Err(e) = &outcome {
            tracing::debug!(error = %e, "statement failed; rolling back transaction");
            if let Err(rollback) = self.finish(Statement::Rollback).await {
                tracing::warn!(error = %rollback, "automatic rollback failed");
            }
        }
        outcome
    }

    /// Issue the final commit or rollback and settle the verdict.
    async fn finish(&mut self, statement: Statement) -> Result<()> {
        let committing = matches!(statement, Statement::Commit);
        self.log.push(statement.describe());
        let result = self.conn.get().run(statement).await.and_then(Reply::into_done);

        self.state = match (&result, committing) {
            (Ok(()), true) => TransactionState::Committed,
            // The commit may still land on the server after the caller
            // stopped waiting.
            (Err(Error::Timeout(_)), true) => TransactionState::Indeterminate,
            _ => TransactionState::RolledBack,
        };
        tracing::debug!(state = %self.state, "transaction finished");

        if let Holder::Owned(conn) = &mut self.conn {
            if let Err(e) = conn.close().await {
                tracing::warn!(error = %e, "failed to return transaction connection to the pool");
            }
        }
        result
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TransactionState::Open {
            tracing::debug!("transaction dropped while open; queueing rollback");
            self.conn.get().abort_transaction();
            self.state = TransactionState::RolledBack;
        }
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state)
            .field("isolation", &self.isolation)
            .field("statements", &self.log.len())
            .finish_non_exhaustive()
    }
}
