//! Units of work and their replies.
//!
//! A [`Statement`] is what a caller asks a connection to do. It is executed
//! on the substrate against a checked-out slot by [`run`], and the result
//! travels back to the caller as a [`Reply`].

use mssql_bridge_pool::{PooledSlot, SlotPool};
use mssql_bridge_types::{ResultSet, Row, SqlValue};

use crate::error::{Error, Result};
use crate::pending::RequestKind;
use crate::session::SessionHandle;
use crate::transaction::IsolationLevel;

/// What a request resolves to.
pub type Outcome = Result<Reply>;

/// Successful result of a request.
#[derive(Debug)]
#[non_exhaustive]
pub enum Reply {
    /// Rows returned by a query.
    Rows(ResultSet),
    /// Affected-row count of a command.
    Affected(u64),
    /// Control statement completed.
    Done,
    /// A connection pinned to a session worker.
    Session(SessionHandle),
    /// A freshly built pool.
    Pool(SlotPool),
}

impl Reply {
    pub(crate) fn into_result_set(self) -> Result<ResultSet> {
        match self {
            Self::Rows(rows) => Ok(rows),
            other => Err(unexpected("rows", &other)),
        }
    }

    pub(crate) fn into_rows(self) -> Result<Vec<Row>> {
        self.into_result_set().map(ResultSet::into_rows)
    }

    pub(crate) fn into_affected(self) -> Result<u64> {
        match self {
            Self::Affected(count) => Ok(count),
            other => Err(unexpected("an affected-row count", &other)),
        }
    }

    pub(crate) fn into_done(self) -> Result<()> {
        match self {
            Self::Done => Ok(()),
            other => Err(unexpected("an acknowledgement", &other)),
        }
    }

    pub(crate) fn into_session(self) -> Result<SessionHandle> {
        match self {
            Self::Session(session) => Ok(session),
            other => Err(unexpected("a session", &other)),
        }
    }

    pub(crate) fn into_pool(self) -> Result<SlotPool> {
        match self {
            Self::Pool(pool) => Ok(pool),
            other => Err(unexpected("a pool", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Reply) -> Error {
    Error::Protocol(format!("expected {wanted}, got {got:?}"))
}

/// A unit of work for one connection.
#[derive(Debug, Clone)]
pub(crate) enum Statement {
    Query {
        sql: String,
        params: Vec<SqlValue>,
    },
    Execute {
        sql: String,
        params: Vec<SqlValue>,
    },
    ExecuteMany {
        sql: String,
        param_sets: Vec<Vec<SqlValue>>,
    },
    Begin {
        isolation: Option<IsolationLevel>,
    },
    Commit,
    Rollback,
}

impl Statement {
    pub(crate) fn query(sql: &str, params: &[SqlValue]) -> Self {
        Self::Query {
            sql: sql.to_owned(),
            params: params.to_vec(),
        }
    }

    pub(crate) fn execute(sql: &str, params: &[SqlValue]) -> Self {
        Self::Execute {
            sql: sql.to_owned(),
            params: params.to_vec(),
        }
    }

    pub(crate) fn execute_many<I>(sql: &str, param_sets: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<[SqlValue]>,
    {
        Self::ExecuteMany {
            sql: sql.to_owned(),
            param_sets: param_sets.into_iter().map(|p| p.as_ref().to_vec()).collect(),
        }
    }

    pub(crate) fn kind(&self) -> RequestKind {
        match self {
            Self::Query { .. } => RequestKind::Query,
            Self::Execute { .. } => RequestKind::Execute,
            Self::ExecuteMany { .. } => RequestKind::ExecuteMany,
            Self::Begin { .. } => RequestKind::Begin,
            Self::Commit => RequestKind::Commit,
            Self::Rollback => RequestKind::Rollback,
        }
    }

    pub(crate) fn sql(&self) -> Option<&str> {
        match self {
            Self::Query { sql, .. } | Self::Execute { sql, .. } | Self::ExecuteMany { sql, .. } => {
                Some(sql)
            }
            _ => None,
        }
    }

    /// Text recorded in a transaction's statement log.
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Begin { isolation: None } => "BEGIN TRANSACTION".to_owned(),
            Self::Begin {
                isolation: Some(level),
            } => format!("{}; BEGIN TRANSACTION", level.as_sql()),
            Self::Commit => "COMMIT TRANSACTION".to_owned(),
            Self::Rollback => "ROLLBACK TRANSACTION".to_owned(),
            Self::Query { sql, .. } | Self::Execute { sql, .. } | Self::ExecuteMany { sql, .. } => {
                sql.clone()
            }
        }
    }
}

/// Execute `statement` on a checked-out slot.
///
/// `in_transaction` tracks whether the slot has an open transaction so that
/// its owner can roll it back before giving the slot up.
pub(crate) async fn run(
    slot: &mut PooledSlot,
    statement: Statement,
    in_transaction: &mut bool,
) -> Outcome {
    match statement {
        Statement::Query { sql, params } => Ok(Reply::Rows(slot.execute(&sql, &params).await?)),
        Statement::Execute { sql, params } => {
            let result = slot.execute(&sql, &params).await?;
            Ok(Reply::Affected(result.rows_affected().unwrap_or(0)))
        }
        Statement::ExecuteMany { sql, param_sets } => {
            let mut total = 0;
            for (index, params) in param_sets.iter().enumerate() {
                match slot.execute(&sql, params).await {
                    Ok(result) => total += result.rows_affected().unwrap_or(0),
                    Err(e) => {
                        tracing::debug!(
                            slot_id = slot.id(),
                            failed_set = index,
                            "executemany aborted"
                        );
                        return Err(e.into());
                    }
                }
            }
            Ok(Reply::Affected(total))
        }
        Statement::Begin { isolation } => {
            if let Some(level) = isolation {
                slot.execute(level.as_sql(), &[]).await?;
            }
            slot.begin().await?;
            *in_transaction = true;
            Ok(Reply::Done)
        }
        Statement::Commit => {
            // A transaction sees one verdict at the transport, so a failed
            // commit is never followed by a rollback. A transport failure
            // has already marked the slot broken.
            *in_transaction = false;
            slot.commit().await?;
            Ok(Reply::Done)
        }
        Statement::Rollback => {
            // Whatever the server says, nothing is left to roll back.
            *in_transaction = false;
            slot.rollback().await?;
            Ok(Reply::Done)
        }
    }
}
