//! Pinned-slot session workers.
//!
//! A session is an actor on the substrate that owns one checked-out slot
//! and works through an ordered command queue. Everything a
//! [`Connection`](crate::Connection) or its transaction does goes through
//! that queue, so statements on one connection never interleave and a
//! rollback queued from `Drop` runs before the slot is given back.

use mssql_bridge_pool::{PooledSlot, SlotState};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span};

use crate::bridge::{Resolution, RunQueue, deliver};
use crate::error::Error;
use crate::pending::RequestId;
use crate::statement::{self, Outcome, Reply, Statement};

/// A command for a session worker.
pub(crate) enum SessionCommand {
    /// Run a statement and report its outcome.
    Run {
        id: RequestId,
        statement: Statement,
        span: Span,
    },
    /// Roll back the open transaction, if any. Nobody waits for this.
    Abort,
    /// Roll back anything open and hand the slot back with the resolution.
    Release { id: RequestId },
}

/// Caller-side handle to a session worker.
///
/// Dropping the handle ends the session: queued commands still run, an
/// open transaction is rolled back, and the slot goes back to its pool.
pub struct SessionHandle {
    slot_id: u64,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    /// Identifier of the pinned slot.
    #[must_use]
    pub fn slot_id(&self) -> u64 {
        self.slot_id
    }

    /// Whether the worker has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub(crate) fn send(&self, command: SessionCommand) -> Result<(), SessionCommand> {
        self.commands.send(command).map_err(|e| e.0)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("slot_id", &self.slot_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Start a session worker for `slot` on the current runtime.
///
/// The worker is tracked so substrate shutdown waits for the rollback and
/// release it still owes.
pub(crate) fn spawn(slot: PooledSlot, queue: RunQueue, tracker: &TaskTracker) -> SessionHandle {
    let (commands, rx) = mpsc::unbounded_channel();
    let slot_id = slot.id();
    tracker.spawn(
        Session {
            slot,
            in_transaction: false,
        }
        .run(rx, queue),
    );
    tracing::debug!(slot_id, "session started");
    SessionHandle { slot_id, commands }
}

struct Session {
    slot: PooledSlot,
    in_transaction: bool,
}

impl Session {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>, queue: RunQueue) {
        while let Some(command) = commands.recv().await {
            match command {
                SessionCommand::Run {
                    id,
                    statement,
                    span,
                } => {
                    let outcome = self.execute(statement).instrument(span).await;
                    deliver(&queue, Resolution::new(id, outcome));
                }
                SessionCommand::Abort => self.rollback_open().await,
                SessionCommand::Release { id } => {
                    self.rollback_open().await;
                    tracing::debug!(slot_id = self.slot.id(), "session released");
                    deliver(
                        &queue,
                        Resolution {
                            id,
                            outcome: Ok(Reply::Done),
                            slot: Some(self.slot),
                        },
                    );
                    return;
                }
            }
        }

        // Handle dropped without an explicit release.
        self.rollback_open().await;
        tracing::debug!(slot_id = self.slot.id(), "session ended");
    }

    async fn execute(&mut self, statement: Statement) -> Outcome {
        if self.slot.state() == SlotState::Broken {
            if matches!(statement, Statement::Rollback) {
                // The server discards the transaction with the connection.
                self.in_transaction = false;
                return Ok(Reply::Done);
            }
            return Err(Error::ConnectionClosed);
        }
        statement::run(&mut self.slot, statement, &mut self.in_transaction).await
    }

    async fn rollback_open(&mut self) {
        if !self.in_transaction {
            return;
        }
        self.in_transaction = false;
        if self.slot.state() == SlotState::Broken {
            return;
        }
        tracing::debug!(slot_id = self.slot.id(), "rolling back abandoned transaction");
        if let Err(e) = self.slot.rollback().await {
            tracing::warn!(slot_id = self.slot.id(), error = %e, "rollback of abandoned transaction failed");
        }
    }
}
