//! The dispatch bridge.
//!
//! A [`Bridge`] connects the caller's runtime to the execution substrate.
//! Callers never run connection I/O themselves: each request is registered
//! in the pending table, its work is spawned on the substrate, and the
//! outcome comes back as a [`Resolution`] on an unbounded run queue. A
//! driver task on the caller's runtime drains that queue, resolves the
//! pending entry, and only then releases the slot the work ran on.
//!
//! ```text
//! caller runtime                         substrate
//! --------------                         ---------
//! register(id) ── spawn(work) ─────────▶ acquire slot, execute
//! await Completion                              │
//!      ▲                                        ▼
//!      └── driver: resolve(id), drop(slot) ◀── run queue
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::FutureExt;
use mssql_bridge_pool::{PoolConfig, PooledSlot, SlotPool};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Sleep;
use tracing::Instrument;

use crate::config::{BridgeConfig, ConnectOptions};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::instrumentation;
use crate::pending::{Delivery, PendingTable, RequestId, RequestKind};
use crate::pool::Pool;
use crate::session::{self, SessionCommand, SessionHandle};
use crate::statement::{Outcome, Reply, Statement};
use crate::substrate::Substrate;

/// A finished unit of work on its way back to the caller.
pub(crate) struct Resolution {
    pub(crate) id: RequestId,
    pub(crate) outcome: Outcome,
    /// Released after the outcome is delivered.
    pub(crate) slot: Option<PooledSlot>,
}

impl Resolution {
    pub(crate) fn new(id: RequestId, outcome: Outcome) -> Self {
        Self {
            id,
            outcome,
            slot: None,
        }
    }
}

/// Sending half of the caller's run queue.
pub(crate) type RunQueue = mpsc::UnboundedSender<Resolution>;

/// Put a resolution on the run queue.
///
/// If the caller's runtime is gone the resolution is dropped where it is,
/// which still returns its slot to the pool.
pub(crate) fn deliver(queue: &RunQueue, resolution: Resolution) {
    if let Err(mpsc::error::SendError(resolution)) = queue.send(resolution) {
        tracing::debug!(
            request_id = %resolution.id,
            "caller runtime gone; dropping resolution on the substrate"
        );
    }
}

/// Handle to the execution substrate.
///
/// Cloning is cheap; clones share the substrate, the pending table and the
/// resolution driver. The substrate shuts down when the last clone (and
/// every [`Pool`] and [`Connection`] built from it) is dropped.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    config: BridgeConfig,
    pending: Arc<PendingTable>,
    queue: RunQueue,
    // Dropping this shuts the substrate runtime down.
    substrate: Substrate,
}

impl Bridge {
    /// Start a bridge.
    ///
    /// Must be called from inside the caller's tokio runtime: the
    /// resolution driver is spawned onto it.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let caller = Handle::try_current().map_err(|_| {
            Error::Substrate("a bridge must be started from inside a tokio runtime".into())
        })?;
        let substrate = Substrate::start(&config)?;
        let pending = Arc::new(PendingTable::new());
        let (queue, run_queue) = mpsc::unbounded_channel();
        caller.spawn(drive_resolutions(Arc::clone(&pending), run_queue));

        Ok(Self {
            inner: Arc::new(BridgeInner {
                config,
                pending,
                queue,
                substrate,
            }),
        })
    }

    /// Open a single connection.
    ///
    /// The connection is pinned to one transport connection for its whole
    /// life; statements on it run in the order they were issued.
    pub async fn connect(&self, options: ConnectOptions) -> Result<Connection> {
        let config = PoolConfig::new().min_connections(1).max_connections(1);
        let slots = self.build_pool(options, config).await?;
        match self.open_session(&slots).await {
            Ok(session) => Ok(Connection::standalone(self.clone(), session, slots)),
            Err(e) => {
                slots.close().await;
                Err(e)
            }
        }
    }

    /// Create a connection pool.
    ///
    /// `config.min_connections` connections are opened before this returns.
    pub async fn create_pool(&self, options: ConnectOptions, config: PoolConfig) -> Result<Pool> {
        let slots = self.build_pool(options, config).await?;
        Ok(Pool::new(self.clone(), slots))
    }

    /// Number of requests awaiting resolution.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// The bridge configuration.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    async fn build_pool(&self, options: ConnectOptions, config: PoolConfig) -> Result<SlotPool> {
        let span = instrumentation::connect_span(&options.endpoint);
        let builder = SlotPool::builder()
            .connector(options.connector)
            .endpoint(options.endpoint)
            .credentials(options.credentials)
            .config(config)
            .runtime(self.inner.substrate.handle().clone())
            .tracker(self.inner.substrate.tracker().clone());

        let work = async move {
            match builder.build().await {
                Ok(pool) => (Ok(Reply::Pool(pool)), None),
                Err(e) => (Err(e.into()), None),
            }
        };
        self.submit(RequestKind::Connect, None, work.instrument(span))
            .await?
            .into_pool()
    }

    /// Check a slot out of `pool` and pin it to a new session worker.
    pub(crate) async fn open_session(&self, pool: &SlotPool) -> Result<SessionHandle> {
        let pool = pool.clone();
        let queue = self.inner.queue.clone();
        let tracker = self.inner.substrate.tracker().clone();
        self.submit(RequestKind::Acquire, None, async move {
            match pool.acquire().await {
                Ok(slot) => (Ok(Reply::Session(session::spawn(slot, queue, &tracker))), None),
                Err(e) => (Err(e.into()), None),
            }
        })
        .await?
        .into_session()
    }

    /// Run one statement on any slot from `pool`.
    ///
    /// The slot travels back with the resolution and is released once the
    /// caller has been handed the outcome.
    pub(crate) fn run_unpinned(&self, pool: &SlotPool, statement: Statement) -> Completion {
        let pool = pool.clone();
        let kind = statement.kind();
        let sql = statement.sql().map(str::to_owned);
        self.submit(kind, sql.as_deref(), async move {
            let mut slot = match pool.acquire().await {
                Ok(slot) => slot,
                Err(e) => return (Err(e.into()), None),
            };
            tracing::trace!(slot_id = slot.id(), "running unpinned statement");
            let outcome = crate::statement::run(&mut slot, statement, &mut false).await;
            (outcome, Some(slot))
        })
    }

    /// Send a statement to a pinned session.
    pub(crate) fn dispatch(&self, session: &SessionHandle, statement: Statement) -> Completion {
        let kind = statement.kind();
        let (id, rx) = self.inner.pending.register(kind);
        let span = instrumentation::request_span(
            kind,
            id,
            statement.sql(),
            &self.inner.config.sanitization,
        );
        tracing::debug!(
            request_id = %id,
            kind = kind.as_str(),
            slot_id = session.slot_id(),
            "dispatching to session"
        );
        if session.send(SessionCommand::Run { id, statement, span }).is_err() {
            deliver(&self.inner.queue, Resolution::new(id, Err(Error::ConnectionClosed)));
        }
        self.completion(id, rx)
    }

    /// Ask a session to give its slot back to the pool.
    pub(crate) fn release(&self, session: SessionHandle) -> Completion {
        let (id, rx) = self.inner.pending.register(RequestKind::Release);
        tracing::debug!(request_id = %id, slot_id = session.slot_id(), "releasing session");
        if session.send(SessionCommand::Release { id }).is_err() {
            deliver(&self.inner.queue, Resolution::new(id, Ok(Reply::Done)));
        }
        self.completion(id, rx)
    }

    fn submit<F>(&self, kind: RequestKind, sql: Option<&str>, work: F) -> Completion
    where
        F: Future<Output = (Outcome, Option<PooledSlot>)> + Send + 'static,
    {
        let (id, rx) = self.inner.pending.register(kind);
        let span = instrumentation::request_span(kind, id, sql, &self.inner.config.sanitization);
        let queue = self.inner.queue.clone();
        tracing::debug!(request_id = %id, kind = kind.as_str(), "dispatching request");

        let task = async move {
            let (outcome, slot) = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(finished) => finished,
                Err(_) => {
                    tracing::error!(request_id = %id, "request panicked on the substrate");
                    (Err(Error::Cancelled), None)
                }
            };
            deliver(&queue, Resolution { id, outcome, slot });
        };
        self.inner.substrate.spawn(task.instrument(span));
        self.completion(id, rx)
    }

    fn completion(&self, id: RequestId, rx: oneshot::Receiver<Outcome>) -> Completion {
        Completion {
            id,
            rx,
            deadline: self
                .inner
                .config
                .command_timeout
                .map(|limit| (limit, Box::pin(tokio::time::sleep(limit)))),
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("substrate", &self.inner.substrate)
            .field("pending", &self.inner.pending)
            .finish_non_exhaustive()
    }
}

/// Caller-side handle for one dispatched request.
///
/// Resolves with the request's outcome. Dropping it does not stop the
/// work on the substrate: the work runs to completion, its outcome is
/// discarded, and any slot it used is released as usual.
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion {
    id: RequestId,
    rx: oneshot::Receiver<Outcome>,
    deadline: Option<(Duration, Pin<Box<Sleep>>)>,
}

impl Completion {
    /// The request this completion belongs to.
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Future for Completion {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome> {
        let this = self.get_mut();
        if let Poll::Ready(received) = Pin::new(&mut this.rx).poll(cx) {
            return Poll::Ready(received.unwrap_or_else(|_| Err(Error::Cancelled)));
        }
        if let Some((limit, sleep)) = &mut this.deadline {
            if sleep.as_mut().poll(cx).is_ready() {
                tracing::debug!(request_id = %this.id, timeout = ?limit, "caller stopped waiting");
                return Poll::Ready(Err(Error::Timeout(*limit)));
            }
        }
        Poll::Pending
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Drain the run queue on the caller's runtime.
async fn drive_resolutions(
    pending: Arc<PendingTable>,
    mut run_queue: mpsc::UnboundedReceiver<Resolution>,
) {
    tracing::debug!("resolution driver started");
    while let Some(Resolution { id, outcome, slot }) = run_queue.recv().await {
        match pending.resolve(id, outcome) {
            Ok(Delivery::Delivered { elapsed }) => {
                tracing::trace!(request_id = %id, ?elapsed, "request resolved");
            }
            Ok(Delivery::Abandoned { kind }) => {
                tracing::debug!(
                    request_id = %id,
                    kind = kind.as_str(),
                    "caller stopped waiting; outcome discarded"
                );
            }
            Err(e) => {
                tracing::error!(request_id = %id, error = %e, "resolution rejected");
            }
        }
        drop(slot);
    }
    tracing::debug!("resolution driver stopped");
}
