//! Slot pool implementation.
//!
//! All bookkeeping lives behind one `parking_lot::Mutex` that is never held
//! across an `.await`. Connection opens and closes run outside the lock:
//! opens are counted in `opening` while in flight, closes in `closing`.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use mssql_bridge_transport::{
    ConnectionHandle, Connector, Credentials, Endpoint, TransportConnection, TransportError,
};
use mssql_bridge_types::{ResultSet, SqlValue};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::slot::{Slot, SlotMetadata, SlotOutcome, SlotShared, SlotState};

type Handoff = std::result::Result<PooledSlot, PoolError>;

/// Pause before a failed background open is retried for queued waiters.
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(250);

/// A pool of transport connections.
///
/// Cloning is cheap; clones share the same slots.
#[derive(Clone)]
pub struct SlotPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    endpoint: Endpoint,
    credentials: Credentials,
    runtime: Handle,
    tracker: TaskTracker,
    state: Mutex<PoolState>,
    drained: Notify,
    shutdown: CancellationToken,
    next_slot_id: AtomicU64,
    next_waiter_id: AtomicU64,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Slot>,
    waiters: VecDeque<Waiter>,
    registry: HashMap<u64, Arc<SlotShared>>,
    open_count: usize,
    opening: usize,
    closing: usize,
    closed: bool,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Handoff>,
    enqueued_at: Instant,
}

enum Step {
    Ready(Slot),
    Open,
    Wait(u64, oneshot::Receiver<Handoff>),
}

impl PoolState {
    /// Connections that exist or are about to: open, opening, or still
    /// being closed.
    fn live(&self) -> usize {
        self.open_count + self.opening + self.closing
    }

    /// Remove a slot from the books and count it as closing.
    fn detach(&mut self, id: u64) {
        self.open_count = self.open_count.saturating_sub(1);
        self.registry.remove(&id);
        self.closing += 1;
    }

    fn is_drained(&self) -> bool {
        self.closed && self.open_count == 0 && self.opening == 0 && self.closing == 0
    }

    fn prune_waiters(&mut self) {
        self.waiters.retain(|w| !w.tx.is_closed());
    }
}

impl SlotPool {
    /// Create a new pool builder.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Check out a slot.
    ///
    /// An idle slot is claimed immediately when nobody is queued ahead.
    /// Otherwise a new connection is opened if the pool is below
    /// `max_connections`, and failing that the caller joins the FIFO
    /// waiter queue until a slot is handed over, the pool closes, or
    /// `acquire_timeout` elapses.
    pub async fn acquire(&self) -> Result<PooledSlot> {
        let started = Instant::now();
        loop {
            let slot = match self.inner.next_step()? {
                Step::Ready(slot) => PooledSlot::new(slot, Arc::clone(&self.inner)),
                Step::Open => {
                    let permit = OpenPermit::new(Arc::clone(&self.inner));
                    self.inner.open_for_caller(permit).await?
                }
                Step::Wait(id, rx) => self.wait(id, rx, started).await?,
            };

            if self.inner.config.test_on_checkout && !slot.is_valid() {
                tracing::debug!(slot_id = slot.id(), "discarding dead connection on checkout");
                slot.mark_broken();
                drop(slot);
                continue;
            }

            tracing::trace!(slot_id = slot.id(), "slot checked out");
            return Ok(slot);
        }
    }

    async fn wait(
        &self,
        id: u64,
        mut rx: oneshot::Receiver<Handoff>,
        started: Instant,
    ) -> Result<PooledSlot> {
        let received = match self.inner.config.acquire_timeout {
            None => (&mut rx).await,
            Some(limit) => {
                let remaining = limit.saturating_sub(started.elapsed());
                match tokio::time::timeout(remaining, &mut rx).await {
                    Ok(received) => received,
                    Err(_) => return self.inner.abandon_wait(id, rx, limit),
                }
            }
        };

        match received {
            Ok(handoff) => handoff,
            Err(_) => Err(PoolError::PoolClosed),
        }
    }

    /// Close the pool.
    ///
    /// Queued waiters fail with [`PoolError::PoolClosed`], idle connections
    /// are closed, and checked-out connections are closed as they come
    /// back. Waits up to `close_grace` for that to finish. Calling this more
    /// than once is a no-op.
    pub async fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<Slot> = state.idle.drain(..).collect();
            for slot in &idle {
                state.detach(slot.id());
            }
            (idle, std::mem::take(&mut state.waiters))
        };

        self.inner.shutdown.cancel();
        let rejected = waiters.len();
        for waiter in waiters {
            let _ = waiter.tx.send(Err(PoolError::PoolClosed));
        }
        for slot in idle {
            self.inner.spawn_close(slot);
        }

        tracing::info!(rejected_waiters = rejected, "connection pool closing");
        if self.inner.wait_drained(self.inner.config.close_grace).await {
            tracing::info!("connection pool closed");
        }
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        let idle = state.idle.len();
        PoolStatus {
            idle,
            busy: state.open_count.saturating_sub(idle),
            opening: state.opening,
            waiters: state.waiters.iter().filter(|w| !w.tx.is_closed()).count(),
            total: state.open_count,
            max: self.inner.config.max_connections as usize,
        }
    }

    /// Metadata for every open slot, ordered by id.
    #[must_use]
    pub fn slots(&self) -> Vec<SlotMetadata> {
        let state = self.inner.state.lock();
        let mut slots: Vec<_> = state.registry.values().map(|s| s.metadata()).collect();
        slots.sort_by_key(|m| m.id);
        slots
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("endpoint", &self.inner.endpoint)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl PoolInner {
    fn next_step(self: &Arc<Self>) -> Result<Step> {
        let mut stale = Vec::new();
        let step = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PoolError::PoolClosed);
            }

            let mut ready = None;
            if state.waiters.iter().all(|w| w.tx.is_closed()) {
                state.waiters.clear();
                while let Some(slot) = state.idle.pop_back() {
                    let expired = slot
                        .shared()
                        .metadata()
                        .is_expired(self.config.max_lifetime);
                    if expired || slot.acquire_for_use().is_err() {
                        state.detach(slot.id());
                        stale.push(slot);
                        continue;
                    }
                    ready = Some(slot);
                    break;
                }
            }

            if let Some(slot) = ready {
                Step::Ready(slot)
            } else if state.live() < self.config.max_connections as usize {
                state.opening += 1;
                Step::Open
            } else {
                let (tx, rx) = oneshot::channel();
                let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
                state.waiters.push_back(Waiter {
                    id,
                    tx,
                    enqueued_at: Instant::now(),
                });
                tracing::trace!(waiter_id = id, waiters = state.waiters.len(), "queued for slot");
                Step::Wait(id, rx)
            }
        };

        for slot in stale {
            self.spawn_close(slot);
        }
        Ok(step)
    }

    async fn open_connection(&self) -> std::result::Result<ConnectionHandle, TransportError> {
        let limit = self.config.connect_timeout;
        match tokio::time::timeout(limit, self.connector.open(&self.endpoint, &self.credentials))
            .await
        {
            Ok(opened) => opened,
            Err(_) => Err(TransportError::Connect(format!(
                "timed out after {limit:?} connecting to {}",
                self.endpoint
            ))),
        }
    }

    async fn open_for_caller(self: &Arc<Self>, permit: OpenPermit) -> Result<PooledSlot> {
        let conn = match self.open_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "failed to open connection");
                return Err(PoolError::Connect(e));
            }
        };
        let slot = permit.admit(conn)?;
        if let Err(e) = slot.acquire_for_use() {
            slot.mark_broken();
            self.release(slot);
            return Err(e.into());
        }
        Ok(PooledSlot::new(slot, Arc::clone(self)))
    }

    async fn open_in_background(self: Arc<Self>, permit: OpenPermit) {
        match self.open_connection().await {
            Ok(conn) => {
                if let Ok(slot) = permit.admit(conn) {
                    if slot.acquire_for_use().is_err() {
                        slot.mark_broken();
                    }
                    self.release(slot);
                }
            }
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "background connection attempt failed");
                permit.fail();
            }
        }
    }

    fn abandon_wait(
        &self,
        id: u64,
        mut rx: oneshot::Receiver<Handoff>,
        limit: Duration,
    ) -> Result<PooledSlot> {
        self.state.lock().waiters.retain(|w| w.id != id);
        // A release may have handed us a slot between the timeout firing
        // and the waiter leaving the queue.
        match rx.try_recv() {
            Ok(handoff) => handoff,
            Err(_) => {
                tracing::debug!(waiter_id = id, timeout = ?limit, "acquire timed out");
                Err(PoolError::PoolExhaustedTimeout(limit))
            }
        }
    }

    /// Return a slot: hand it to the longest waiter, park it idle, or retire it.
    fn release(self: &Arc<Self>, mut slot: Slot) {
        let mut state = self.state.lock();
        let expired = slot
            .shared()
            .metadata()
            .is_expired(self.config.max_lifetime);

        if state.closed || expired || slot.state() == SlotState::Broken {
            state.detach(slot.id());
            let closed = state.closed;
            drop(state);
            tracing::debug!(
                slot_id = slot.id(),
                broken = slot.state() == SlotState::Broken,
                expired,
                "retiring connection"
            );
            self.spawn_close(slot);
            if !closed {
                self.replenish();
            }
            return;
        }

        while let Some(waiter) = state.waiters.pop_front() {
            let shared = Arc::clone(slot.shared());
            match waiter
                .tx
                .send(Ok(PooledSlot::new(slot, Arc::clone(self))))
            {
                Ok(()) => {
                    shared.record_checkout();
                    tracing::trace!(
                        slot_id = shared.id(),
                        waiter_id = waiter.id,
                        waited = ?waiter.enqueued_at.elapsed(),
                        "handed slot to waiter"
                    );
                    return;
                }
                Err(Ok(returned)) => match returned.into_slot() {
                    Some(back) => slot = back,
                    None => return,
                },
                Err(Err(_)) => return,
            }
        }

        slot.release(SlotOutcome::Healthy);
        state.idle.push_back(slot);
    }

    /// Run `task` on the pool's runtime, tracked so the runtime's owner can
    /// wait for it before shutting down.
    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn_on(task, &self.runtime);
    }

    fn spawn_close(self: &Arc<Self>, slot: Slot) {
        let inner = Arc::clone(self);
        self.spawn(async move {
            slot.close().await;
            inner.finish_closing();
            // The closed connection no longer counts against the maximum.
            inner.replenish();
        });
    }

    fn finish_closing(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.closing = state.closing.saturating_sub(1);
            state.is_drained()
        };
        if drained {
            self.drained.notify_waiters();
        }
    }

    fn notify_if_drained(&self) {
        if self.state.lock().is_drained() {
            self.drained.notify_waiters();
        }
    }

    /// Open connections in the background until the pool holds
    /// `min_connections` and every queued waiter has an open underway.
    fn replenish(self: &Arc<Self>) {
        let wanted = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.prune_waiters();
            let live = state.live();
            let headroom = (self.config.max_connections as usize).saturating_sub(live);
            let for_min = (self.config.min_connections as usize).saturating_sub(live);
            let for_waiters = state.waiters.len().saturating_sub(state.opening);
            let wanted = for_min.max(for_waiters).min(headroom);
            state.opening += wanted;
            wanted
        };

        if wanted > 0 {
            tracing::debug!(count = wanted, "replenishing pool");
        }
        for _ in 0..wanted {
            let permit = OpenPermit::new(Arc::clone(self));
            let inner = Arc::clone(self);
            self.spawn(inner.open_in_background(permit));
        }
    }

    /// Retire idle slots that are expired, dead, or surplus and idle too long.
    fn sweep(self: &Arc<Self>) {
        let retired = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.prune_waiters();
            let min = self.config.min_connections as usize;
            let mut kept = VecDeque::with_capacity(state.idle.len());
            let mut retired = Vec::new();
            // Front of the queue is the least recently used.
            while let Some(slot) = state.idle.pop_front() {
                let meta = slot.shared().metadata();
                let surplus_idle =
                    state.open_count > min && meta.is_idle_expired(self.config.idle_timeout);
                if meta.is_expired(self.config.max_lifetime) || !slot.is_valid() || surplus_idle {
                    state.detach(slot.id());
                    retired.push(slot);
                } else {
                    kept.push_back(slot);
                }
            }
            state.idle = kept;
            retired
        };

        for slot in retired {
            tracing::debug!(slot_id = slot.id(), "maintenance retiring idle connection");
            self.spawn_close(slot);
        }
        self.replenish();
    }

    async fn wait_drained(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let mut notified = pin!(self.drained.notified());
            notified.as_mut().enable();
            {
                let state = self.state.lock();
                if state.is_drained() {
                    return true;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let state = self.state.lock();
                tracing::warn!(
                    busy = state.open_count,
                    closing = state.closing,
                    "close grace elapsed with connections still checked out; they close on release"
                );
                return false;
            }
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for slot in self.state.get_mut().idle.drain(..) {
            self.tracker.spawn_on(slot.close(), &self.runtime);
        }
    }
}

fn spawn_maintenance(inner: &Arc<PoolInner>) {
    let weak = Arc::downgrade(inner);
    let token = inner.shutdown.clone();
    let period = inner.config.health_check_interval;
    inner.runtime.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(inner) = weak.upgrade() else { break };
            inner.sweep();
        }
        tracing::trace!("pool maintenance stopped");
    });
}

/// Reservation for one in-flight connection open.
///
/// Counted in `opening` from creation until it is admitted, fails, or is
/// dropped.
struct OpenPermit {
    pool: Arc<PoolInner>,
    armed: bool,
}

impl OpenPermit {
    fn new(pool: Arc<PoolInner>) -> Self {
        Self { pool, armed: true }
    }

    /// Turn an opened connection into a registered slot.
    fn admit(mut self, conn: ConnectionHandle) -> Result<Slot> {
        self.armed = false;
        let id = self.pool.next_slot_id.fetch_add(1, Ordering::Relaxed);
        let slot = Slot::new(id, conn);
        let mut state = self.pool.state.lock();
        state.opening -= 1;
        if state.closed {
            state.closing += 1;
            drop(state);
            self.pool.spawn_close(slot);
            return Err(PoolError::PoolClosed);
        }
        state.open_count += 1;
        state.registry.insert(id, Arc::clone(slot.shared()));
        tracing::debug!(slot_id = id, open = state.open_count, "connection opened");
        Ok(slot)
    }

    /// Give up a background open.
    ///
    /// Queued waiters keep their place; another attempt is made after
    /// [`OPEN_RETRY_DELAY`] while any are still waiting. Maintenance covers
    /// `min_connections`.
    fn fail(mut self) {
        self.armed = false;
        let has_waiters = {
            let mut state = self.pool.state.lock();
            state.opening -= 1;
            state.prune_waiters();
            !state.waiters.is_empty()
        };
        self.pool.notify_if_drained();
        if has_waiters {
            let pool = Arc::clone(&self.pool);
            self.pool.spawn(async move {
                tokio::time::sleep(OPEN_RETRY_DELAY).await;
                pool.replenish();
            });
        }
    }
}

impl Drop for OpenPermit {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let has_waiters = {
            let mut state = self.pool.state.lock();
            state.opening -= 1;
            state.prune_waiters();
            !state.waiters.is_empty()
        };
        self.pool.notify_if_drained();
        if has_waiters {
            self.pool.replenish();
        }
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Idle slots ready for checkout.
    pub idle: usize,
    /// Slots currently checked out.
    pub busy: usize,
    /// Connections being opened.
    pub opening: usize,
    /// Callers queued for a slot.
    pub waiters: usize,
    /// Open connections (idle plus busy).
    pub total: usize,
    /// Maximum allowed connections.
    pub max: usize,
}

/// A slot checked out of the pool.
///
/// The slot goes back to the pool when this guard is dropped: straight to
/// the longest waiter if there is one, otherwise to the idle queue. A slot
/// whose connection failed at the transport level is closed instead.
pub struct PooledSlot {
    id: u64,
    slot: Option<Slot>,
    pool: Arc<PoolInner>,
}

impl PooledSlot {
    fn new(slot: Slot, pool: Arc<PoolInner>) -> Self {
        Self {
            id: slot.id(),
            slot: Some(slot),
            pool,
        }
    }

    fn into_slot(mut self) -> Option<Slot> {
        self.slot.take()
    }

    fn conn(&mut self) -> std::result::Result<&mut dyn TransportConnection, TransportError> {
        self.slot
            .as_mut()
            .map(Slot::connection)
            .ok_or(TransportError::Closed)
    }

    fn observe<T>(&self, result: &std::result::Result<T, TransportError>) {
        if SlotOutcome::of(result) == SlotOutcome::Failed {
            if let Err(e) = result {
                tracing::warn!(slot_id = self.id, error = %e, "connection failed, slot marked broken");
            }
            self.mark_broken();
        }
    }

    /// Slot identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current slot state.
    #[must_use]
    pub fn state(&self) -> SlotState {
        self.slot.as_ref().map_or(SlotState::Broken, Slot::state)
    }

    /// Cheap liveness probe.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.slot.as_ref().is_some_and(Slot::is_valid)
    }

    /// Mark the slot broken so that it is closed on release.
    pub fn mark_broken(&self) {
        if let Some(slot) = &self.slot {
            slot.mark_broken();
        }
    }

    /// Execute a statement on the slot's connection.
    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> std::result::Result<ResultSet, TransportError> {
        let result = self.conn()?.execute(sql, params).await;
        self.observe(&result);
        result
    }

    /// Begin a transaction.
    pub async fn begin(&mut self) -> std::result::Result<(), TransportError> {
        let result = self.conn()?.begin().await;
        self.observe(&result);
        result
    }

    /// Commit the current transaction.
    pub async fn commit(&mut self) -> std::result::Result<(), TransportError> {
        let result = self.conn()?.commit().await;
        self.observe(&result);
        result
    }

    /// Roll back the current transaction.
    pub async fn rollback(&mut self) -> std::result::Result<(), TransportError> {
        let result = self.conn()?.rollback().await;
        self.observe(&result);
        result
    }

    /// Take the connection out of the pool for good.
    ///
    /// The pool forgets the slot and opens a replacement if needed.
    pub fn detach(mut self) -> Option<ConnectionHandle> {
        let slot = self.slot.take()?;
        {
            let mut state = self.pool.state.lock();
            state.open_count = state.open_count.saturating_sub(1);
            state.registry.remove(&slot.id());
        }
        self.pool.notify_if_drained();
        self.pool.replenish();
        Some(slot.into_connection())
    }
}

impl Drop for PooledSlot {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
        }
    }
}

impl std::fmt::Debug for PooledSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSlot")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Builder for [`SlotPool`].
#[derive(Default)]
pub struct PoolBuilder {
    config: PoolConfig,
    connector: Option<Arc<dyn Connector>>,
    endpoint: Option<Endpoint>,
    credentials: Option<Credentials>,
    runtime: Option<Handle>,
    tracker: Option<TaskTracker>,
}

impl PoolBuilder {
    /// Create a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connector used to open connections.
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set the server to connect to.
    #[must_use]
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Set the credentials presented on connect.
    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Replace the whole pool configuration.
    #[must_use]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.config.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Runtime that background opens, closes and maintenance run on.
    ///
    /// Defaults to the runtime `build` is called from.
    #[must_use]
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Tracker that background opens and closes are spawned into.
    ///
    /// Lets the owner of the runtime wait for connection work to finish
    /// before shutting it down.
    #[must_use]
    pub fn tracker(mut self, tracker: TaskTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Build the pool, eagerly opening `min_connections` connections.
    pub async fn build(self) -> Result<SlotPool> {
        self.config.validate()?;
        let connector = self
            .connector
            .ok_or_else(|| PoolError::Configuration("a connector is required".into()))?;
        let endpoint = self
            .endpoint
            .ok_or_else(|| PoolError::Configuration("an endpoint is required".into()))?;
        let credentials = self
            .credentials
            .ok_or_else(|| PoolError::Configuration("credentials are required".into()))?;
        let runtime = self.runtime.unwrap_or_else(Handle::current);

        let inner = Arc::new(PoolInner {
            config: self.config,
            connector,
            endpoint,
            credentials,
            runtime,
            tracker: self.tracker.unwrap_or_default(),
            state: Mutex::new(PoolState::default()),
            drained: Notify::new(),
            shutdown: CancellationToken::new(),
            next_slot_id: AtomicU64::new(1),
            next_waiter_id: AtomicU64::new(1),
        });

        let min = inner.config.min_connections as usize;
        inner.state.lock().opening = min;
        let permits: Vec<_> = (0..min)
            .map(|_| OpenPermit::new(Arc::clone(&inner)))
            .collect();
        let opener = &inner;
        let opened = futures_util::future::join_all(permits.into_iter().map(|permit| async move {
            let result = opener.open_connection().await;
            (permit, result)
        }))
        .await;

        let pool = SlotPool {
            inner: Arc::clone(&inner),
        };
        let mut first_error = None;
        for (permit, result) in opened {
            match result {
                Ok(conn) => {
                    let slot = permit.admit(conn)?;
                    inner.state.lock().idle.push_back(slot);
                }
                Err(e) => {
                    drop(permit);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            tracing::warn!(endpoint = %inner.endpoint, error = %e, "failed to open initial connections");
            pool.close().await;
            return Err(PoolError::Connect(e));
        }

        spawn_maintenance(&inner);
        tracing::info!(
            endpoint = %inner.endpoint,
            min = inner.config.min_connections,
            max = inner.config.max_connections,
            "connection pool ready"
        );
        Ok(pool)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_drained_requires_everything_settled() {
        let mut state = PoolState {
            closed: true,
            ..PoolState::default()
        };
        assert!(state.is_drained());
        state.closing = 1;
        assert!(!state.is_drained());
        state.closing = 0;
        state.opening = 1;
        assert!(!state.is_drained());
        state.opening = 0;
        state.closed = false;
        assert!(!state.is_drained());
    }

    #[test]
    fn test_detach_moves_slot_to_closing() {
        let mut state = PoolState {
            open_count: 2,
            ..PoolState::default()
        };
        state.detach(1);
        assert_eq!(state.open_count, 1);
        assert_eq!(state.closing, 1);
        // Counts against the maximum until the close finishes.
        assert_eq!(state.live(), 2);
        state.closing = 0;
        assert_eq!(state.live(), 1);
    }

    #[tokio::test]
    async fn test_build_requires_connector() {
        let err = SlotPool::builder().build().await.unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));
    }
}
