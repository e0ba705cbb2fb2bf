//! Connection slots.
//!
//! A [`Slot`] pairs one transport connection with an atomic state cell.
//! The state is the only thing that keeps two users off the same
//! connection: every checkout goes through a compare-and-set from
//! [`SlotState::Idle`] to [`SlotState::Busy`].
//!
//! The metadata half of a slot ([`SlotShared`]) is reference counted so the
//! pool can report on checked-out slots without touching their connections.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use mssql_bridge_transport::{ConnectionHandle, TransportConnection, TransportError};
use parking_lot::Mutex;

use crate::error::SlotError;

/// Slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// Connection is idle and available for checkout.
    Idle = 0,
    /// Connection is checked out.
    Busy = 1,
    /// Connection failed at the transport level and must be closed.
    Broken = 2,
}

impl SlotState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Busy,
            _ => Self::Broken,
        }
    }

    /// Check if the slot is available for checkout.
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Check if the slot should be removed from the pool.
    #[must_use]
    pub fn should_remove(&self) -> bool {
        matches!(self, Self::Broken)
    }
}

/// How a unit of work on a slot ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    /// The connection is still usable.
    Healthy,
    /// The connection failed at the transport level.
    Failed,
}

impl SlotOutcome {
    /// Classify the result of a transport call.
    pub fn of<T>(result: &Result<T, TransportError>) -> Self {
        match result {
            Err(e) if e.is_connection_fatal() => Self::Failed,
            _ => Self::Healthy,
        }
    }
}

/// Shared, lock-free view of a slot.
#[derive(Debug)]
pub struct SlotShared {
    id: u64,
    state: AtomicU8,
    created_at: Instant,
    last_used_at: Mutex<Instant>,
    checkout_count: AtomicU64,
}

impl SlotShared {
    fn new(id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: AtomicU8::new(SlotState::Idle as u8),
            created_at: now,
            last_used_at: Mutex::new(now),
            checkout_count: AtomicU64::new(0),
        }
    }

    /// Slot identifier, unique within a pool.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Snapshot of the slot's metadata.
    #[must_use]
    pub fn metadata(&self) -> SlotMetadata {
        SlotMetadata {
            id: self.id,
            state: self.state(),
            created_at: self.created_at,
            last_used_at: *self.last_used_at.lock(),
            checkout_count: self.checkout_count.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_checkout(&self) {
        *self.last_used_at.lock() = Instant::now();
        self.checkout_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time metadata about a slot.
#[derive(Debug, Clone)]
pub struct SlotMetadata {
    /// Unique identifier for this slot.
    pub id: u64,
    /// State when the snapshot was taken.
    pub state: SlotState,
    /// When the connection was opened.
    pub created_at: Instant,
    /// When the slot was last checked out or returned.
    pub last_used_at: Instant,
    /// Number of times the slot has been checked out.
    pub checkout_count: u64,
}

impl SlotMetadata {
    /// Check if the connection has exceeded its maximum lifetime.
    #[must_use]
    pub fn is_expired(&self, max_lifetime: Duration) -> bool {
        self.created_at.elapsed() >= max_lifetime
    }

    /// Check if the connection has been idle too long.
    #[must_use]
    pub fn is_idle_expired(&self, idle_timeout: Duration) -> bool {
        self.last_used_at.elapsed() >= idle_timeout
    }
}

/// One pooled transport connection plus its state cell.
pub struct Slot {
    shared: Arc<SlotShared>,
    conn: ConnectionHandle,
}

impl Slot {
    /// Wrap a freshly opened connection. The slot starts Idle.
    pub fn new(id: u64, conn: ConnectionHandle) -> Self {
        Self {
            shared: Arc::new(SlotShared::new(id)),
            conn,
        }
    }

    /// Slot identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SlotState {
        self.shared.state()
    }

    /// Shared metadata handle.
    #[must_use]
    pub fn shared(&self) -> &Arc<SlotShared> {
        &self.shared
    }

    /// Claim the slot: Idle to Busy.
    ///
    /// Fails with [`SlotError::AlreadyBusy`] if someone else holds it and
    /// [`SlotError::Broken`] if it may no longer be used.
    pub fn acquire_for_use(&self) -> Result<(), SlotError> {
        match self.shared.state.compare_exchange(
            SlotState::Idle as u8,
            SlotState::Busy as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.shared.record_checkout();
                Ok(())
            }
            Err(raw) if SlotState::from_u8(raw) == SlotState::Busy => {
                Err(SlotError::AlreadyBusy(self.id()))
            }
            Err(_) => Err(SlotError::Broken(self.id())),
        }
    }

    /// Finish a unit of work: Busy to Idle, or to Broken on failure.
    ///
    /// A Broken slot stays Broken.
    pub fn release(&self, outcome: SlotOutcome) {
        *self.shared.last_used_at.lock() = Instant::now();
        match outcome {
            SlotOutcome::Failed => self.mark_broken(),
            SlotOutcome::Healthy => {
                let released = self.shared.state.compare_exchange(
                    SlotState::Busy as u8,
                    SlotState::Idle as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                if let Err(raw) = released {
                    if SlotState::from_u8(raw) == SlotState::Idle {
                        tracing::error!(slot_id = self.id(), "slot released while not checked out");
                    }
                }
            }
        }
    }

    /// Mark the slot unusable.
    pub fn mark_broken(&self) {
        self.shared
            .state
            .store(SlotState::Broken as u8, Ordering::Release);
    }

    /// Cheap liveness probe.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.state() != SlotState::Broken && self.conn.is_valid()
    }

    /// Borrow the connection.
    pub fn connection(&mut self) -> &mut dyn TransportConnection {
        self.conn.as_mut()
    }

    /// Give up the slot, keeping the connection.
    #[must_use]
    pub fn into_connection(self) -> ConnectionHandle {
        self.mark_broken();
        self.conn
    }

    /// Close the underlying connection.
    pub async fn close(mut self) {
        self.mark_broken();
        self.conn.close().await;
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
