//! Pending request table.
//!
//! Every request handed to the substrate gets a fresh [`RequestId`] and an
//! entry holding the sender half of its completion channel. Resolving an
//! entry removes it, so each id is delivered at most once; a second attempt
//! is reported as [`Error::DoubleResolution`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::statement::Outcome;

/// Identifier of a dispatched request.
///
/// Allocated from a monotonic counter and never reused within a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    /// The raw counter value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a request asks the substrate to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Build a pool and open its initial connections.
    Connect,
    /// Check a connection out of the pool and pin it to a session.
    Acquire,
    /// Run a statement and return its rows.
    Query,
    /// Run a statement and return the affected-row count.
    Execute,
    /// Run a statement once per parameter set.
    ExecuteMany,
    /// Begin a transaction.
    Begin,
    /// Commit a transaction.
    Commit,
    /// Roll back a transaction.
    Rollback,
    /// Return a pinned connection to its pool.
    Release,
}

impl RequestKind {
    /// Short name used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Acquire => "ACQUIRE",
            Self::Query => "QUERY",
            Self::Execute => "EXECUTE",
            Self::ExecuteMany => "EXECUTE_MANY",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
            Self::Release => "RELEASE",
        }
    }
}

/// How a resolution was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The caller received the outcome.
    Delivered {
        /// Time from registration to resolution.
        elapsed: Duration,
    },
    /// The caller had stopped waiting; the outcome was dropped.
    Abandoned {
        /// What the abandoned request was.
        kind: RequestKind,
    },
}

struct PendingRequest {
    tx: oneshot::Sender<Outcome>,
    submitted_at: Instant,
    kind: RequestKind,
}

/// Table of requests awaiting resolution.
#[derive(Default)]
pub struct PendingTable {
    next_id: AtomicU64,
    entries: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl PendingTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new request and return its id and the receiving half of
    /// its completion channel.
    pub fn register(&self, kind: RequestKind) -> (RequestId, oneshot::Receiver<Outcome>) {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.entries.lock().insert(
            id,
            PendingRequest {
                tx,
                submitted_at: Instant::now(),
                kind,
            },
        );
        (id, rx)
    }

    /// Resolve a request with its outcome.
    ///
    /// The entry is removed before the outcome is sent. An id that is no
    /// longer (or was never) in the table yields
    /// [`Error::DoubleResolution`].
    pub fn resolve(&self, id: RequestId, outcome: Outcome) -> Result<Delivery, Error> {
        let entry = self.entries.lock().remove(&id);
        let Some(entry) = entry else {
            return Err(Error::DoubleResolution(id));
        };
        let elapsed = entry.submitted_at.elapsed();
        match entry.tx.send(outcome) {
            Ok(()) => Ok(Delivery::Delivered { elapsed }),
            Err(_) => Ok(Delivery::Abandoned { kind: entry.kind }),
        }
    }

    /// Whether `id` is still awaiting resolution.
    #[must_use]
    pub fn is_pending(&self, id: RequestId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Number of unresolved requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no requests are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTable")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("pending", &self.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::statement::Reply;
    use proptest::prelude::*;

    #[test]
    fn test_ids_are_monotonic() {
        let table = PendingTable::new();
        let (a, _ra) = table.register(RequestKind::Query);
        let (b, _rb) = table.register(RequestKind::Execute);
        assert!(b > a);
        assert_eq!(table.len(), 2);
        assert_eq!(a.to_string(), "#0");
    }

    #[test]
    fn test_resolve_delivers_once() {
        let table = PendingTable::new();
        let (id, mut rx) = table.register(RequestKind::Execute);

        let first = table.resolve(id, Ok(Reply::Affected(3))).unwrap();
        assert!(matches!(first, Delivery::Delivered { .. }));
        assert!(matches!(rx.try_recv().unwrap(), Ok(Reply::Affected(3))));

        let second = table.resolve(id, Ok(Reply::Affected(4))).unwrap_err();
        assert!(matches!(second, Error::DoubleResolution(d) if d == id));
        assert!(table.is_empty());
    }

    #[test]
    fn test_abandoned_receiver() {
        let table = PendingTable::new();
        let (id, rx) = table.register(RequestKind::Query);
        drop(rx);
        let delivery = table.resolve(id, Ok(Reply::Done)).unwrap();
        assert_eq!(
            delivery,
            Delivery::Abandoned {
                kind: RequestKind::Query
            }
        );
        assert!(!table.is_pending(id));
    }

    #[test]
    fn test_unknown_id_is_rejected() {
        let table = PendingTable::new();
        let err = table.resolve(RequestId(99), Ok(Reply::Done)).unwrap_err();
        assert!(matches!(err, Error::DoubleResolution(_)));
    }

    proptest! {
        /// However resolutions are ordered or repeated, every registered
        /// request is delivered exactly once and every repeat is rejected.
        #[test]
        fn prop_each_request_resolves_exactly_once(
            count in 1usize..32,
            attempts in proptest::collection::vec(0usize..32, 0..128),
        ) {
            let table = PendingTable::new();
            let mut receivers: Vec<_> = (0..count)
                .map(|_| table.register(RequestKind::Query))
                .collect();

            let mut delivered = vec![0usize; count];
            let order = attempts
                .into_iter()
                .map(|i| i % count)
                .chain(0..count);
            for idx in order {
                let id = receivers[idx].0;
                match table.resolve(id, Ok(Reply::Affected(idx as u64))) {
                    Ok(Delivery::Delivered { .. }) => delivered[idx] += 1,
                    Ok(Delivery::Abandoned { .. }) => prop_assert!(false, "receiver is alive"),
                    Err(Error::DoubleResolution(d)) => prop_assert_eq!(d, id),
                    Err(other) => prop_assert!(false, "unexpected error {other}"),
                }
            }

            prop_assert!(table.is_empty());
            for (idx, (_, rx)) in receivers.iter_mut().enumerate() {
                prop_assert_eq!(delivered[idx], 1);
                match rx.try_recv() {
                    Ok(Ok(Reply::Affected(n))) => prop_assert_eq!(n, idx as u64),
                    _ => prop_assert!(false, "missing outcome for {idx}"),
                }
            }
        }
    }
}
