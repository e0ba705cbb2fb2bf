//! The execution substrate.
//!
//! A dedicated multi-thread tokio runtime on which every connection open,
//! statement and close runs. Callers only ever see its results.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::task::TaskTracker;

use crate::config::BridgeConfig;
use crate::error::{Error, Result};

/// Owned multi-thread runtime for connection work.
///
/// Work spawned through [`Substrate::spawn`] is tracked. Dropping the
/// substrate lets tracked work (queued rollbacks, releases and closes) run
/// to completion, bounded by the configured shutdown grace, before the
/// runtime stops.
pub(crate) struct Substrate {
    runtime: Option<Runtime>,
    handle: Handle,
    tracker: TaskTracker,
    workers: usize,
    thread_name: String,
    shutdown_grace: Duration,
}

impl Substrate {
    pub(crate) fn start(config: &BridgeConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name(config.thread_name.clone())
            .enable_all()
            .build()
            .map_err(|e| Error::Substrate(e.to_string()))?;
        let handle = runtime.handle().clone();
        tracing::info!(
            workers = config.worker_threads,
            thread_name = %config.thread_name,
            "execution substrate started"
        );
        Ok(Self {
            runtime: Some(runtime),
            handle,
            tracker: TaskTracker::new(),
            workers: config.worker_threads,
            thread_name: config.thread_name.clone(),
            shutdown_grace: config.shutdown_grace,
        })
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Tracker that substrate shutdown waits on.
    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Spawn tracked work on the substrate.
    pub(crate) fn spawn<F>(&self, task: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn_on(task, &self.handle)
    }

    pub(crate) fn workers(&self) -> usize {
        self.workers
    }
}

impl Drop for Substrate {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        self.tracker.close();
        if self.tracker.is_empty() || self.shutdown_grace.is_zero() {
            // Never blocks, so this is safe from inside the caller's runtime.
            runtime.shutdown_background();
            tracing::debug!("execution substrate stopped");
            return;
        }

        // Draining needs a blocking wait, which must not happen on the
        // thread doing the drop: it may be a runtime worker.
        tracing::debug!(
            pending = self.tracker.len(),
            "draining execution substrate"
        );
        let runtime = Arc::new(Mutex::new(Some(runtime)));
        let drained = Arc::clone(&runtime);
        let tracker = self.tracker.clone();
        let grace = self.shutdown_grace;
        let spawned = std::thread::Builder::new()
            .name(format!("{}-shutdown", self.thread_name))
            .spawn(move || {
                let Some(runtime) = drained.lock().take() else {
                    return;
                };
                let waited = runtime.block_on(tokio::time::timeout(grace, tracker.wait()));
                if waited.is_err() {
                    tracing::warn!(
                        pending = tracker.len(),
                        grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                        "substrate shutdown grace elapsed with work still pending"
                    );
                }
                runtime.shutdown_background();
                tracing::debug!("execution substrate stopped");
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "failed to start substrate drain thread");
            if let Some(runtime) = runtime.lock().take() {
                runtime.shutdown_background();
            }
        }
    }
}

impl std::fmt::Debug for Substrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Substrate")
            .field("workers", &self.workers)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn test_runs_work_on_named_threads() {
        let substrate = Substrate::start(&BridgeConfig::new().thread_name("sub-test")).unwrap();
        assert_eq!(substrate.workers(), 2);
        let name = tokio_test::block_on(substrate.handle().spawn(async {
            std::thread::current().name().map(str::to_owned)
        }))
        .unwrap();
        assert_eq!(name.as_deref(), Some("sub-test"));
    }

    #[tokio::test]
    async fn test_drop_inside_async_context() {
        let substrate = Substrate::start(&BridgeConfig::default()).unwrap();
        let answer = substrate.handle().spawn(async { 42 }).await.unwrap();
        assert_eq!(answer, 42);
        drop(substrate);
    }

    #[tokio::test]
    async fn test_drop_lets_tracked_work_finish() {
        let substrate = Substrate::start(&BridgeConfig::default()).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        substrate.spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
        });
        drop(substrate);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_drop_abandons_work_after_grace() {
        let config = BridgeConfig::new().shutdown_grace(Duration::from_millis(50));
        let substrate = Substrate::start(&config).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        substrate.spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            flag.store(true, Ordering::SeqCst);
        });
        drop(substrate);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!done.load(Ordering::SeqCst));
    }
}
