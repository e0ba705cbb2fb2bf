//! Bridge and connection configuration.

use std::sync::Arc;
use std::time::Duration;

use mssql_bridge_transport::{Connector, Credentials, Endpoint};

use crate::error::{Error, Result};
use crate::instrumentation::SanitizationConfig;

/// Default number of substrate worker threads.
pub const DEFAULT_WORKER_THREADS: usize = 2;

/// Default name given to substrate worker threads.
pub const DEFAULT_THREAD_NAME: &str = "mssql-bridge-worker";

/// Default time a dropped bridge waits for in-flight connection work.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Configuration for a [`Bridge`](crate::Bridge).
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct BridgeConfig {
    /// Worker threads in the execution substrate.
    pub worker_threads: usize,
    /// Name given to substrate worker threads.
    pub thread_name: String,
    /// How long a caller waits for a command before giving up.
    ///
    /// The work itself keeps running on the substrate; only the caller's
    /// await ends with [`Error::Timeout`]. `None` waits indefinitely.
    pub command_timeout: Option<Duration>,
    /// How SQL text is rendered into request spans.
    pub sanitization: SanitizationConfig,
    /// How long the substrate keeps running after the bridge is dropped,
    /// so queued rollbacks, releases and closes reach the server.
    ///
    /// Zero stops the substrate immediately.
    pub shutdown_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
            command_timeout: None,
            sanitization: SanitizationConfig::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of substrate worker threads.
    #[must_use]
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count;
        self
    }

    /// Set the substrate thread name.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Set the caller-side command timeout.
    #[must_use]
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Set how SQL text is rendered into request spans.
    #[must_use]
    pub fn sanitization(mut self, config: SanitizationConfig) -> Self {
        self.sanitization = config;
        self
    }

    /// Set how long a dropped bridge drains in-flight work.
    #[must_use]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(Error::Configuration(
                "worker_threads must be greater than 0".into(),
            ));
        }
        if self.command_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::Configuration(
                "command_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Where and how to connect.
///
/// The connector is the transport implementation; the bridge never speaks
/// the wire protocol itself.
#[derive(Clone)]
pub struct ConnectOptions {
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) endpoint: Endpoint,
    pub(crate) credentials: Credentials,
}

impl ConnectOptions {
    /// Create connect options.
    pub fn new(connector: Arc<dyn Connector>, endpoint: Endpoint, credentials: Credentials) -> Self {
        Self {
            connector,
            endpoint,
            credentials,
        }
    }

    /// The server this connects to.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The credentials presented on connect.
    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("endpoint", &self.endpoint)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}
