//! Scripted in-memory transport.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mssql_bridge_transport::{
    ConnectionHandle, Connector, Credentials, Endpoint, TransportConnection, TransportError,
};
use mssql_bridge_types::{Column, ResultSet, SqlValue};
use parking_lot::Mutex;

use crate::gate::Gate;

/// SQL text the mock treats as transaction control.
const BEGIN_SQL: &str = "BEGIN TRANSACTION";
const COMMIT_SQL: &str = "COMMIT TRANSACTION";
const ROLLBACK_SQL: &str = "ROLLBACK TRANSACTION";

/// Scripted response for a statement.
#[derive(Clone)]
pub enum MockResponse {
    /// Return a single unnamed scalar value.
    Scalar(SqlValue),

    /// Return multiple rows with columns.
    Rows {
        /// Column names.
        columns: Vec<String>,
        /// Row data.
        rows: Vec<Vec<SqlValue>>,
    },

    /// Return a server error.
    Error {
        /// Error number.
        number: i32,
        /// Error message.
        message: String,
        /// Severity class.
        severity: u8,
    },

    /// Return rows affected count (for INSERT/UPDATE/DELETE).
    RowsAffected(u64),

    /// Fail the wire exchange. The connection is dead afterwards.
    ProtocolError(String),

    /// Sleep, then respond.
    Delayed(Duration, Box<MockResponse>),

    /// Wait for a gate to open, then respond.
    Gated(Gate, Box<MockResponse>),

    /// Compute the response from the statement and its parameters.
    Custom(Arc<dyn Fn(&str, &[SqlValue]) -> MockResponse + Send + Sync>),
}

impl fmt::Debug for MockResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(v) => f.debug_tuple("Scalar").field(v).finish(),
            Self::Rows { columns, rows } => f
                .debug_struct("Rows")
                .field("columns", columns)
                .field("rows", rows)
                .finish(),
            Self::Error {
                number,
                message,
                severity,
            } => f
                .debug_struct("Error")
                .field("number", number)
                .field("message", message)
                .field("severity", severity)
                .finish(),
            Self::RowsAffected(n) => f.debug_tuple("RowsAffected").field(n).finish(),
            Self::ProtocolError(m) => f.debug_tuple("ProtocolError").field(m).finish(),
            Self::Delayed(d, inner) => f.debug_tuple("Delayed").field(d).field(inner).finish(),
            Self::Gated(_, inner) => f.debug_tuple("Gated").field(inner).finish(),
            Self::Custom(_) => f.debug_tuple("Custom").field(&"<fn>").finish(),
        }
    }
}

impl MockResponse {
    /// Create a scalar integer response.
    #[must_use]
    pub fn scalar_int(value: i32) -> Self {
        Self::Scalar(SqlValue::Int(value))
    }

    /// Create a scalar string response.
    pub fn scalar_string(value: impl Into<String>) -> Self {
        Self::Scalar(SqlValue::String(value.into()))
    }

    /// Create an empty result (no rows).
    #[must_use]
    pub fn empty() -> Self {
        Self::Rows {
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Create a rows affected response.
    #[must_use]
    pub fn affected(count: u64) -> Self {
        Self::RowsAffected(count)
    }

    /// Create a user-level server error (class 16).
    pub fn error(number: i32, message: impl Into<String>) -> Self {
        Self::Error {
            number,
            message: message.into(),
            severity: 16,
        }
    }

    /// Create a connection-terminating server error (class 20).
    pub fn fatal_error(number: i32, message: impl Into<String>) -> Self {
        Self::Error {
            number,
            message: message.into(),
            severity: 20,
        }
    }

    /// Create a wire failure.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::ProtocolError(message.into())
    }

    /// Create a row response.
    pub fn rows<S: Into<String>>(columns: Vec<S>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self::Rows {
            columns: columns.into_iter().map(Into::into).collect(),
            rows,
        }
    }

    /// Delay this response.
    #[must_use]
    pub fn delayed(self, delay: Duration) -> Self {
        Self::Delayed(delay, Box::new(self))
    }

    /// Hold this response until `gate` opens.
    #[must_use]
    pub fn gated(self, gate: &Gate) -> Self {
        Self::Gated(gate.clone(), Box::new(self))
    }

    /// Respond by calling `f`.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&str, &[SqlValue]) -> MockResponse + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }
}

/// What happened on a mock connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEventKind {
    /// Connection opened.
    Open,
    /// Statement started executing.
    Execute(String),
    /// Transaction began.
    Begin,
    /// Transaction committed.
    Commit,
    /// Transaction rolled back.
    Rollback,
    /// Connection closed.
    Close,
}

/// One entry in the mock's event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockEvent {
    /// Connection the event happened on.
    pub conn_id: u64,
    /// What happened.
    pub kind: MockEventKind,
}

struct MockState {
    responses: Mutex<HashMap<String, MockResponse>>,
    default_response: Mutex<MockResponse>,
    events: Mutex<Vec<MockEvent>>,
    killed: Mutex<HashSet<u64>>,
    connect_failures: AtomicUsize,
    connect_delay: Mutex<Option<Duration>>,
    connect_gate: Mutex<Option<Gate>>,
    close_delay: Mutex<Option<Duration>>,
    next_conn_id: AtomicU64,
    open_connections: AtomicUsize,
    max_open_connections: AtomicUsize,
    opened_total: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockState {
    fn record(&self, conn_id: u64, kind: MockEventKind) {
        self.events.lock().push(MockEvent { conn_id, kind });
    }

    fn response_for(&self, sql: &str) -> Option<MockResponse> {
        self.responses.lock().get(sql).cloned()
    }
}

/// Builder for [`MockConnector`].
pub struct MockConnectorBuilder {
    responses: HashMap<String, MockResponse>,
    default_response: MockResponse,
    connect_failures: usize,
    connect_delay: Option<Duration>,
    close_delay: Option<Duration>,
}

impl MockConnectorBuilder {
    /// Create a new builder. Unscripted statements affect zero rows.
    #[must_use]
    pub fn new() -> Self {
        Self {
            responses: HashMap::new(),
            default_response: MockResponse::affected(0),
            connect_failures: 0,
            connect_delay: None,
            close_delay: None,
        }
    }

    /// Add a response for an exact SQL text.
    #[must_use]
    pub fn with_response(mut self, sql: impl Into<String>, response: MockResponse) -> Self {
        self.responses.insert(sql.into(), response);
        self
    }

    /// Set the response for unscripted statements.
    #[must_use]
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.default_response = response;
        self
    }

    /// Fail the first `count` connection attempts.
    #[must_use]
    pub fn fail_connects(mut self, count: usize) -> Self {
        self.connect_failures = count;
        self
    }

    /// Delay every connection attempt.
    #[must_use]
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Delay every connection close. The connection counts as open until
    /// the close finishes.
    #[must_use]
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = Some(delay);
        self
    }

    /// Build the connector.
    #[must_use]
    pub fn build(self) -> MockConnector {
        MockConnector {
            state: Arc::new(MockState {
                responses: Mutex::new(self.responses),
                default_response: Mutex::new(self.default_response),
                events: Mutex::new(Vec::new()),
                killed: Mutex::new(HashSet::new()),
                connect_failures: AtomicUsize::new(self.connect_failures),
                connect_delay: Mutex::new(self.connect_delay),
                connect_gate: Mutex::new(None),
                close_delay: Mutex::new(self.close_delay),
                next_conn_id: AtomicU64::new(1),
                open_connections: AtomicUsize::new(0),
                max_open_connections: AtomicUsize::new(0),
                opened_total: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
        }
    }
}

impl Default for MockConnectorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`Connector`] that opens [`MockConnection`]s.
///
/// Clones share scripts, counters and the event log, so a test can keep one
/// handle for assertions while the pool owns another.
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> MockConnectorBuilder {
        MockConnectorBuilder::new()
    }

    /// This connector as a shareable trait object.
    #[must_use]
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// Script (or re-script) the response for an exact SQL text.
    pub fn set_response(&self, sql: impl Into<String>, response: MockResponse) {
        self.state.responses.lock().insert(sql.into(), response);
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: usize) {
        self.state.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Hold connection attempts until `gate` opens.
    pub fn gate_connects(&self, gate: &Gate) {
        *self.state.connect_gate.lock() = Some(gate.clone());
    }

    /// Simulate the server dropping a connection.
    pub fn kill_connection(&self, conn_id: u64) {
        self.state.killed.lock().insert(conn_id);
    }

    /// Snapshot of the event log.
    #[must_use]
    pub fn events(&self) -> Vec<MockEvent> {
        self.state.events.lock().clone()
    }

    /// Events for one connection, in order.
    #[must_use]
    pub fn events_for(&self, conn_id: u64) -> Vec<MockEventKind> {
        self.state
            .events
            .lock()
            .iter()
            .filter(|e| e.conn_id == conn_id)
            .map(|e| e.kind.clone())
            .collect()
    }

    /// SQL texts in the order they started executing, across connections.
    #[must_use]
    pub fn executed(&self) -> Vec<String> {
        self.state
            .events
            .lock()
            .iter()
            .filter_map(|e| match &e.kind {
                MockEventKind::Execute(sql) => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of events of the given kind.
    #[must_use]
    pub fn count(&self, kind: &MockEventKind) -> usize {
        self.state
            .events
            .lock()
            .iter()
            .filter(|e| &e.kind == kind)
            .count()
    }

    /// Forget all recorded events.
    pub fn clear_events(&self) {
        self.state.events.lock().clear();
    }

    /// Connections currently open.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.state.open_connections.load(Ordering::SeqCst)
    }

    /// Highest number of connections ever open at once.
    #[must_use]
    pub fn max_open_connections(&self) -> usize {
        self.state.max_open_connections.load(Ordering::SeqCst)
    }

    /// Connections successfully opened since creation.
    #[must_use]
    pub fn opened_total(&self) -> usize {
        self.state.opened_total.load(Ordering::SeqCst)
    }

    /// Statements executing right now.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of statements ever executing at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnector")
            .field("open_connections", &self.open_connections())
            .field("opened_total", &self.opened_total())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(
        &self,
        endpoint: &Endpoint,
        _credentials: &Credentials,
    ) -> Result<ConnectionHandle, TransportError> {
        let gate = self.state.connect_gate.lock().clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }
        let delay = *self.state.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .state
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            tracing::debug!(%endpoint, "mock connect failure");
            return Err(TransportError::Connect(format!(
                "mock refused connection to {endpoint}"
            )));
        }

        let id = self.state.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let open = self.state.open_connections.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .max_open_connections
            .fetch_max(open, Ordering::SeqCst);
        self.state.opened_total.fetch_add(1, Ordering::SeqCst);
        self.state.record(id, MockEventKind::Open);
        Ok(Box::new(MockConnection {
            id,
            state: Arc::clone(&self.state),
            broken: false,
            closed: false,
        }))
    }
}

/// Decrements the in-flight gauge on drop.
struct InFlight<'a>(&'a MockState);

impl<'a> InFlight<'a> {
    fn enter(state: &'a MockState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A connection opened by [`MockConnector`].
pub struct MockConnection {
    id: u64,
    state: Arc<MockState>,
    broken: bool,
    closed: bool,
}

impl MockConnection {
    /// Connection id as recorded in the event log.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    fn check_alive(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.broken || self.state.killed.lock().contains(&self.id) {
            self.broken = true;
            return Err(TransportError::Protocol("connection reset by peer".into()));
        }
        Ok(())
    }

    async fn respond(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        mut response: MockResponse,
    ) -> Result<ResultSet, TransportError> {
        loop {
            response = match response {
                MockResponse::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    *inner
                }
                MockResponse::Gated(gate, inner) => {
                    gate.wait().await;
                    *inner
                }
                MockResponse::Custom(f) => f(sql, params),
                MockResponse::Scalar(value) => {
                    return Ok(ResultSet::new(vec![Column::new("", 0)], vec![vec![value]])
                        .with_rows_affected(1));
                }
                MockResponse::Rows { columns, rows } => {
                    let count = rows.len() as u64;
                    let columns = columns
                        .into_iter()
                        .enumerate()
                        .map(|(i, name)| Column::new(name, i))
                        .collect();
                    return Ok(ResultSet::new(columns, rows).with_rows_affected(count));
                }
                MockResponse::RowsAffected(n) => return Ok(ResultSet::affected(n)),
                MockResponse::Error {
                    number,
                    message,
                    severity,
                } => {
                    if severity >= 20 {
                        self.broken = true;
                    }
                    return Err(TransportError::Server {
                        number,
                        class: severity,
                        message,
                    });
                }
                MockResponse::ProtocolError(message) => {
                    self.broken = true;
                    return Err(TransportError::Protocol(message));
                }
            };
        }
    }

    async fn control(&mut self, sql: &str, kind: MockEventKind) -> Result<(), TransportError> {
        self.check_alive()?;
        self.state.record(self.id, kind);
        match self.state.response_for(sql) {
            Some(response) => self.respond(sql, &[], response).await.map(|_| ()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TransportConnection for MockConnection {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<ResultSet, TransportError> {
        self.check_alive()?;
        self.state
            .record(self.id, MockEventKind::Execute(sql.to_owned()));
        let response = self
            .state
            .response_for(sql)
            .unwrap_or_else(|| self.state.default_response.lock().clone());
        let state = Arc::clone(&self.state);
        let _gauge = InFlight::enter(&state);
        self.respond(sql, params, response).await
    }

    async fn begin(&mut self) -> Result<(), TransportError> {
        self.control(BEGIN_SQL, MockEventKind::Begin).await
    }

    async fn commit(&mut self) -> Result<(), TransportError> {
        self.control(COMMIT_SQL, MockEventKind::Commit).await
    }

    async fn rollback(&mut self) -> Result<(), TransportError> {
        self.control(ROLLBACK_SQL, MockEventKind::Rollback).await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        let delay = *self.state.close_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.closed = true;
        self.state.open_connections.fetch_sub(1, Ordering::SeqCst);
        self.state.record(self.id, MockEventKind::Close);
    }

    fn is_valid(&self) -> bool {
        !self.closed && !self.broken && !self.state.killed.lock().contains(&self.id)
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.state.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
