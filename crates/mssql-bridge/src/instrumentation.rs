//! Tracing instrumentation for dispatched requests.
//!
//! Every unit of work the bridge sends to the substrate runs inside a
//! `tracing` span named after the operation, carrying the request id and,
//! for statements, the sanitized SQL text. Names and fields follow the
//! OpenTelemetry database semantic conventions so that an OpenTelemetry
//! subscriber layer can export them unchanged:
//!
//! - `db.system`: "mssql"
//! - `db.name`: Database name
//! - `db.statement`: SQL statement (sanitized if configured)
//! - `db.operation`: Query operation type (SELECT, INSERT, etc.)
//! - `server.address`: Server hostname
//! - `server.port`: Server port

use mssql_bridge_transport::Endpoint;
use tracing::Span;

use crate::pending::{RequestId, RequestKind};

/// Database system identifier for MSSQL.
pub const DB_SYSTEM: &str = "mssql";

/// Span names for database operations.
pub mod span_names {
    /// Span name for opening connections.
    pub const CONNECT: &str = "mssql.connect";
    /// Span name for checking a connection out of the pool.
    pub const ACQUIRE: &str = "mssql.acquire";
    /// Span name for query execution.
    pub const QUERY: &str = "mssql.query";
    /// Span name for command execution.
    pub const EXECUTE: &str = "mssql.execute";
    /// Span name for batched command execution.
    pub const EXECUTE_MANY: &str = "mssql.execute_many";
    /// Span name for beginning a transaction.
    pub const BEGIN_TRANSACTION: &str = "mssql.begin_transaction";
    /// Span name for committing a transaction.
    pub const COMMIT: &str = "mssql.commit";
    /// Span name for rolling back a transaction.
    pub const ROLLBACK: &str = "mssql.rollback";
    /// Span name for returning a pinned connection.
    pub const RELEASE: &str = "mssql.release";
}

/// Configuration for SQL statement sanitization.
#[derive(Debug, Clone)]
pub struct SanitizationConfig {
    /// Whether to sanitize SQL statements.
    pub enabled: bool,
    /// Maximum length of statement to record.
    pub max_length: usize,
    /// Placeholder to use for sanitized values.
    pub placeholder: String,
}

impl Default for SanitizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_length: 2048,
            placeholder: "?".to_string(),
        }
    }
}

impl SanitizationConfig {
    /// Create a configuration that doesn't sanitize statements.
    #[must_use]
    pub fn no_sanitization() -> Self {
        Self {
            enabled: false,
            max_length: usize::MAX,
            placeholder: String::new(),
        }
    }

    /// Sanitize a SQL statement according to the configuration.
    #[must_use]
    pub fn sanitize(&self, sql: &str) -> String {
        if !self.enabled {
            return truncate_string(sql, self.max_length);
        }
        let sanitized = sanitize_sql(sql, &self.placeholder);
        truncate_string(&sanitized, self.max_length)
    }
}

/// Replace string and numeric literals with `placeholder`.
fn sanitize_sql(sql: &str, placeholder: &str) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote = None;

    while let Some(c) = chars.next() {
        if let Some(open) = quote {
            if c == open {
                // Doubled quote is an escaped quote inside the literal.
                if chars.peek() == Some(&open) {
                    chars.next();
                    continue;
                }
                quote = None;
                result.push_str(placeholder);
            }
            continue;
        }

        if c == '\'' {
            quote = Some(c);
            continue;
        }

        // Digits glued to an identifier (`col1`, `@p1`) are not literals.
        if c.is_ascii_digit()
            && !result.ends_with(|ch: char| ch.is_alphanumeric() || ch == '_' || ch == '@')
        {
            while chars
                .peek()
                .is_some_and(|ch| ch.is_ascii_digit() || *ch == '.')
            {
                chars.next();
            }
            result.push_str(placeholder);
            continue;
        }

        result.push(c);
    }

    if quote.is_some() {
        result.push_str(placeholder);
    }
    result
}

/// Truncate to at most `max_len` bytes on a character boundary.
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len.saturating_sub(3);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Extract the operation type from a SQL statement.
#[must_use]
pub fn extract_operation(sql: &str) -> &'static str {
    let sql_upper = sql.trim_start().to_uppercase();
    const OPERATIONS: &[(&str, &str)] = &[
        ("SELECT", "SELECT"),
        ("INSERT", "INSERT"),
        ("UPDATE", "UPDATE"),
        ("DELETE", "DELETE"),
        ("MERGE", "MERGE"),
        ("EXEC", "EXECUTE"),
        ("BEGIN TRAN", "BEGIN"),
        ("COMMIT", "COMMIT"),
        ("ROLLBACK", "ROLLBACK"),
        ("SET TRANSACTION", "SET"),
        ("CREATE", "CREATE"),
        ("ALTER", "ALTER"),
        ("DROP", "DROP"),
    ];
    OPERATIONS
        .iter()
        .find(|(prefix, _)| sql_upper.starts_with(*prefix))
        .map_or("OTHER", |&(_, op)| op)
}

/// Build the span a dispatched request runs in.
pub(crate) fn request_span(
    kind: RequestKind,
    id: RequestId,
    sql: Option<&str>,
    sanitization: &SanitizationConfig,
) -> Span {
    let statement = sql.map(|s| sanitization.sanitize(s)).unwrap_or_default();
    let operation = sql.map_or(kind.as_str(), extract_operation);
    match kind {
        RequestKind::Connect => tracing::debug_span!(
            span_names::CONNECT,
            request_id = %id,
            db.system = DB_SYSTEM,
        ),
        RequestKind::Acquire => tracing::debug_span!(
            span_names::ACQUIRE,
            request_id = %id,
            db.system = DB_SYSTEM,
        ),
        RequestKind::Query => tracing::debug_span!(
            span_names::QUERY,
            request_id = %id,
            db.system = DB_SYSTEM,
            db.operation = operation,
            db.statement = %statement,
        ),
        RequestKind::Execute => tracing::debug_span!(
            span_names::EXECUTE,
            request_id = %id,
            db.system = DB_SYSTEM,
            db.operation = operation,
            db.statement = %statement,
        ),
        RequestKind::ExecuteMany => tracing::debug_span!(
            span_names::EXECUTE_MANY,
            request_id = %id,
            db.system = DB_SYSTEM,
            db.operation = operation,
            db.statement = %statement,
        ),
        RequestKind::Begin => tracing::debug_span!(
            span_names::BEGIN_TRANSACTION,
            request_id = %id,
            db.system = DB_SYSTEM,
        ),
        RequestKind::Commit => tracing::debug_span!(
            span_names::COMMIT,
            request_id = %id,
            db.system = DB_SYSTEM,
        ),
        RequestKind::Rollback => tracing::debug_span!(
            span_names::ROLLBACK,
            request_id = %id,
            db.system = DB_SYSTEM,
        ),
        RequestKind::Release => tracing::debug_span!(
            span_names::RELEASE,
            request_id = %id,
            db.system = DB_SYSTEM,
        ),
    }
}

/// Span for building a pool against `endpoint`.
pub(crate) fn connect_span(endpoint: &Endpoint) -> Span {
    tracing::info_span!(
        span_names::CONNECT,
        db.system = DB_SYSTEM,
        db.name = endpoint.database.as_deref().unwrap_or_default(),
        server.address = %endpoint.host,
        server.port = endpoint.port,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_sql_strings() {
        let sql = "SELECT * FROM users WHERE name = 'John'";
        let sanitized = sanitize_sql(sql, "?");
        assert_eq!(sanitized, "SELECT * FROM users WHERE name = ?");
    }

    #[test]
    fn test_sanitize_sql_numbers() {
        let sql = "SELECT * FROM users WHERE id = 123";
        let sanitized = sanitize_sql(sql, "?");
        assert_eq!(sanitized, "SELECT * FROM users WHERE id = ?");
    }

    #[test]
    fn test_sanitize_keeps_parameter_markers() {
        let sql = "UPDATE t1 SET v = @p1 WHERE id = 42";
        assert_eq!(sanitize_sql(sql, "?"), "UPDATE t1 SET v = @p1 WHERE id = ?");
    }

    #[test]
    fn test_sanitize_escaped_quotes() {
        let sql = "SELECT * FROM users WHERE name = 'O''Brien'";
        let sanitized = sanitize_sql(sql, "?");
        assert_eq!(sanitized, "SELECT * FROM users WHERE name = ?");
    }

    #[test]
    fn test_sanitize_unterminated_literal() {
        assert_eq!(sanitize_sql("SELECT 'abc", "?"), "SELECT ?");
    }

    #[test]
    fn test_truncation() {
        let config = SanitizationConfig {
            enabled: false,
            max_length: 10,
            placeholder: "?".to_string(),
        };
        assert_eq!(config.sanitize("SELECT * FROM t"), "SELECT ...");
        // Never splits a multi-byte character.
        assert_eq!(truncate_string("ééééééé", 8), "éé...");
    }

    #[test]
    fn test_no_sanitization() {
        let config = SanitizationConfig::no_sanitization();
        let sql = "SELECT * FROM users WHERE id = 1";
        assert_eq!(config.sanitize(sql), sql);
    }

    #[test]
    fn test_extract_operation() {
        assert_eq!(extract_operation("SELECT * FROM users"), "SELECT");
        assert_eq!(extract_operation("  insert INTO t VALUES (1)"), "INSERT");
        assert_eq!(extract_operation("EXEC sp_who"), "EXECUTE");
        assert_eq!(extract_operation("BEGIN TRANSACTION"), "BEGIN");
        assert_eq!(
            extract_operation("SET TRANSACTION ISOLATION LEVEL SNAPSHOT"),
            "SET"
        );
        assert_eq!(extract_operation("WITH cte AS (SELECT 1) SELECT 1"), "OTHER");
    }
}
