//! Mock transport behaviour tests.
//!
//! The bridge and pool suites lean on these guarantees, so they are pinned
//! down here on their own.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use mssql_bridge_transport::{Connector, TransportError};
use mssql_bridge_types::SqlValue;
use mssql_testing::{
    Gate, MockConnector, MockEventKind, MockResponse, test_credentials, test_endpoint,
};

// =============================================================================
// Scripted Responses
// =============================================================================

#[tokio::test]
async fn test_scripted_rows_and_default() {
    let mock = MockConnector::builder()
        .with_response(
            "SELECT id, name FROM users",
            MockResponse::rows(
                vec!["id", "name"],
                vec![
                    vec![SqlValue::Int(1), SqlValue::from("Alice")],
                    vec![SqlValue::Int(2), SqlValue::from("Bob")],
                ],
            ),
        )
        .build();

    let mut conn = mock
        .open(&test_endpoint(), &test_credentials())
        .await
        .expect("open should succeed");

    let rs = conn.execute("SELECT id, name FROM users", &[]).await.unwrap();
    assert_eq!(rs.rows().len(), 2);
    assert_eq!(rs.rows()[1].get::<String>("name").unwrap(), "Bob");

    let rs = conn.execute("UPDATE t SET x = 1", &[]).await.unwrap();
    assert_eq!(rs.rows_affected(), Some(0));
    assert_eq!(
        mock.executed(),
        vec!["SELECT id, name FROM users", "UPDATE t SET x = 1"]
    );
}

#[tokio::test]
async fn test_custom_response_sees_params() {
    let mock = MockConnector::builder()
        .with_response(
            "SELECT @P1",
            MockResponse::custom(|_, params| MockResponse::Scalar(params[0].clone())),
        )
        .build();
    let mut conn = mock.open(&test_endpoint(), &test_credentials()).await.unwrap();

    let rs = conn.execute("SELECT @P1", &[SqlValue::Int(42)]).await.unwrap();
    assert_eq!(rs.rows()[0].get::<i32>(0).unwrap(), 42);
}

// =============================================================================
// Fault Injection
// =============================================================================

#[tokio::test]
async fn test_server_error_keeps_connection() {
    let mock = MockConnector::builder()
        .with_response("SELECT nope", MockResponse::error(208, "Invalid object name"))
        .build();
    let mut conn = mock.open(&test_endpoint(), &test_credentials()).await.unwrap();

    let err = conn.execute("SELECT nope", &[]).await.unwrap_err();
    assert!(matches!(err, TransportError::Server { number: 208, class: 16, .. }));
    assert!(conn.is_valid());
}

#[tokio::test]
async fn test_protocol_error_kills_connection() {
    let mock = MockConnector::builder()
        .with_response("SELECT boom", MockResponse::protocol_error("reset"))
        .build();
    let mut conn = mock.open(&test_endpoint(), &test_credentials()).await.unwrap();

    assert!(conn.execute("SELECT boom", &[]).await.is_err());
    assert!(!conn.is_valid());
    let err = conn.execute("SELECT 1", &[]).await.unwrap_err();
    assert!(err.is_connection_fatal());
}

#[tokio::test]
async fn test_connect_failures_then_success() {
    let mock = MockConnector::builder().fail_connects(2).build();

    for _ in 0..2 {
        let err = mock.open(&test_endpoint(), &test_credentials()).await.err();
        assert!(matches!(err, Some(TransportError::Connect(_))));
    }
    assert!(mock.open(&test_endpoint(), &test_credentials()).await.is_ok());
    assert_eq!(mock.opened_total(), 1);
}

#[tokio::test]
async fn test_killed_connection_reports_invalid() {
    let mock = MockConnector::builder().build();
    let conn = mock.open(&test_endpoint(), &test_credentials()).await.unwrap();
    assert!(conn.is_valid());
    mock.kill_connection(1);
    assert!(!conn.is_valid());
}

// =============================================================================
// Gauges and Event Log
// =============================================================================

#[tokio::test]
async fn test_gate_holds_statement_in_flight() {
    let gate = Gate::new();
    let mock = MockConnector::builder()
        .with_response("WAITFOR", MockResponse::affected(1).gated(&gate))
        .build();
    let mut conn = mock.open(&test_endpoint(), &test_credentials()).await.unwrap();

    let task = tokio::spawn(async move { conn.execute("WAITFOR", &[]).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(mock.in_flight(), 1);

    gate.open();
    let rs = task.await.unwrap().unwrap();
    assert_eq!(rs.rows_affected(), Some(1));
    assert_eq!(mock.in_flight(), 0);
    assert_eq!(mock.max_in_flight(), 1);
}

#[tokio::test]
async fn test_event_log_records_lifecycle() {
    let mock = MockConnector::builder().build();
    let mut conn = mock.open(&test_endpoint(), &test_credentials()).await.unwrap();

    conn.begin().await.unwrap();
    conn.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
    conn.rollback().await.unwrap();
    conn.close().await;
    conn.close().await;

    assert_eq!(
        mock.events_for(1),
        vec![
            MockEventKind::Open,
            MockEventKind::Begin,
            MockEventKind::Execute("INSERT INTO t VALUES (1)".into()),
            MockEventKind::Rollback,
            MockEventKind::Close,
        ]
    );
    assert_eq!(mock.open_connections(), 0);
}
