//! Transaction tests against the mock transport.
//!
//! The pools here hold a single connection so the mock's event log for
//! connection 1 is the whole story of what the server saw.
//!
//! Run with:
//!
//! ```bash
//! cargo test -p mssql-bridge --test transaction
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use mssql_bridge::{
    Bridge, BridgeConfig, ConnectOptions, Error, IsolationLevel, Pool, PoolConfig, SqlValue,
    TransactionState, connect,
};
use mssql_testing::{MockConnector, MockEventKind, MockResponse, test_credentials, test_endpoint};

const FIRST_CONN: u64 = 1;

async fn build_pool(mock: &MockConnector) -> Pool {
    Bridge::new(BridgeConfig::new())
        .expect("Failed to start bridge")
        .create_pool(
            ConnectOptions::new(mock.connector(), test_endpoint(), test_credentials()),
            PoolConfig::new().min_connections(1).max_connections(1),
        )
        .await
        .expect("Failed to create pool")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}

fn exec(sql: &str) -> MockEventKind {
    MockEventKind::Execute(sql.to_owned())
}

/// Events on the first connection after it was opened.
fn server_log(mock: &MockConnector) -> Vec<MockEventKind> {
    mock.events_for(FIRST_CONN)
        .into_iter()
        .filter(|e| *e != MockEventKind::Open)
        .collect()
}

// =============================================================================
// Verdicts
// =============================================================================

#[tokio::test]
async fn test_commit() {
    let mock = MockConnector::builder()
        .with_response("INSERT INTO t (v) VALUES (@p1)", MockResponse::affected(1))
        .build();
    let pool = build_pool(&mock).await;
    let mut conn = pool.acquire().await.unwrap();

    let mut tx = conn.transaction().await.unwrap();
    assert!(tx.is_open());
    let affected = tx
        .execute("INSERT INTO t (v) VALUES (@p1)", &[SqlValue::Int(1)])
        .await
        .unwrap();
    assert_eq!(affected, 1);
    tx.commit().await.unwrap();

    assert_eq!(tx.state(), TransactionState::Committed);
    assert_eq!(
        tx.statements(),
        [
            "BEGIN TRANSACTION",
            "INSERT INTO t (v) VALUES (@p1)",
            "COMMIT TRANSACTION"
        ]
    );
    drop(tx);

    assert_eq!(
        server_log(&mock),
        vec![
            MockEventKind::Begin,
            exec("INSERT INTO t (v) VALUES (@p1)"),
            MockEventKind::Commit,
        ]
    );

    conn.release().await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn test_rollback_preserves_statement_order() {
    let mock = MockConnector::builder().build();
    let pool = build_pool(&mock).await;
    let mut conn = pool.acquire().await.unwrap();

    let mut tx = conn.transaction().await.unwrap();
    tx.execute("UPDATE a SET v = 1", &[]).await.unwrap();
    tx.execute("UPDATE b SET v = 2", &[]).await.unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(tx.state(), TransactionState::RolledBack);
    drop(tx);

    assert_eq!(
        server_log(&mock),
        vec![
            MockEventKind::Begin,
            exec("UPDATE a SET v = 1"),
            exec("UPDATE b SET v = 2"),
            MockEventKind::Rollback,
        ]
    );

    conn.release().await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn test_exactly_one_verdict() {
    let mock = MockConnector::builder().build();
    let pool = build_pool(&mock).await;
    let mut conn = pool.acquire().await.unwrap();

    let mut tx = conn.transaction().await.unwrap();
    tx.commit().await.unwrap();

    assert!(matches!(tx.rollback().await, Err(Error::TransactionState(_))));
    assert!(matches!(tx.commit().await, Err(Error::TransactionState(_))));
    assert!(matches!(
        tx.execute("UPDATE t SET v = 1", &[]).await,
        Err(Error::TransactionState(_))
    ));
    drop(tx);

    assert_eq!(mock.count(&MockEventKind::Commit), 1);
    assert_eq!(mock.count(&MockEventKind::Rollback), 0);
    assert_eq!(mock.executed(), Vec::<String>::new());

    conn.release().await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn test_failed_commit_sends_no_rollback() {
    let mock = MockConnector::builder()
        .with_response(
            "COMMIT TRANSACTION",
            MockResponse::error(3902, "no corresponding BEGIN TRANSACTION"),
        )
        .build();
    let pool = build_pool(&mock).await;
    let mut conn = pool.acquire().await.unwrap();

    let mut tx = conn.transaction().await.unwrap();
    let err = tx.commit().await.unwrap_err();
    assert!(err.is_server_error(3902));
    assert_eq!(tx.state(), TransactionState::RolledBack);
    drop(tx);

    conn.fetch("SELECT 1", &[]).await.unwrap();
    assert_eq!(
        server_log(&mock),
        vec![MockEventKind::Begin, MockEventKind::Commit, exec("SELECT 1")]
    );
    assert_eq!(mock.count(&MockEventKind::Rollback), 0);

    conn.release().await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn test_commit_protocol_error_replaces_connection() {
    let mock = MockConnector::builder()
        .with_response("COMMIT TRANSACTION", MockResponse::protocol_error("connection reset"))
        .build();
    let pool = build_pool(&mock).await;

    let mut tx = pool.transaction().await.unwrap();
    tx.execute("UPDATE t SET v = 1", &[]).await.unwrap();
    let err = tx.commit().await.unwrap_err();
    assert!(err.is_protocol_error());
    assert_eq!(tx.state(), TransactionState::RolledBack);
    drop(tx);
    settle().await;

    assert_eq!(
        server_log(&mock),
        vec![
            MockEventKind::Begin,
            exec("UPDATE t SET v = 1"),
            MockEventKind::Commit,
            MockEventKind::Close,
        ]
    );
    assert_eq!(mock.count(&MockEventKind::Rollback), 0);
    assert_eq!(mock.opened_total(), 2);
    assert_eq!(pool.get_size(), 1);

    pool.close().await;
}

#[tokio::test]
async fn test_commit_timeout_is_indeterminate() {
    let mock = MockConnector::builder()
        .with_response(
            "COMMIT TRANSACTION",
            MockResponse::empty().delayed(Duration::from_millis(200)),
        )
        .build();
    let pool = Bridge::new(BridgeConfig::new().command_timeout(Duration::from_millis(50)))
        .expect("Failed to start bridge")
        .create_pool(
            ConnectOptions::new(mock.connector(), test_endpoint(), test_credentials()),
            PoolConfig::new().min_connections(1).max_connections(1),
        )
        .await
        .expect("Failed to create pool");
    let mut conn = pool.acquire().await.unwrap();

    let mut tx = conn.transaction().await.unwrap();
    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(tx.state(), TransactionState::Indeterminate);
    assert!(!tx.is_open());
    assert!(matches!(
        tx.rollback().await,
        Err(Error::TransactionState(_))
    ));
    drop(tx);

    // The commit still lands, and nothing rolls it back afterwards.
    tokio::time::sleep(Duration::from_millis(250)).await;
    conn.fetch("SELECT 1", &[]).await.unwrap();
    assert_eq!(
        server_log(&mock),
        vec![MockEventKind::Begin, MockEventKind::Commit, exec("SELECT 1")]
    );

    conn.release().await.unwrap();
    pool.close().await;
}

// =============================================================================
// Automatic Rollback
// =============================================================================

#[tokio::test]
async fn test_statement_error_rolls_back() {
    let mock = MockConnector::builder()
        .with_response(
            "INSERT INTO t (id) VALUES (1)",
            MockResponse::error(2627, "Violation of PRIMARY KEY constraint"),
        )
        .build();
    let pool = build_pool(&mock).await;
    let mut conn = pool.acquire().await.unwrap();

    let mut tx = conn.transaction().await.unwrap();
    tx.execute("UPDATE t SET v = 0", &[]).await.unwrap();
    let err = tx
        .execute("INSERT INTO t (id) VALUES (1)", &[])
        .await
        .unwrap_err();
    assert!(err.is_server_error(2627));
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert!(matches!(
        tx.execute("UPDATE t SET v = 1", &[]).await,
        Err(Error::TransactionState(_))
    ));
    drop(tx);

    assert_eq!(
        server_log(&mock),
        vec![
            MockEventKind::Begin,
            exec("UPDATE t SET v = 0"),
            exec("INSERT INTO t (id) VALUES (1)"),
            MockEventKind::Rollback,
        ]
    );

    conn.release().await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn test_drop_rolls_back_before_next_statement() {
    let mock = MockConnector::builder()
        .with_response("SELECT 1", MockResponse::scalar_int(1))
        .build();
    let pool = build_pool(&mock).await;
    let mut conn = pool.acquire().await.unwrap();

    {
        let mut tx = conn.transaction().await.unwrap();
        tx.execute("DELETE FROM t", &[]).await.unwrap();
    }

    assert_eq!(
        conn.fetchval("SELECT 1", &[]).await.unwrap(),
        Some(SqlValue::Int(1))
    );
    assert_eq!(
        server_log(&mock),
        vec![
            MockEventKind::Begin,
            exec("DELETE FROM t"),
            MockEventKind::Rollback,
            exec("SELECT 1"),
        ]
    );

    conn.release().await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn test_release_rolls_back_open_transaction() {
    let mock = MockConnector::builder().build();
    let pool = build_pool(&mock).await;

    let mut tx = pool.transaction().await.unwrap();
    tx.execute("DELETE FROM t", &[]).await.unwrap();
    assert_eq!(pool.get_idle_size(), 0);
    drop(tx);
    settle().await;

    assert_eq!(mock.count(&MockEventKind::Rollback), 1);
    assert_eq!(pool.get_idle_size(), 1);

    pool.close().await;
}

#[tokio::test]
async fn test_protocol_error_discards_connection() {
    let mock = MockConnector::builder()
        .with_response("UPDATE t SET v = 1", MockResponse::protocol_error("connection reset"))
        .with_response("SELECT 1", MockResponse::scalar_int(1))
        .build();
    let pool = build_pool(&mock).await;

    let mut tx = pool.transaction().await.unwrap();
    let err = tx.execute("UPDATE t SET v = 1", &[]).await.unwrap_err();
    assert!(err.is_protocol_error());
    assert_eq!(tx.state(), TransactionState::RolledBack);
    drop(tx);
    settle().await;

    // The server drops the transaction with the connection; no rollback is
    // sent on a dead wire.
    assert_eq!(mock.count(&MockEventKind::Rollback), 0);
    assert_eq!(mock.opened_total(), 2);
    assert_eq!(pool.get_size(), 1);
    assert_eq!(
        pool.fetchval("SELECT 1", &[]).await.unwrap(),
        Some(SqlValue::Int(1))
    );

    pool.close().await;
}

#[tokio::test]
async fn test_rollback_survives_dropping_private_bridge() {
    let mock = MockConnector::builder().build();
    {
        let mut conn = connect(ConnectOptions::new(
            mock.connector(),
            test_endpoint(),
            test_credentials(),
        ))
        .await
        .unwrap();
        let mut tx = conn.transaction().await.unwrap();
        tx.execute("UPDATE t", &[]).await.unwrap();
        // Transaction, connection and the bridge behind it all drop here.
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        server_log(&mock),
        vec![
            MockEventKind::Begin,
            exec("UPDATE t"),
            MockEventKind::Rollback,
            MockEventKind::Close,
        ]
    );
    assert_eq!(mock.open_connections(), 0);
}

// =============================================================================
// Isolation and Scoped Transactions
// =============================================================================

#[tokio::test]
async fn test_isolation_level_set_before_begin() {
    let mock = MockConnector::builder().build();
    let pool = build_pool(&mock).await;
    let mut conn = pool.acquire().await.unwrap();

    let mut tx = conn
        .transaction_with_isolation(IsolationLevel::Serializable)
        .await
        .unwrap();
    assert_eq!(tx.isolation_level(), Some(IsolationLevel::Serializable));
    tx.commit().await.unwrap();
    drop(tx);

    assert_eq!(
        server_log(&mock),
        vec![
            exec("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"),
            MockEventKind::Begin,
            MockEventKind::Commit,
        ]
    );

    conn.release().await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn test_failed_begin_returns_connection() {
    let mock = MockConnector::builder()
        .with_response(
            "BEGIN TRANSACTION",
            MockResponse::error(3906, "database is read-only"),
        )
        .build();
    let pool = build_pool(&mock).await;

    let result = pool.transaction().await;
    assert!(matches!(result, Err(Error::Server { number: 3906, .. })));
    assert_eq!(pool.get_idle_size(), 1);

    pool.close().await;
}

#[tokio::test]
async fn test_pool_transaction_returns_connection_on_commit() {
    let mock = MockConnector::builder().build();
    let pool = build_pool(&mock).await;

    let mut tx = pool.transaction().await.unwrap();
    assert_eq!(pool.get_idle_size(), 0);
    tx.execute("UPDATE t SET v = 1", &[]).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(pool.get_idle_size(), 1);
    assert_eq!(mock.count(&MockEventKind::Commit), 1);

    pool.close().await;
}

#[tokio::test]
async fn test_run_in_transaction_commits_on_ok() {
    let mock = MockConnector::builder()
        .with_response("INSERT INTO t (v) VALUES (1)", MockResponse::affected(1))
        .with_response("SELECT COUNT(*) FROM t", MockResponse::scalar_int(5))
        .build();
    let pool = build_pool(&mock).await;

    let count = pool
        .run_in_transaction(|tx| {
            Box::pin(async move {
                tx.execute("INSERT INTO t (v) VALUES (1)", &[]).await?;
                tx.fetchval("SELECT COUNT(*) FROM t", &[]).await
            })
        })
        .await
        .unwrap();

    assert_eq!(count, Some(SqlValue::Int(5)));
    assert_eq!(mock.count(&MockEventKind::Commit), 1);
    assert_eq!(mock.count(&MockEventKind::Rollback), 0);
    assert_eq!(pool.get_idle_size(), 1);

    pool.close().await;
}

#[tokio::test]
async fn test_run_in_transaction_rolls_back_on_err() {
    let mock = MockConnector::builder().build();
    let pool = build_pool(&mock).await;
    let mut conn = pool.acquire().await.unwrap();

    let result: Result<(), Error> = conn
        .run_in_transaction(|tx| {
            Box::pin(async move {
                tx.execute("UPDATE t SET v = 1", &[]).await?;
                Err(Error::Configuration("business rule rejected".into()))
            })
        })
        .await;

    assert!(matches!(result, Err(Error::Configuration(_))));
    assert_eq!(
        server_log(&mock),
        vec![
            MockEventKind::Begin,
            exec("UPDATE t SET v = 1"),
            MockEventKind::Rollback,
        ]
    );

    conn.release().await.unwrap();
    pool.close().await;
}
