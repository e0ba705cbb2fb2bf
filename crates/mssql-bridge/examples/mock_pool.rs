//! Pool and transaction walkthrough against the in-memory mock transport.
//!
//! This example demonstrates:
//! - Creating a pool from a single-threaded caller runtime
//! - Concurrent statements bounded by the pool size
//! - Pinned connections and transactions
//! - Inspecting pool size while requests are in flight
//!
//! # Running
//!
//! ```bash
//! RUST_LOG=debug cargo run -p mssql-bridge --example mock_pool
//! ```

// Allow common patterns in example code
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use mssql_bridge::{ConnectOptions, Error, IsolationLevel, PoolConfig, SqlValue, create_pool};
use mssql_testing::{MockConnector, MockResponse, test_credentials, test_endpoint};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let mock = MockConnector::builder()
        .with_response(
            "SELECT id, name FROM users",
            MockResponse::rows(
                vec!["id", "name"],
                vec![
                    vec![SqlValue::Int(1), SqlValue::from("ada")],
                    vec![SqlValue::Int(2), SqlValue::from("grace")],
                ],
            ),
        )
        .with_response(
            "SELECT COUNT(*) FROM users",
            MockResponse::scalar_int(2).delayed(Duration::from_millis(50)),
        )
        .with_default_response(MockResponse::affected(1))
        .build();

    let options = ConnectOptions::new(mock.connector(), test_endpoint(), test_credentials());
    let pool = create_pool(options, PoolConfig::new().min_connections(2).max_connections(2)).await?;
    println!(
        "Pool ready: {} connections ({} idle)",
        pool.get_size(),
        pool.get_idle_size()
    );

    // Example 1: plain queries
    println!("\n--- Example 1: Queries ---");
    for row in pool.fetch("SELECT id, name FROM users", &[]).await? {
        let id: i32 = row.get("id")?;
        let name: String = row.get("name")?;
        println!("  user {id}: {name}");
    }

    // Example 2: more requests than connections
    println!("\n--- Example 2: Concurrent Requests ---");
    let counts = futures_util::future::join_all(
        (0..5).map(|_| pool.fetchval("SELECT COUNT(*) FROM users", &[])),
    )
    .await;
    println!(
        "  {} requests finished, at most {} ran at once",
        counts.len(),
        mock.max_in_flight()
    );

    // Example 3: a transaction on a pinned connection
    println!("\n--- Example 3: Transaction ---");
    let mut conn = pool.acquire().await?;
    let mut tx = conn
        .transaction_with_isolation(IsolationLevel::Serializable)
        .await?;
    tx.execute("UPDATE users SET active = 0 WHERE id = @p1", &[SqlValue::Int(1)])
        .await?;
    tx.execute("UPDATE users SET active = 1 WHERE id = @p1", &[SqlValue::Int(2)])
        .await?;
    tx.commit().await?;
    for statement in tx.statements() {
        println!("  {statement}");
    }
    println!("  transaction {}", tx.state());
    drop(tx);
    conn.release().await?;

    // Example 4: scoped transaction that rolls back
    println!("\n--- Example 4: Scoped Rollback ---");
    let result: Result<(), Error> = pool
        .run_in_transaction(|tx| {
            Box::pin(async move {
                tx.execute("DELETE FROM users", &[]).await?;
                Err(Error::TransactionState("refusing to delete everyone".into()))
            })
        })
        .await;
    println!("  scope ended with: {}", result.unwrap_err());

    pool.close().await;
    println!("\nPool closed");
    Ok(())
}
