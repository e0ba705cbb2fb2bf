//! Waiter fairness tests.
//!
//! When the pool is at its maximum, callers are served in the order they
//! started waiting, and a returned connection goes straight to the head of
//! the queue.
//!
//! Run with:
//!
//! ```bash
//! cargo test -p mssql-bridge --test fairness
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use mssql_bridge::{Bridge, BridgeConfig, ConnectOptions, Pool, PoolConfig, SqlValue};
use mssql_testing::{Gate, MockConnector, MockResponse, test_credentials, test_endpoint};
use parking_lot::Mutex;

async fn build_pool(mock: &MockConnector, max: u32) -> Pool {
    Bridge::new(BridgeConfig::new())
        .expect("Failed to start bridge")
        .create_pool(
            ConnectOptions::new(mock.connector(), test_endpoint(), test_credentials()),
            PoolConfig::new().min_connections(max).max_connections(max),
        )
        .await
        .expect("Failed to create pool")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}

#[tokio::test]
async fn test_acquire_waiters_served_in_arrival_order() {
    let mock = MockConnector::builder().build();
    let pool = build_pool(&mock, 1).await;
    let served = Arc::new(Mutex::new(Vec::new()));

    let holder = pool.acquire().await.unwrap();
    let waiters = join_all((0..4u64).map(|n| {
        let pool = pool.clone();
        let served = Arc::clone(&served);
        async move {
            // Stagger arrival so the queue order is well defined.
            tokio::time::sleep(Duration::from_millis(10 * n)).await;
            let conn = pool.acquire().await.unwrap();
            served.lock().push(n);
            conn.release().await.unwrap();
        }
    }));
    let releaser = async {
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(pool.status().waiters, 4);
        holder.release().await.unwrap();
    };
    tokio::join!(waiters, releaser);

    assert_eq!(*served.lock(), vec![0, 1, 2, 3]);
    assert_eq!(mock.opened_total(), 1);

    pool.close().await;
}

#[tokio::test]
async fn test_statements_served_in_arrival_order() {
    let gate = Gate::new();
    let mock = MockConnector::builder()
        .with_response("SELECT hold", MockResponse::scalar_int(0).gated(&gate))
        .with_default_response(MockResponse::affected(1))
        .build();
    let pool = build_pool(&mock, 1).await;

    let blocker = pool.fetchval("SELECT hold", &[]);
    let queued = join_all((1..=3u64).map(|n| {
        let pool = pool.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(10 * n)).await;
            pool.execute(&format!("UPDATE t SET v = {n}"), &[]).await
        }
    }));
    let opener = async {
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pool.status().waiters, 3);
        gate.open();
    };
    let (held, results, ()) = tokio::join!(blocker, queued, opener);

    assert_eq!(held.unwrap(), Some(SqlValue::Int(0)));
    assert!(results.into_iter().all(|r| r.unwrap() == 1));
    assert_eq!(
        mock.executed(),
        vec![
            "SELECT hold",
            "UPDATE t SET v = 1",
            "UPDATE t SET v = 2",
            "UPDATE t SET v = 3",
        ]
    );

    pool.close().await;
}

#[tokio::test]
async fn test_returned_connection_skips_idle_list() {
    let mock = MockConnector::builder().build();
    let pool = build_pool(&mock, 1).await;

    let holder = pool.acquire().await.unwrap();
    let slot_id = holder.slot_id();
    let waiter = pool.acquire();
    let releaser = async {
        settle().await;
        holder.release().await.unwrap();
        // Handed straight to the waiter, never parked as idle.
        assert_eq!(pool.get_idle_size(), 0);
    };
    let (conn, ()) = tokio::join!(waiter, releaser);
    let conn = conn.unwrap();
    assert_eq!(conn.slot_id(), slot_id);

    conn.release().await.unwrap();
    assert_eq!(pool.get_idle_size(), 1);
    pool.close().await;
}
