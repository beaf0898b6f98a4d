/// Connection pool concurrency tests
///
/// Hammers a shared pool from many tasks and checks that handles are never
/// shared and the bookkeeping stays consistent.
/// Run with: cargo test --test pool_concurrency_tests

use docsync::storage::MemoryStore;
use docsync::{ConnectionConfig, ConnectionPool, SyncError};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

fn pool(store: &MemoryStore, capacity: usize) -> Arc<ConnectionPool> {
    let config = ConnectionConfig::default()
        .name("concurrency")
        .max_connections(capacity)
        .acquire_timeout(Duration::from_secs(5));
    Arc::new(ConnectionPool::new(config, store.connector()).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_never_shares_a_handle() {
    let store = MemoryStore::new();
    let capacity = 4;
    let pool = pool(&store, capacity);
    let held = Arc::new(Mutex::new(HashSet::new()));

    let mut handles = vec![];
    for _ in 0..capacity {
        let pool = Arc::clone(&pool);
        let held = Arc::clone(&held);
        handles.push(tokio::spawn(async move {
            let lease = pool.acquire().await.unwrap();
            assert!(held.lock().await.insert(lease.id()), "handle handed out twice");
            tokio::time::sleep(Duration::from_millis(20)).await;
            lease.id()
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap());
    }

    assert_eq!(ids.len(), capacity);
    let stats = pool.stats().await;
    assert_eq!(stats.total_connections, capacity);
    assert_eq!(stats.in_use_connections, capacity);
    assert_eq!(stats.idle_connections, 0);
    assert!(matches!(pool.acquire().await, Err(SyncError::PoolExhausted { capacity: 4 })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_acquire_release_cycles_stay_consistent() {
    let store = MemoryStore::new();
    let capacity = 3;
    let pool = pool(&store, capacity);
    let active = Arc::new(Mutex::new(HashSet::new()));

    let mut handles = vec![];
    for _ in 0..12 {
        let pool = Arc::clone(&pool);
        let active = Arc::clone(&active);
        handles.push(tokio::spawn(async move {
            for _ in 0..10 {
                let lease = pool.acquire_timeout(Duration::from_secs(5)).await.unwrap();
                assert!(active.lock().await.insert(lease.id()), "handle shared");
                tokio::task::yield_now().await;
                assert!(active.lock().await.remove(&lease.id()));
                pool.release(lease.id()).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = pool.stats().await;
    assert!(stats.total_connections <= capacity);
    assert_eq!(stats.in_use_connections, 0);
    assert_eq!(stats.idle_connections, stats.total_connections);
    assert_eq!(store.stats().connections_opened as usize, stats.total_connections);
}

#[tokio::test]
async fn test_destroyed_connections_free_capacity() {
    let store = MemoryStore::new();
    let pool = pool(&store, 2);

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    assert!(pool.acquire().await.is_err());

    assert!(pool.destroy(a.id()).await);
    assert!(!pool.destroy(a.id()).await);
    assert!(matches!(pool.release(a.id()).await, Err(SyncError::InvalidRelease(_))));

    let c = pool.acquire().await.unwrap();
    assert_ne!(c.id(), a.id());
    assert_ne!(c.id(), b.id());
    assert_eq!(store.stats().connections_closed, 1);
    assert_eq!(pool.stats().await.total_connections, 2);
}
