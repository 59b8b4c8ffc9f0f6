//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use windrose::Event;
use windrose::providers::in_memory::InMemoryProvider;
use windrose::providers::sqlite::SqliteProvider;
use windrose::providers::Provider;

pub fn create_in_memory_store() -> Arc<dyn Provider> {
    Arc::new(InMemoryProvider::default())
}

pub async fn create_sqlite_store_memory() -> Arc<dyn Provider> {
    Arc::new(SqliteProvider::new_in_memory().await.unwrap())
}

/// On-disk SQLite store for restart/recovery tests. Short lock timeout so
/// queue items claimed by an aborted runtime become visible again quickly.
pub async fn create_sqlite_store_disk() -> (Arc<dyn Provider>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let db_url = sqlite_url(&td);
    let store = SqliteProvider::new(&db_url)
        .await
        .unwrap()
        .with_lock_timeout(Duration::from_millis(500));
    (Arc::new(store) as Arc<dyn Provider>, td)
}

pub fn sqlite_url(td: &TempDir) -> String {
    format!("sqlite:{}", td.path().join("test.db").display())
}

/// Reopen a provider over an existing database file (simulated restart).
pub async fn reopen_sqlite_store(td: &TempDir) -> Arc<dyn Provider> {
    let store = SqliteProvider::new(&sqlite_url(td))
        .await
        .unwrap()
        .with_lock_timeout(Duration::from_millis(500));
    Arc::new(store) as Arc<dyn Provider>
}

pub async fn wait_for_history<F>(store: &Arc<dyn Provider>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await.unwrap_or_default();
        if predicate(&hist) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until the instance has subscribed to `name`, the point after
/// which a raised event is guaranteed to correlate.
pub async fn wait_for_subscription(store: &Arc<dyn Provider>, instance: &str, name: &str, timeout_ms: u64) -> bool {
    wait_for_history(
        store,
        instance,
        |hist| {
            hist.iter()
                .any(|e| matches!(e, Event::ExternalSubscribed { name: n, .. } if n == name))
        },
        timeout_ms,
    )
    .await
}
