//! Cache behaviour over TCP: ordering, staleness bounds, locks, callbacks,
//! rewrites and degraded operation while the server is down.

use rust_ics::cache::{Cache, CacheClient, CacheEntry, CacheServer, CacheStore};
use rust_ics::config::CacheConfig;
use rust_ics::error::IcsError;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn client_config() -> CacheConfig {
    CacheConfig {
        request_timeout_ms: 1000,
        reconnect_interval_ms: 50,
        ..CacheConfig::default()
    }
}

async fn start_server(address: &str, store: Arc<CacheStore>) -> (String, CancellationToken) {
    let server = CacheServer::bind(address, store).await.unwrap();
    let address = server.local_addr().unwrap().to_string();
    let token = server.shutdown_token();
    tokio::spawn(server.run());
    (address, token)
}

async fn client(address: &str, name: &str) -> CacheClient {
    CacheClient::connect(address, name, &client_config()).await
}

#[tokio::test]
async fn test_history_is_ordered_by_write_time() {
    let (address, _token) = start_server("127.0.0.1:0", Arc::new(CacheStore::new())).await;
    let a = client(&address, "a").await;
    let b = client(&address, "b").await;

    // newer write arrives first
    b.put("m1/value", json!(2.0), 200.0, None).await.unwrap();
    a.put("m1/value", json!(1.0), 100.0, None).await.unwrap();

    let history = a.history("m1/value", 0.0, 1000.0).await.unwrap();
    let values: Vec<_> = history.iter().map(|e| e.value.clone()).collect();
    assert_eq!(values, vec![json!(1.0), json!(2.0)]);
    assert_eq!(a.get_value("m1/value", 0.0).await.unwrap(), Some(json!(2.0)));
}

#[tokio::test]
async fn test_mintime_forces_miss() {
    let (address, _token) = start_server("127.0.0.1:0", Arc::new(CacheStore::new())).await;
    let c = client(&address, "c").await;
    c.put("det/value", json!(5), 100.0, None).await.unwrap();
    assert!(c.get("det/value", 100.0).await.unwrap().is_some());
    assert!(c.get("det/value", 100.5).await.unwrap().is_none());
}

#[tokio::test]
async fn test_second_locker_waits_or_times_out() {
    let (address, _token) = start_server("127.0.0.1:0", Arc::new(CacheStore::new())).await;
    let a = client(&address, "a").await;
    let b = client(&address, "b").await;

    a.lock("m1", 1.0).await.unwrap();
    let err = b.lock("m1", 0.3).await.unwrap_err();
    match err {
        IcsError::LockTimeout { name, holder } => {
            assert_eq!(name, "m1");
            assert_eq!(holder, a.client_id());
        }
        other => panic!("unexpected error {other}"),
    }

    let waiter = tokio::spawn(async move { b.lock("m1", 5.0).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());
    a.unlock("m1").await.unwrap();
    waiter.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_callbacks_fire_across_clients() {
    let (address, _token) = start_server("127.0.0.1:0", Arc::new(CacheStore::new())).await;
    let writer = client(&address, "writer").await;
    let watcher = client(&address, "watcher").await;

    let (tx, mut rx) = mpsc::unbounded_channel::<CacheEntry>();
    watcher
        .add_callback(
            "m1/target",
            Arc::new(move |entry: &CacheEntry| {
                let _ = tx.send(entry.clone());
            }),
        )
        .await
        .unwrap();

    writer.put("m1/target", json!(3.0), 10.0, None).await.unwrap();
    let entry = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.value, json!(3.0));
    assert!(!entry.expired);

    writer.invalidate("m1/target").await.unwrap();
    let entry = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(entry.expired);
}

#[tokio::test]
async fn test_rewrite_redirects_reads_until_removed() {
    let (address, _token) = start_server("127.0.0.1:0", Arc::new(CacheStore::new())).await;
    let c = client(&address, "c").await;
    c.put("a/value", json!("own"), 1.0, None).await.unwrap();
    c.put("b/value", json!("target"), 2.0, None).await.unwrap();

    c.set_rewrite("a", "b").await.unwrap();
    assert_eq!(c.get_value("a/value", 0.0).await.unwrap(), Some(json!("target")));

    c.unset_rewrite("a").await.unwrap();
    assert_eq!(c.get_value("a/value", 0.0).await.unwrap(), Some(json!("own")));
}

#[tokio::test]
async fn test_clear_invalidates_device_keys() {
    let (address, _token) = start_server("127.0.0.1:0", Arc::new(CacheStore::new())).await;
    let c = client(&address, "c").await;
    c.put("m1/value", json!(1), 1.0, None).await.unwrap();
    c.put("m1/status", json!("ok"), 1.0, None).await.unwrap();
    c.put("m2/value", json!(2), 1.0, None).await.unwrap();
    c.clear("m1").await.unwrap();
    assert!(c.get("m1/value", 0.0).await.unwrap().is_none());
    assert!(c.get("m1/status", 0.0).await.unwrap().is_none());
    assert!(c.get("m2/value", 0.0).await.unwrap().is_some());
    let snapshot = c.snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 1);
}

#[tokio::test]
async fn test_disconnected_client_buffers_and_replays() {
    let store = Arc::new(CacheStore::new());
    let (address, token) = start_server("127.0.0.1:0", Arc::clone(&store)).await;
    let c = client(&address, "c").await;
    c.put("m1/value", json!(1.0), 1.0, None).await.unwrap();

    token.cancel();
    tokio::time::sleep(Duration::from_millis(200)).await;

    c.put("m1/value", json!(2.0), 2.0, None).await.unwrap();
    assert_eq!(c.pending_writes(), 1);
    let stale = c.get("m1/value", 0.0).await.unwrap().unwrap();
    assert!(stale.stale);
    assert_eq!(stale.value, json!(2.0));
    assert_eq!(store.get("m1/value", 0.0).unwrap().value, json!(1.0));

    let (_, _token) = start_server(&address, Arc::clone(&store)).await;
    let replayed = async {
        while c.pending_writes() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), replayed).await.unwrap();
    assert_eq!(store.get("m1/value", 0.0).unwrap().value, json!(2.0));
    let fresh = c.get("m1/value", 0.0).await.unwrap().unwrap();
    assert!(!fresh.stale);
}
