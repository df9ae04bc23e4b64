//! In-process [`Cache`] front-end over a shared [`CacheStore`].

use super::{Cache, CacheEntry, CacheStore, CallbackId, CallbackRegistry, LockAttempt, UpdateCallback};
use crate::error::AppResult;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Direct access to a store living in the same process.
///
/// Used by the cache server itself, by dry-run simulations (over a snapshot
/// store) and in tests. Must be created inside a tokio runtime: callbacks are
/// run by a dispatcher task fed from the store's update stream.
///
/// ```
/// use rust_ics::cache::{Cache, LocalCache};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let cache = LocalCache::in_memory();
/// cache.put("m1/value", json!(1.5), 100.0, None).await.unwrap();
/// assert_eq!(cache.get_value("m1/value", 0.0).await.unwrap(), Some(json!(1.5)));
/// // nothing written after t=200
/// assert!(cache.get("m1/value", 200.0).await.unwrap().is_none());
/// # });
/// ```
pub struct LocalCache {
    id: String,
    store: Arc<CacheStore>,
    callbacks: Arc<CallbackRegistry>,
    dispatcher: JoinHandle<()>,
}

impl LocalCache {
    pub fn new(store: Arc<CacheStore>) -> Self {
        let id = format!("local-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        Self::with_id(store, id)
    }

    pub fn with_id(store: Arc<CacheStore>, id: impl Into<String>) -> Self {
        let callbacks = Arc::new(CallbackRegistry::new());
        let mut updates = store.listen();
        let registry = Arc::clone(&callbacks);
        let dispatcher = tokio::spawn(async move {
            while let Some(entry) = updates.recv().await {
                registry.dispatch(&entry);
            }
        });
        Self {
            id: id.into(),
            store,
            callbacks,
            dispatcher,
        }
    }

    /// Fresh memory-only store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(CacheStore::new()))
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }
}

impl Drop for LocalCache {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

#[async_trait]
impl Cache for LocalCache {
    fn client_id(&self) -> &str {
        &self.id
    }

    async fn get(&self, key: &str, mintime: f64) -> AppResult<Option<CacheEntry>> {
        Ok(self.store.get(key, mintime))
    }

    async fn put(&self, key: &str, value: Value, time: f64, ttl: Option<f64>) -> AppResult<()> {
        self.store.put(CacheEntry::new(key, value, time, ttl));
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> AppResult<()> {
        self.store.invalidate(key);
        Ok(())
    }

    async fn history(&self, key: &str, from: f64, to: f64) -> AppResult<Vec<CacheEntry>> {
        Ok(self.store.history(key, from, to))
    }

    async fn add_callback(&self, key: &str, callback: UpdateCallback) -> AppResult<CallbackId> {
        Ok(self.callbacks.add(key, callback).0)
    }

    async fn remove_callback(&self, id: CallbackId) -> AppResult<()> {
        self.callbacks.remove(id);
        Ok(())
    }

    async fn try_lock(&self, name: &str) -> AppResult<LockAttempt> {
        Ok(self.store.try_lock(name, &self.id))
    }

    async fn unlock(&self, name: &str) -> AppResult<()> {
        if !self.store.unlock(name, &self.id) {
            tracing::warn!(lock = %name, client = %self.id, "unlock of a lock not held");
        }
        Ok(())
    }

    async fn set_rewrite(&self, key: &str, target: &str) -> AppResult<()> {
        self.store.set_rewrite(key, target)
    }

    async fn unset_rewrite(&self, key: &str) -> AppResult<()> {
        self.store.unset_rewrite(key);
        Ok(())
    }

    async fn clear(&self, prefix: &str) -> AppResult<()> {
        self.store.clear(prefix);
        Ok(())
    }

    async fn clear_all(&self) -> AppResult<()> {
        self.store.clear("");
        Ok(())
    }

    async fn snapshot(&self) -> AppResult<Vec<CacheEntry>> {
        Ok(self.store.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::with_lock;
    use crate::clock;
    use crate::error::IcsError;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_callbacks_fire_for_puts_and_invalidations() {
        let cache = LocalCache::in_memory();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = cache
            .add_callback(
                "m1/value",
                Arc::new(move |entry: &CacheEntry| {
                    let _ = tx.send((entry.value.clone(), entry.expired));
                }),
            )
            .await
            .unwrap();

        cache.put("m1/value", json!(3), clock::now(), None).await.unwrap();
        cache.invalidate("m1/value").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), (json!(3), false));
        assert_eq!(rx.recv().await.unwrap(), (json!(3), true));

        cache.remove_callback(id).await.unwrap();
        cache.put("m1/value", json!(4), clock::now(), None).await.unwrap();
        let late = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(!matches!(late, Ok(Some(_))));
    }

    #[tokio::test]
    async fn test_two_clients_share_a_store() {
        let store = Arc::new(CacheStore::new());
        let a = LocalCache::with_id(Arc::clone(&store), "a");
        let b = LocalCache::with_id(Arc::clone(&store), "b");
        a.put("m1/target", json!(10.0), clock::now(), None).await.unwrap();
        assert_eq!(b.get_value("m1/target", 0.0).await.unwrap(), Some(json!(10.0)));

        a.lock("m1", 1.0).await.unwrap();
        let err = b.lock("m1", 0.1).await.unwrap_err();
        assert!(matches!(err, IcsError::LockTimeout { ref holder, .. } if holder == "a"));
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let cache = LocalCache::in_memory();
        let result: AppResult<()> = with_lock(&cache, "m1", 1.0, || async {
            Err(IcsError::comm("m1", "offline"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(cache.store().lock_holder("m1"), None);
    }
}
