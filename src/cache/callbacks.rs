//! Subscription callbacks.
//!
//! Callbacks are invoked from a dispatcher task, never from the writer, and a
//! panicking callback is logged and otherwise ignored.

use super::entry::CacheEntry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Function called with every update or invalidation of a subscribed key.
pub type UpdateCallback = Arc<dyn Fn(&CacheEntry) + Send + Sync>;

/// Handle returned by [`Cache::add_callback`](super::Cache::add_callback).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

#[derive(Default)]
pub struct CallbackRegistry {
    next_id: AtomicU64,
    by_key: RwLock<HashMap<String, Vec<(CallbackId, UpdateCallback)>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. The flag is true when `key` had no callback before.
    pub fn add(&self, key: &str, callback: UpdateCallback) -> (CallbackId, bool) {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut by_key = self.by_key.write();
        let list = by_key.entry(key.to_string()).or_default();
        let first = list.is_empty();
        list.push((id, callback));
        (id, first)
    }

    /// Remove a callback, returning its key and whether it was the last one.
    pub fn remove(&self, id: CallbackId) -> Option<(String, bool)> {
        let mut by_key = self.by_key.write();
        let key = by_key
            .iter()
            .find(|(_, list)| list.iter().any(|(cid, _)| *cid == id))
            .map(|(key, _)| key.clone())?;
        let last = match by_key.get_mut(&key) {
            Some(list) => {
                list.retain(|(cid, _)| *cid != id);
                list.is_empty()
            }
            None => false,
        };
        if last {
            by_key.remove(&key);
        }
        Some((key, last))
    }

    /// Keys that currently have at least one callback.
    pub fn keys(&self) -> Vec<String> {
        self.by_key.read().keys().cloned().collect()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.by_key.read().contains_key(key)
    }

    /// Invoke every callback registered for `entry.key`.
    pub fn dispatch(&self, entry: &CacheEntry) {
        let callbacks: Vec<UpdateCallback> = match self.by_key.read().get(&entry.key) {
            Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return,
        };
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(entry))).is_err() {
                tracing::warn!(key = %entry.key, "cache callback panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_add_remove_tracks_first_and_last() {
        let registry = CallbackRegistry::new();
        let (a, first) = registry.add("m1/value", Arc::new(|_| {}));
        assert!(first);
        let (b, first) = registry.add("m1/value", Arc::new(|_| {}));
        assert!(!first);
        assert_eq!(registry.remove(a), Some(("m1/value".to_string(), false)));
        assert_eq!(registry.remove(b), Some(("m1/value".to_string(), true)));
        assert_eq!(registry.remove(b), None);
        assert!(!registry.has_key("m1/value"));
    }

    #[test]
    fn test_panicking_callback_does_not_stop_others() {
        let registry = CallbackRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.add("m1/value", Arc::new(|_| panic!("boom")));
        let counter = Arc::clone(&hits);
        registry.add(
            "m1/value",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        registry.dispatch(&CacheEntry::new("m1/value", json!(1), 1.0, None));
        registry.dispatch(&CacheEntry::new("m2/value", json!(1), 1.0, None));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
