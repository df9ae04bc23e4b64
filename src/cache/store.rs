//! The authoritative cache database.
//!
//! Per key the store keeps the latest entry plus a history ordered by the
//! writers' own timestamps. An incoming write replaces the latest entry only
//! when its timestamp is not older; a late-arriving older write is slotted into
//! history at its place in time. Readers never see expired entries.
//!
//! Rewrites redirect reads (and subscriptions) of a key, or of a whole device
//! prefix, to another one. Writes always land on the key they name, so removing
//! a rewrite exposes the source key's own data again.

use super::entry::CacheEntry;
use super::persist::DayFileStore;
use super::{split_client_id, LockAttempt};
use crate::clock;
use crate::error::{AppResult, IcsError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::mpsc;

/// Entries kept per key before the oldest are dropped.
const MAX_HISTORY: usize = 100_000;

const DEFAULT_LOCK_TTL: f64 = 60.0;

#[derive(Default)]
struct KeyData {
    latest: Option<CacheEntry>,
    history: Vec<CacheEntry>,
}

#[derive(Default)]
struct StoreState {
    keys: HashMap<String, KeyData>,
    /// source -> target
    rewrites: HashMap<String, String>,
}

struct LockRecord {
    holder: String,
    expires: f64,
}

pub struct CacheStore {
    state: RwLock<StoreState>,
    locks: Mutex<HashMap<String, LockRecord>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<CacheEntry>>>,
    files: Option<DayFileStore>,
    lock_ttl: f64,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    /// Memory-only store.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            locks: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            files: None,
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    /// Store backed by day files under `dir`, replaying what is already there.
    pub fn open(dir: impl AsRef<Path>) -> AppResult<Self> {
        let files = DayFileStore::open(dir)?;
        let entries = files.load()?;
        let store = Self {
            files: Some(files),
            ..Self::new()
        };
        let count = entries.len();
        {
            let mut state = store.state.write();
            for entry in entries {
                Self::apply(&mut state, entry);
            }
        }
        tracing::info!(entries = count, "cache store replayed from disk");
        Ok(store)
    }

    /// Store seeded with `entries`, e.g. a snapshot taken elsewhere.
    pub fn from_entries(entries: impl IntoIterator<Item = CacheEntry>) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.write();
            for entry in entries {
                Self::apply(&mut state, entry);
            }
        }
        store
    }

    /// Lifetime of locks that are never released.
    pub fn with_lock_ttl(mut self, ttl: f64) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Receive a copy of every update and invalidation. Rewritten keys are
    /// delivered under their source name as well.
    pub fn listen(&self) -> mpsc::UnboundedReceiver<CacheEntry> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(tx);
        rx
    }

    fn notify(&self, entries: Vec<CacheEntry>) {
        if entries.is_empty() {
            return;
        }
        let mut listeners = self.listeners.lock();
        listeners.retain(|tx| entries.iter().all(|entry| tx.send(entry.clone()).is_ok()));
    }

    fn persist(&self, entry: &CacheEntry) {
        if let Some(files) = &self.files {
            if let Err(err) = files.append(entry) {
                tracing::error!(key = %entry.key, error = %err, "failed to persist cache entry");
            }
        }
    }

    /// Apply an entry without persisting or notifying. Returns the entries that
    /// became visible (empty if the write was older than the latest value).
    fn apply(state: &mut StoreState, entry: CacheEntry) -> Option<CacheEntry> {
        let data = state.keys.entry(entry.key.clone()).or_default();
        if entry.expired {
            return match &mut data.latest {
                Some(latest) if latest.time <= entry.time && !latest.expired => {
                    latest.expired = true;
                    Some(latest.clone())
                }
                _ => None,
            };
        }

        let pos = data.history.partition_point(|e| e.time <= entry.time);
        data.history.insert(pos, entry.clone());
        if data.history.len() > MAX_HISTORY {
            let excess = data.history.len() - MAX_HISTORY;
            data.history.drain(..excess);
        }

        let newer = data
            .latest
            .as_ref()
            .map_or(true, |latest| entry.time >= latest.time);
        if newer {
            data.latest = Some(entry.clone());
            Some(entry)
        } else {
            None
        }
    }

    /// Where reads of `key` are served from.
    fn resolve(state: &StoreState, key: &str) -> String {
        if let Some(target) = state.rewrites.get(key) {
            return target.clone();
        }
        if let Some((prefix, rest)) = key.split_once('/') {
            if let Some(target) = state.rewrites.get(prefix) {
                return format!("{}/{}", target, rest);
            }
        }
        key.to_string()
    }

    /// Keys that are redirected to `key` by a rewrite.
    fn aliases_of(state: &StoreState, key: &str) -> Vec<String> {
        state
            .rewrites
            .iter()
            .filter_map(|(source, target)| {
                if key == target {
                    Some(source.clone())
                } else {
                    key.strip_prefix(target.as_str())
                        .filter(|rest| rest.starts_with('/'))
                        .map(|rest| format!("{}{}", source, rest))
                }
            })
            .collect()
    }

    /// Entries to notify for a visible change of `entry.key`.
    fn fan_out(state: &StoreState, entry: &CacheEntry) -> Vec<CacheEntry> {
        let mut out = Vec::new();
        if Self::resolve(state, &entry.key) == entry.key {
            out.push(entry.clone());
        }
        for alias in Self::aliases_of(state, &entry.key) {
            out.push(entry.renamed(&alias));
        }
        out
    }

    /// Store a write. A `key@clientid` suffix is stripped.
    pub fn put(&self, mut entry: CacheEntry) {
        let (key, _) = split_client_id(&entry.key);
        entry.key = key.to_string();
        entry.stale = false;
        self.persist(&entry);
        let notify = {
            let mut state = self.state.write();
            match Self::apply(&mut state, entry) {
                Some(visible) => Self::fan_out(&state, &visible),
                None => Vec::new(),
            }
        };
        self.notify(notify);
    }

    pub fn get(&self, key: &str, mintime: f64) -> Option<CacheEntry> {
        let (key, _) = split_client_id(key);
        let now = clock::now();
        let state = self.state.read();
        let source = Self::resolve(&state, key);
        state
            .keys
            .get(&source)
            .and_then(|data| data.latest.as_ref())
            .filter(|entry| !entry.is_expired_at(now) && entry.time >= mintime)
            .map(|entry| entry.renamed(key))
    }

    pub fn invalidate(&self, key: &str) {
        let (key, _) = split_client_id(key);
        let notify = {
            let mut state = self.state.write();
            let marker = state
                .keys
                .get(key)
                .and_then(|data| data.latest.as_ref())
                .map(|latest| {
                    let mut marker = latest.clone();
                    marker.expired = true;
                    marker
                });
            match marker {
                Some(marker) => {
                    self.persist(&marker);
                    match Self::apply(&mut state, marker) {
                        Some(visible) => Self::fan_out(&state, &visible),
                        None => Vec::new(),
                    }
                }
                None => Vec::new(),
            }
        };
        self.notify(notify);
    }

    pub fn history(&self, key: &str, from: f64, to: f64) -> Vec<CacheEntry> {
        let (key, _) = split_client_id(key);
        let state = self.state.read();
        let source = Self::resolve(&state, key);
        match state.keys.get(&source) {
            Some(data) => {
                let start = data.history.partition_point(|e| e.time < from);
                data.history[start..]
                    .iter()
                    .take_while(|e| e.time <= to)
                    .map(|e| e.renamed(key))
                    .collect()
            }
            None => Vec::new(),
        }
    }

    pub fn set_rewrite(&self, key: &str, target: &str) -> AppResult<()> {
        if key.is_empty() || target.is_empty() || key == target {
            return Err(IcsError::Protocol(format!(
                "invalid rewrite '{}' -> '{}'",
                key, target
            )));
        }
        let notify = {
            let mut state = self.state.write();
            if Self::resolve(&state, target) == key {
                return Err(IcsError::Protocol(format!(
                    "rewrite '{}' -> '{}' would form a cycle",
                    key, target
                )));
            }
            state.rewrites.insert(key.to_string(), target.to_string());
            Self::visible_under(&state, key)
        };
        self.notify(notify);
        Ok(())
    }

    pub fn unset_rewrite(&self, key: &str) {
        let notify = {
            let mut state = self.state.write();
            if state.rewrites.remove(key).is_none() {
                return;
            }
            Self::visible_under(&state, key)
        };
        self.notify(notify);
    }

    /// Current live entries as seen under `key` (a full key or a prefix).
    fn visible_under(state: &StoreState, key: &str) -> Vec<CacheEntry> {
        let now = clock::now();
        let source = Self::resolve(state, key);
        state
            .keys
            .iter()
            .filter_map(|(stored, data)| {
                let suffix = if *stored == source {
                    ""
                } else {
                    stored
                        .strip_prefix(source.as_str())
                        .filter(|rest| rest.starts_with('/'))?
                };
                data.latest
                    .as_ref()
                    .filter(|e| !e.is_expired_at(now))
                    .map(|e| e.renamed(&format!("{}{}", key, suffix)))
            })
            .collect()
    }

    /// Invalidate `prefix` and every key below it; an empty prefix clears all.
    pub fn clear(&self, prefix: &str) {
        let keys: Vec<String> = {
            let state = self.state.read();
            state
                .keys
                .iter()
                .filter(|(key, data)| {
                    data.latest.as_ref().is_some_and(|e| !e.expired)
                        && (prefix.is_empty()
                            || key.as_str() == prefix
                            || key
                                .strip_prefix(prefix)
                                .is_some_and(|rest| rest.starts_with('/')))
                })
                .map(|(key, _)| key.clone())
                .collect()
        };
        for key in keys {
            self.invalidate(&key);
        }
    }

    /// All live latest entries under their stored keys.
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let now = clock::now();
        let state = self.state.read();
        let mut entries: Vec<CacheEntry> = state
            .keys
            .values()
            .filter_map(|data| data.latest.as_ref())
            .filter(|e| !e.is_expired_at(now))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Single lock attempt on behalf of `holder`. Re-locking by the same holder
    /// refreshes the lock; an expired lock is taken over.
    pub fn try_lock(&self, name: &str, holder: &str) -> LockAttempt {
        let now = clock::now();
        let mut locks = self.locks.lock();
        if let Some(record) = locks.get(name) {
            if record.holder != holder {
                if record.expires > now {
                    return LockAttempt::Held(record.holder.clone());
                }
                tracing::warn!(lock = %name, holder = %record.holder, "taking over expired lock");
            }
        }
        locks.insert(
            name.to_string(),
            LockRecord {
                holder: holder.to_string(),
                expires: now + self.lock_ttl,
            },
        );
        LockAttempt::Acquired
    }

    /// Release `name` if `holder` owns it. Returns false otherwise.
    pub fn unlock(&self, name: &str, holder: &str) -> bool {
        let mut locks = self.locks.lock();
        match locks.get(name) {
            Some(record) if record.holder == holder => {
                locks.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Current holder of `name`, if the lock is live.
    pub fn lock_holder(&self, name: &str) -> Option<String> {
        let now = clock::now();
        self.locks
            .lock()
            .get(name)
            .filter(|record| record.expires > now)
            .map(|record| record.holder.clone())
    }

    /// Drop every lock held by `holder` (client went away).
    pub fn release_locks_of(&self, holder: &str) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, record| record.holder != holder);
        before - locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn put(store: &CacheStore, key: &str, value: serde_json::Value, time: f64) {
        store.put(CacheEntry::new(key, value, time, None));
    }

    #[test]
    fn test_out_of_order_writes_keep_time_order() {
        let now = clock::now();
        let store = CacheStore::new();
        put(&store, "m1/value", json!(2), now - 1.0);
        put(&store, "m1/value", json!(1), now - 2.0);

        let history: Vec<_> = store
            .history("m1/value", 0.0, now)
            .into_iter()
            .map(|e| e.value)
            .collect();
        assert_eq!(history, vec![json!(1), json!(2)]);
        // the older write never replaces the newer latest value
        assert_eq!(store.get("m1/value", 0.0).unwrap().value, json!(2));
    }

    #[test]
    fn test_mintime_is_a_staleness_bound() {
        let store = CacheStore::new();
        put(&store, "m1/value", json!(5), 100.0);
        assert!(store.get("m1/value", 100.0).is_some());
        assert!(store.get("m1/value", 100.5).is_none());
    }

    #[test]
    fn test_ttl_expired_entry_reads_as_absent() {
        let store = CacheStore::new();
        store.put(CacheEntry::new("m1/value", json!(5), clock::now() - 10.0, Some(1.0)));
        assert!(store.get("m1/value", 0.0).is_none());
        assert!(store.snapshot().is_empty());
        assert_eq!(store.history("m1/value", 0.0, f64::MAX).len(), 1);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let now = clock::now();
        let store = CacheStore::new();
        put(&store, "m1/value", json!(1), now);
        put(&store, "m1/status", json!(2), now);
        put(&store, "m10/value", json!(3), now);
        store.invalidate("m1/value");
        assert!(store.get("m1/value", 0.0).is_none());
        store.clear("m1");
        assert!(store.get("m1/status", 0.0).is_none());
        assert!(store.get("m10/value", 0.0).is_some());
        store.clear("");
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_rewrite_and_restore() {
        let now = clock::now();
        let store = CacheStore::new();
        put(&store, "a/value", json!("own"), now);
        put(&store, "b/value", json!("target"), now);

        store.set_rewrite("a", "b").unwrap();
        let seen = store.get("a/value", 0.0).unwrap();
        assert_eq!(seen.value, json!("target"));
        assert_eq!(seen.key, "a/value");

        // writes still land on the named key
        put(&store, "a/value", json!("own2"), now + 1.0);
        assert_eq!(store.get("a/value", 0.0).unwrap().value, json!("target"));

        store.unset_rewrite("a");
        assert_eq!(store.get("a/value", 0.0).unwrap().value, json!("own2"));
    }

    #[test]
    fn test_rewrite_rejects_cycles() {
        let store = CacheStore::new();
        store.set_rewrite("a", "b").unwrap();
        assert!(store.set_rewrite("b", "a").is_err());
        assert!(store.set_rewrite("c", "c").is_err());
    }

    #[tokio::test]
    async fn test_listeners_see_rewritten_updates() {
        let store = CacheStore::new();
        store.set_rewrite("alias", "m1").unwrap();
        let mut rx = store.listen();
        put(&store, "m1/value", json!(7), clock::now());
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let mut keys = vec![first.key, second.key];
        keys.sort();
        assert_eq!(keys, vec!["alias/value", "m1/value"]);
    }

    #[test]
    fn test_lock_single_holder() {
        let store = CacheStore::new();
        assert_eq!(store.try_lock("m1", "a"), LockAttempt::Acquired);
        assert_eq!(store.try_lock("m1", "b"), LockAttempt::Held("a".into()));
        assert_eq!(store.try_lock("m1", "a"), LockAttempt::Acquired);
        assert!(!store.unlock("m1", "b"));
        assert!(store.unlock("m1", "a"));
        assert_eq!(store.try_lock("m1", "b"), LockAttempt::Acquired);
        assert_eq!(store.release_locks_of("b"), 1);
        assert_eq!(store.lock_holder("m1"), None);
    }

    #[test]
    fn test_expired_lock_is_taken_over() {
        let store = CacheStore::new().with_lock_ttl(-1.0);
        assert_eq!(store.try_lock("m1", "a"), LockAttempt::Acquired);
        assert_eq!(store.try_lock("m1", "b"), LockAttempt::Acquired);
    }

    #[test]
    fn test_client_id_suffix_is_stripped() {
        let store = CacheStore::new();
        put(&store, "m1/value@poller", json!(1), clock::now());
        assert!(store.get("m1/value", 0.0).is_some());
    }

    #[test]
    fn test_open_replays_day_files() {
        let dir = tempfile::tempdir().unwrap();
        let now = clock::now();
        {
            let store = CacheStore::open(dir.path()).unwrap();
            put(&store, "m1/value", json!(1), now - 5.0);
            put(&store, "m1/value", json!(2), now - 4.0);
            put(&store, "m1/status", json!(3), now - 3.0);
            store.invalidate("m1/status");
        }
        let store = CacheStore::open(dir.path()).unwrap();
        assert_eq!(store.get("m1/value", 0.0).unwrap().value, json!(2));
        assert!(store.get("m1/status", 0.0).is_none());
        assert_eq!(store.history("m1/value", 0.0, now).len(), 2);
    }
}
