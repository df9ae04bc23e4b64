//! Shared key/value/time/ttl cache.
//!
//! Every process (daemon, poller children, monitors) synchronises device state
//! through the cache. A key is a hierarchical string, usually
//! `"<device>/<parameter>"`; values are JSON documents stamped with the writer's
//! timestamp and an optional time-to-live.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────┐      line protocol       ┌──────────────┐
//!   │ CacheClient  │ ◄──────── TCP ─────────► │ CacheServer  │
//!   └──────┬───────┘                          └──────┬───────┘
//!          │ impl Cache                              │
//!   ┌──────┴───────┐                          ┌──────┴───────┐
//!   │  LocalCache  │ ─────── Arc<..> ───────► │  CacheStore  │ ──► day files
//!   └──────────────┘                          └──────────────┘
//! ```
//!
//! [`CacheStore`] is the authoritative database. [`LocalCache`] exposes it
//! in-process (servers, simulations, tests) and [`CacheClient`] exposes a remote
//! store. Both implement the [`Cache`] trait, which is all the device layer and
//! the poller ever see.
//!
//! Writes are ordered per key by their own timestamp; the latest value is the
//! one with the highest timestamp (last write wins), older writes only enter the
//! history. There is no ordering across keys. Callers needing mutual exclusion
//! use the advisory [`Cache::lock`]; plain `get`/`put` ignore locks.

pub mod callbacks;
pub mod client;
pub mod entry;
pub mod local;
pub mod persist;
pub mod server;
pub mod store;
pub mod wire;

pub use callbacks::{CallbackId, CallbackRegistry, UpdateCallback};
pub use client::CacheClient;
pub use entry::CacheEntry;
pub use local::LocalCache;
pub use server::CacheServer;
pub use store::CacheStore;

use crate::error::{AppResult, IcsError};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Lock acquisition polls at most this often.
const LOCK_RETRY_MAX: f64 = 0.3;
const LOCK_RETRY_MIN: f64 = 0.02;

/// Outcome of a single non-blocking lock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    /// Held by somebody else.
    Held(String),
}

/// Operations every cache front-end provides.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Identifier of this client, used as lock holder and writer tag.
    fn client_id(&self) -> &str;

    /// Latest live entry of `key`, or `None` if absent, expired, or older than
    /// `mintime`.
    async fn get(&self, key: &str, mintime: f64) -> AppResult<Option<CacheEntry>>;

    async fn put(&self, key: &str, value: Value, time: f64, ttl: Option<f64>) -> AppResult<()>;

    /// Mark the latest value of `key` as expired.
    async fn invalidate(&self, key: &str) -> AppResult<()>;

    /// Entries of `key` with `from <= time <= to`, ordered by timestamp.
    async fn history(&self, key: &str, from: f64, to: f64) -> AppResult<Vec<CacheEntry>>;

    /// Register `callback` for updates and invalidations of `key`.
    async fn add_callback(&self, key: &str, callback: UpdateCallback) -> AppResult<CallbackId>;

    async fn remove_callback(&self, id: CallbackId) -> AppResult<()>;

    /// One non-blocking lock attempt.
    async fn try_lock(&self, name: &str) -> AppResult<LockAttempt>;

    async fn unlock(&self, name: &str) -> AppResult<()>;

    /// Redirect reads and subscriptions of `key` (a full key or a device
    /// prefix) to `target`.
    async fn set_rewrite(&self, key: &str, target: &str) -> AppResult<()>;

    async fn unset_rewrite(&self, key: &str) -> AppResult<()>;

    /// Invalidate `prefix` itself and every key below `prefix/`.
    async fn clear(&self, prefix: &str) -> AppResult<()>;

    async fn clear_all(&self) -> AppResult<()>;

    /// All live latest entries.
    async fn snapshot(&self) -> AppResult<Vec<CacheEntry>>;

    /// Acquire `name`, retrying with bounded backoff for up to `timeout` seconds.
    async fn lock(&self, name: &str, timeout: f64) -> AppResult<()> {
        acquire_with_backoff(name, timeout, || self.try_lock(name)).await
    }

    /// Value of the latest live entry, decoded as JSON.
    async fn get_value(&self, key: &str, mintime: f64) -> AppResult<Option<Value>> {
        Ok(self.get(key, mintime).await?.map(|entry| entry.value))
    }
}

/// Retry `attempt` until it acquires the lock or `timeout` seconds elapse.
///
/// The wait between attempts starts small and doubles up to
/// [`LOCK_RETRY_MAX`], so an uncontended lock costs a single round trip and a
/// contended one never spins.
pub async fn acquire_with_backoff<F, Fut>(name: &str, timeout: f64, mut attempt: F) -> AppResult<()>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = AppResult<LockAttempt>> + Send,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(timeout.max(0.0));
    let mut delay = LOCK_RETRY_MIN;
    loop {
        let holder = match attempt().await? {
            LockAttempt::Acquired => return Ok(()),
            LockAttempt::Held(holder) => holder,
        };
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(IcsError::LockTimeout {
                name: name.to_string(),
                holder,
            });
        }
        let remaining = (deadline - now).as_secs_f64();
        tokio::time::sleep(Duration::from_secs_f64(delay.min(remaining))).await;
        delay = (delay * 2.0).min(LOCK_RETRY_MAX);
    }
}

/// Run `f` while holding the advisory lock `name`; the lock is released whether
/// `f` succeeds or fails.
pub async fn with_lock<C, F, Fut, T>(cache: &C, name: &str, timeout: f64, f: F) -> AppResult<T>
where
    C: Cache + ?Sized,
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = AppResult<T>> + Send,
    T: Send,
{
    cache.lock(name, timeout).await?;
    let result = f().await;
    let released = cache.unlock(name).await;
    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), released) => {
            if let Err(unlock_err) = released {
                tracing::warn!(lock = %name, error = %unlock_err, "failed to release lock");
            }
            Err(err)
        }
    }
}

/// Split a `key@clientid` into its key and optional client id.
pub fn split_client_id(key: &str) -> (&str, Option<&str>) {
    match key.rsplit_once('@') {
        Some((key, client)) if !client.is_empty() => (key, Some(client)),
        _ => (key, None),
    }
}

/// Device part of a key (the first path segment, lowercased).
pub fn device_of(key: &str) -> String {
    key.split('/').next().unwrap_or(key).to_lowercase()
}
