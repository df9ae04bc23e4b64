use crate::clock;
use crate::error::{AppResult, IcsError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One stored value of a key.
///
/// Mirrors the binary entry schema `{key, time, ttl, expired, value}`.
/// `expired` is the explicit invalidation flag; an entry whose ttl has run out
/// is expired as well even when the flag is not set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub time: f64,
    pub ttl: Option<f64>,
    #[serde(default)]
    pub expired: bool,
    pub value: Value,
    /// Served from a disconnected client's last known state.
    #[serde(skip)]
    pub stale: bool,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: Value, time: f64, ttl: Option<f64>) -> Self {
        Self {
            key: key.into(),
            time,
            ttl,
            expired: false,
            value,
            stale: false,
        }
    }

    /// Whether the entry counts as absent at time `now`.
    pub fn is_expired_at(&self, now: f64) -> bool {
        self.expired || self.ttl.is_some_and(|ttl| ttl > 0.0 && self.time + ttl < now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(clock::now())
    }

    /// Same entry under a different key (used for rewritten reads).
    pub fn renamed(&self, key: &str) -> Self {
        let mut entry = self.clone();
        entry.key = key.to_string();
        entry
    }

    /// Decode the value into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> AppResult<T> {
        serde_json::from_value(self.value.clone()).map_err(|err| {
            IcsError::Json(format!("cache key '{}': {}", self.key, err))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ttl_expiry() {
        let entry = CacheEntry::new("m1/value", json!(1.5), 100.0, Some(10.0));
        assert!(!entry.is_expired_at(105.0));
        assert!(entry.is_expired_at(111.0));
        let forever = CacheEntry::new("m1/value", json!(1.5), 100.0, None);
        assert!(!forever.is_expired_at(1e12));
    }

    #[test]
    fn test_decode() {
        let entry = CacheEntry::new("m1/abslimits", json!([-5.0, 5.0]), 1.0, None);
        let limits: (f64, f64) = entry.decode().unwrap();
        assert_eq!(limits, (-5.0, 5.0));
        assert!(entry.decode::<String>().is_err());
    }
}
