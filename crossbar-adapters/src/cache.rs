//! Two-level cache for model catalogs and idempotent probe results.
//!
//! A small LRU front absorbs the hot keys; a larger TTL map behind it
//! holds everything else. Entries carry their own expiry, so a hit is
//! always fresh. Payloads are JSON values; callers keep their own types.

use dashmap::DashMap;
use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CachedEntry {
    value: Value,
    expires_at: Instant,
}

impl CachedEntry {
    fn new(value: Value, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// LRU front + TTL map behind.
pub struct CatalogCache {
    front: Mutex<LruCache<String, CachedEntry>>,
    back: DashMap<String, CachedEntry>,
    default_ttl: Duration,
}

impl CatalogCache {
    pub fn new(front_capacity: usize, default_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(front_capacity.max(1)).expect("capacity is non-zero");
        Self {
            front: Mutex::new(LruCache::new(capacity)),
            back: DashMap::new(),
            default_ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        {
            let mut front = self.front.lock().expect("cache lock poisoned");
            if let Some(entry) = front.get(key) {
                if !entry.is_expired() {
                    return Some(entry.value.clone());
                }
                front.pop(key);
            }
        }

        let entry = self.back.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.back.remove(key);
            return None;
        }
        let value = entry.value.clone();
        drop(entry);

        // Promote to the front on a back hit.
        let promoted = CachedEntry {
            value: value.clone(),
            expires_at: Instant::now() + self.default_ttl,
        };
        self.front
            .lock()
            .expect("cache lock poisoned")
            .put(key.to_string(), promoted);
        Some(value)
    }

    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let entry = CachedEntry::new(value, ttl);
        self.front
            .lock()
            .expect("cache lock poisoned")
            .put(key.to_string(), entry.clone());
        self.back.insert(key.to_string(), entry);
    }

    pub fn invalidate(&self, key: &str) {
        self.front.lock().expect("cache lock poisoned").pop(key);
        self.back.remove(key);
    }

    /// Drop every key with the given prefix. Used when a provider is
    /// edited or marked unhealthy.
    pub fn invalidate_prefix(&self, prefix: &str) {
        {
            let mut front = self.front.lock().expect("cache lock poisoned");
            let doomed: Vec<String> = front
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                front.pop(&key);
            }
        }
        self.back.retain(|k, _| !k.starts_with(prefix));
    }

    /// Sweep expired entries out of the back map.
    pub fn evict_expired(&self) {
        self.back.retain(|_, entry| !entry.is_expired());
    }

    pub fn len(&self) -> usize {
        self.back.len()
    }

    pub fn is_empty(&self) -> bool {
        self.back.is_empty()
    }
}
