//! TTL cache for extractor metadata and finished task results.
//!
//! Expiry is checked on read: an entry past its `expires_at` is a miss and
//! is dropped at that point. A miss is ordinary control flow, never an
//! error, and a value that no longer deserializes is also reported as a miss.
//! Media files are never cached here.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::clock::{SharedClock, duration_ms};
use crate::config::CacheTtlConfig;

/// Entry classes, each with its own TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheClass {
    /// Extractor format lists keyed by URL.
    Formats,
    /// Final task results keyed by task id.
    Result,
}

impl CacheClass {
    fn prefix(self) -> &'static str {
        match self {
            Self::Formats => "formats",
            Self::Result => "result",
        }
    }
}

/// Derives a stable key from the entry class and its identifying input.
#[must_use]
pub fn cache_key(class: CacheClass, input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{}:{hex}", class.prefix())
}

/// Backing key/value store with per-entry TTL.
pub trait CacheStore: Send + Sync + fmt::Debug {
    /// Returns the live value for `key`, or `None` on miss or expiry.
    fn get(&self, key: &str) -> Option<String>;

    /// Stores `value` with a fresh expiry `ttl` from now.
    fn set(&self, key: &str, value: String, ttl: Duration);

    fn remove(&self, key: &str);

    /// Drops expired entries; returns how many were removed.
    fn purge_expired(&self) -> usize;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: i64,
}

/// In-process store on a concurrent map.
#[derive(Debug)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    clock: SharedClock,
}

impl MemoryCache {
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        let now = self.clock.now_ms();
        {
            let entry = self.entries.get(key)?;
            if now < entry.expires_at {
                return Some(entry.value.clone());
            }
        }
        // Only drop it if no writer refreshed it meanwhile.
        self.entries.remove_if(key, |_, entry| now >= entry.expires_at);
        None
    }

    fn set(&self, key: &str, value: String, ttl: Duration) {
        let expires_at = self.clock.now_ms().saturating_add(duration_ms(ttl));
        self.entries
            .insert(key.to_string(), CacheEntry { value, expires_at });
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.expires_at);
        before.saturating_sub(self.entries.len())
    }
}

/// Typed facade applying the configured TTL per class.
#[derive(Debug, Clone)]
pub struct Cache {
    store: Arc<dyn CacheStore>,
    formats_ttl: Duration,
    result_ttl: Duration,
}

impl Cache {
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, ttls: &CacheTtlConfig) -> Self {
        Self {
            store,
            formats_ttl: Duration::from_secs(ttls.formats_secs),
            result_ttl: Duration::from_secs(ttls.result_secs),
        }
    }

    /// In-memory cache with the given TTLs.
    #[must_use]
    pub fn in_memory(clock: SharedClock, ttls: &CacheTtlConfig) -> Self {
        Self::new(Arc::new(MemoryCache::new(clock)), ttls)
    }

    #[must_use]
    pub fn ttl(&self, class: CacheClass) -> Duration {
        match class {
            CacheClass::Formats => self.formats_ttl,
            CacheClass::Result => self.result_ttl,
        }
    }

    /// Looks up and deserializes a value. Every failure mode is a miss.
    #[must_use]
    pub fn get<T: DeserializeOwned>(&self, class: CacheClass, input: &str) -> Option<T> {
        let key = cache_key(class, input);
        let Some(raw) = self.store.get(&key) else {
            debug!(class = class.prefix(), "cache miss");
            return None;
        };
        match serde_json::from_str(&raw) {
            Ok(value) => {
                debug!(class = class.prefix(), "cache hit");
                Some(value)
            }
            Err(error) => {
                warn!(class = class.prefix(), error = %error, "discarding undecodable cache entry");
                self.store.remove(&key);
                None
            }
        }
    }

    /// Serializes and stores a value under the class TTL. A zero TTL disables caching.
    pub fn set<T: Serialize>(&self, class: CacheClass, input: &str, value: &T) {
        let ttl = self.ttl(class);
        if ttl.is_zero() {
            return;
        }
        match serde_json::to_string(value) {
            Ok(raw) => self.store.set(&cache_key(class, input), raw, ttl),
            Err(error) => warn!(class = class.prefix(), error = %error, "value not cacheable"),
        }
    }

    pub fn invalidate(&self, class: CacheClass, input: &str) {
        self.store.remove(&cache_key(class, input));
    }

    /// Drops expired entries from the backing store.
    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }
}
