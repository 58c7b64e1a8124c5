// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Content-addressed cache for transformed template text.
//!
//! Keys are fingerprints of the raw, pre-transform source, so a stale entry
//! can never be served for changed content and no invalidation protocol is
//! needed. Entries expire after a configurable TTL and are evicted LRU-first
//! once the capacity is reached.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
struct CacheEntry {
    text: String,
    stored_at: Instant,
}

/// LRU + TTL cache keyed by source fingerprint.
///
/// A capacity of zero disables caching entirely; `get` then always misses
/// and `put` is a no-op.
#[derive(Clone)]
pub struct FingerprintCache {
    inner: Option<Arc<Mutex<LruCache<String, CacheEntry>>>>,
    ttl: Duration,
}

impl FingerprintCache {
    /// Creates a cache holding at most `capacity` entries for up to `ttl`.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let inner = NonZeroUsize::new(capacity)
            .map(|cap| Arc::new(Mutex::new(LruCache::new(cap))));
        FingerprintCache { inner, ttl }
    }

    /// Hex-encoded SHA-256 of the raw source text.
    pub fn fingerprint(source: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    /// Whether caching is turned off (capacity zero).
    pub fn disabled(&self) -> bool {
        self.inner.is_none()
    }

    /// Looks up the transformed text for `key`, refreshing its recency.
    /// Expired entries are dropped on access.
    pub fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.as_ref()?;
        let mut cache = inner.lock().ok()?;
        let expired = match cache.get(key) {
            Some(entry) if entry.stored_at.elapsed() <= self.ttl => {
                return Some(entry.text.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            cache.pop(key);
            tracing::debug!(key, "cache entry expired");
        }
        None
    }

    /// Stores transformed text under `key`, evicting LRU entries as needed.
    pub fn put(&self, key: String, text: String) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        if let Ok(mut cache) = inner.lock() {
            cache.put(
                key,
                CacheEntry {
                    text,
                    stored_at: Instant::now(),
                },
            );
        }
    }

    /// Drops every cached entry.
    pub fn clear(&self) {
        if let Some(inner) = self.inner.as_ref() {
            if let Ok(mut cache) = inner.lock() {
                cache.clear();
            }
        }
    }

    /// Number of live entries, expired or not.
    pub fn len(&self) -> usize {
        self.inner
            .as_ref()
            .and_then(|inner| inner.lock().ok().map(|cache| cache.len()))
            .unwrap_or(0)
    }

    /// Whether the cache currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FingerprintCache {
    fn default() -> Self {
        FingerprintCache::new(256, Duration::from_secs(300))
    }
}
