//! Lookup cache for non-sensitive data.
//!
//! The engine caches serialized public key bundles only. Private keys and
//! derived secrets never pass through this interface.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Generic cache collaborator
#[async_trait]
pub trait LookupCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration);

    async fn invalidate(&self, key: &str);
}

const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Cache key for a public key bundle
pub fn public_key_entry(key_id: &str) -> String {
    format!("pubkey:{}", key_id)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

struct CacheEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Most recently used at the back
    access_order: VecDeque<String>,
}

impl CacheState {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.access_order.iter().position(|k| k == key) {
            if let Some(k) = self.access_order.remove(pos) {
                self.access_order.push_back(k);
            }
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_some() {
            if let Some(pos) = self.access_order.iter().position(|k| k == key) {
                self.access_order.remove(pos);
            }
            true
        } else {
            false
        }
    }
}

/// In-process TTL + LRU cache
pub struct MemoryCache {
    capacity: usize,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(CacheState {
                entries: HashMap::with_capacity(capacity),
                access_order: VecDeque::with_capacity(capacity),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.state.lock().entries.len(),
        }
    }

    fn get_at(&self, key: &str, now: Instant) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        let found = state
            .entries
            .get(key)
            .map(|entry| (entry.expires_at > now, entry.value.clone()));

        match found {
            Some((true, value)) => {
                state.touch(key);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Some((false, _)) => {
                state.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn put_at(&self, key: &str, value: Vec<u8>, ttl: Duration, now: Instant) {
        let mut state = self.state.lock();
        let expires_at = now.checked_add(ttl).unwrap_or(now + MAX_TTL);

        if let Some(entry) = state.entries.get_mut(key) {
            entry.value = value;
            entry.expires_at = expires_at;
            state.touch(key);
            return;
        }

        if state.entries.len() >= self.capacity {
            // Drop expired entries first, then the least recently used
            let expired: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(k, _)| k.clone())
                .collect();
            for k in &expired {
                state.remove(k);
            }
            self.evictions.fetch_add(expired.len() as u64, Ordering::Relaxed);

            while state.entries.len() >= self.capacity {
                match state.access_order.pop_front() {
                    Some(lru) => {
                        state.entries.remove(&lru);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                }
            }
        }

        state.entries.insert(key.to_string(), CacheEntry { value, expires_at });
        state.access_order.push_back(key.to_string());
    }
}

#[async_trait]
impl LookupCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.get_at(key, Instant::now())
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.put_at(key, value, ttl, Instant::now());
    }

    async fn invalidate(&self, key: &str) {
        self.state.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_miss() {
        let cache = MemoryCache::new(4);
        let now = Instant::now();
        cache.put_at("pubkey:a", vec![1, 2], Duration::from_secs(60), now);

        assert_eq!(cache.get_at("pubkey:a", now), Some(vec![1, 2]));
        assert_eq!(cache.get_at("pubkey:b", now), None);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 1, 1));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = MemoryCache::new(4);
        let now = Instant::now();
        cache.put_at("k", vec![9], Duration::from_secs(5), now);

        assert!(cache.get_at("k", now + Duration::from_secs(4)).is_some());
        assert!(cache.get_at("k", now + Duration::from_secs(5)).is_none());
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = MemoryCache::new(2);
        let now = Instant::now();
        let ttl = Duration::from_secs(60);

        cache.put_at("a", vec![1], ttl, now);
        cache.put_at("b", vec![2], ttl, now);
        cache.get_at("a", now);
        cache.put_at("c", vec![3], ttl, now);

        assert!(cache.get_at("a", now).is_some());
        assert!(cache.get_at("b", now).is_none());
        assert!(cache.get_at("c", now).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = MemoryCache::new(2);
        cache.put(&public_key_entry("key-1"), vec![7; 64], Duration::from_secs(60)).await;
        assert!(cache.get("pubkey:key-1").await.is_some());

        cache.invalidate("pubkey:key-1").await;
        assert!(cache.get("pubkey:key-1").await.is_none());
    }
}
