//! Sharded in-memory response store with TTL expiry and LRU eviction.
//!
//! Each shard is an [`lru::LruCache`] behind its own mutex; a hit refreshes
//! recency and eviction pops from the cold end until both the entry and byte
//! budgets fit.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cache::policy::CacheKey;
use crate::config::CacheConfig;
use crate::lifecycle::Shutdown;
use crate::proto::response::ResponseHead;

/// A stored response, replayed verbatim on a hit.
#[derive(Debug)]
pub struct CachedResponse {
    pub head: ResponseHead,
    /// Body exactly as relayed from the origin (chunked framing included).
    pub body: Bytes,
    pub stored_at: Instant,
    pub expires_at: Instant,
}

impl CachedResponse {
    /// Serialize for a client, with our own `Connection` header.
    pub fn to_client_bytes(&self, keep_alive: bool) -> Vec<u8> {
        let mut out = self.head.to_client_bytes(keep_alive);
        out.extend_from_slice(&self.body);
        out
    }

    fn size(&self, key: &CacheKey) -> usize {
        key.len() + self.head.to_raw_bytes().len() + self.body.len()
    }
}

/// Counters since startup plus current occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub entries: usize,
    pub bytes: usize,
}

#[derive(Debug)]
struct Slot {
    response: Arc<CachedResponse>,
    size: usize,
}

/// One lock's worth of entries, kept in recency order.
#[derive(Debug)]
struct Shard {
    entries: LruCache<CacheKey, Slot>,
    bytes: usize,
}

impl Shard {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            bytes: 0,
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Slot> {
        let slot = self.entries.pop(key)?;
        self.bytes -= slot.size;
        Some(slot)
    }

    fn remove_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, slot)| slot.response.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn evict_lru(&mut self) -> bool {
        match self.entries.pop_lru() {
            Some((_, slot)) => {
                self.bytes -= slot.size;
                true
            }
            None => false,
        }
    }
}

/// Bounded response cache shared by every connection handler.
#[derive(Debug)]
pub struct ResponseCache {
    shards: Vec<Mutex<Shard>>,
    max_entries_per_shard: usize,
    max_bytes_per_shard: usize,
    max_entry_bytes: usize,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        let shard_count = config.shards.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(Shard::new())).collect(),
            max_entries_per_shard: (config.max_entries / shard_count).max(1),
            max_bytes_per_shard: config.max_bytes / shard_count,
            max_entry_bytes: config.max_entry_bytes,
            default_ttl: config.ttl(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Largest body worth capturing for insertion.
    pub fn max_entry_bytes(&self) -> usize {
        self.max_entry_bytes
    }

    /// Fetch a live entry. Expired entries are removed, never returned.
    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<CachedResponse>> {
        let now = Instant::now();
        let mut shard = self.shard(key);
        let found = shard
            .entries
            .get(key)
            .map(|slot| Arc::clone(&slot.response));
        match found {
            Some(response) if response.expires_at > now => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(response);
            }
            Some(_) => {
                shard.remove(key);
            }
            None => {}
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a response for `ttl`. Returns `false` if it was too large.
    pub fn insert(&self, key: CacheKey, head: ResponseHead, body: Bytes, ttl: Duration) -> bool {
        let now = Instant::now();
        let response = CachedResponse {
            head,
            body,
            stored_at: now,
            expires_at: now + ttl,
        };
        let size = response.size(&key);
        if response.body.len() > self.max_entry_bytes || size > self.max_bytes_per_shard {
            return false;
        }

        let mut shard = self.shard(&key);
        shard.remove(&key);

        let mut evicted = 0;
        if shard.entries.len() >= self.max_entries_per_shard
            || shard.bytes + size > self.max_bytes_per_shard
        {
            evicted += shard.remove_expired(now);
        }
        while shard.entries.len() >= self.max_entries_per_shard
            || shard.bytes + size > self.max_bytes_per_shard
        {
            if !shard.evict_lru() {
                break;
            }
            evicted += 1;
        }

        shard.bytes += size;
        shard.entries.put(
            key,
            Slot {
                response: Arc::new(response),
                size,
            },
        );
        drop(shard);

        self.insertions.fetch_add(1, Ordering::Relaxed);
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        true
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let removed: usize = self
            .shards
            .iter()
            .map(|shard| lock(shard).remove_expired(now))
            .sum();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Run [`sweep`](Self::sweep) every `interval` until shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, shutdown: Shutdown) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "Swept expired cache entries");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, bytes) = self.shards.iter().fold((0, 0), |(entries, bytes), shard| {
            let shard = lock(shard);
            (entries + shard.entries.len(), bytes + shard.bytes)
        });
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries,
            bytes,
        }
    }

    fn shard(&self, key: &CacheKey) -> MutexGuard<'_, Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        lock(&self.shards[index])
    }
}

fn lock(shard: &Mutex<Shard>) -> MutexGuard<'_, Shard> {
    shard.lock().unwrap_or_else(PoisonError::into_inner)
}
