//! Physical storage of completed entries.

use crate::arena::{Arena, Handle};
use crate::error::CacheError;
use crate::headers::ResponseHeaders;
use crate::key::Key;
use crate::lookup::ResponseMetadata;
use crate::sharded::{Sharded, NUM_SHARDS};
use bytes::Bytes;
use http::header::{self, HeaderName};
use http::HeaderMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A complete response as stored.
#[derive(Clone, Debug)]
pub struct StoredEntry {
    pub headers: ResponseHeaders,
    pub metadata: ResponseMetadata,
    pub body: Bytes,
    pub trailers: Option<HeaderMap>,
}

/// Headers a validation response never overwrites.
const PRESERVED_ON_UPDATE: [HeaderName; 4] = [
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::ETAG,
    header::VARY,
];

impl StoredEntry {
    /// Apply headers from a successful validation. The stored `Age` is
    /// replaced by the update's (or dropped).
    pub fn apply_header_update(&mut self, update: &ResponseHeaders, metadata: ResponseMetadata) {
        self.headers.headers.remove(header::AGE);
        for name in update.headers.keys() {
            if PRESERVED_ON_UPDATE.contains(name) {
                continue;
            }
            self.headers.headers.remove(name);
            for value in update.headers.get_all(name) {
                self.headers.headers.append(name.clone(), value.clone());
            }
        }
        self.metadata = metadata;
    }
}

/// Backing storage for completed entries.
pub trait EntryStore: Send + Sync {
    fn get(&self, key: &Key) -> Option<Arc<StoredEntry>>;

    fn put(&self, key: Key, entry: StoredEntry) -> Result<(), CacheError>;

    /// Refresh the headers of a stored entry. `false` if it is gone.
    fn update_headers(&self, key: &Key, headers: &ResponseHeaders, metadata: ResponseMetadata) -> bool;

    fn remove(&self, key: &Key) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bodies larger than this are refused.
    fn max_body_size(&self) -> Option<u64> {
        None
    }
}

/// Snapshot of store statistics.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub capacity: usize,
}

struct Slot {
    key: Key,
    entry: Arc<StoredEntry>,
    visited: AtomicBool,
}

/// One shard of the memory store, evicting with SIEVE.
///
/// A roving hand walks from the oldest entry toward the newest. Visited
/// entries get their bit cleared and stay in place, unvisited ones are
/// evicted. Hits only flip the visited bit, so lookups need a read lock.
struct SieveShard {
    arena: Arena<Slot>,
    map: HashMap<Key, Handle>,
    hand: Option<Handle>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: u64,
}

impl SieveShard {
    fn new(capacity: usize) -> Self {
        Self {
            arena: Arena::with_capacity(capacity.min(1024)),
            map: HashMap::new(),
            hand: None,
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: 0,
        }
    }

    fn get(&self, key: &Key) -> Option<Arc<StoredEntry>> {
        let slot = self.map.get(key).and_then(|h| self.arena.get(*h));
        match slot {
            Some(slot) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                slot.visited.store(true, Ordering::Relaxed);
                Some(Arc::clone(&slot.entry))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn insert(&mut self, key: Key, entry: Arc<StoredEntry>) {
        self.remove(&key);

        while self.arena.len() >= self.capacity {
            if !self.evict_one() {
                break;
            }
        }

        let handle = self.arena.push_head(Slot {
            key: key.clone(),
            entry,
            visited: AtomicBool::new(false),
        });
        self.map.insert(key, handle);
    }

    fn evict_one(&mut self) -> bool {
        loop {
            let Some(index) = self.hand.filter(|h| self.arena.contains(*h)).or_else(|| self.arena.tail()) else {
                return false;
            };
            self.hand = self.arena.prev(index);

            let visited = self
                .arena
                .get(index)
                .map(|s| s.visited.swap(false, Ordering::Relaxed))
                .unwrap_or(false);
            if !visited {
                if let Some(evicted) = self.arena.remove(index) {
                    self.map.remove(&evicted.key);
                    self.evictions += 1;
                    tracing::trace!(key = %evicted.key, "evicted stored entry");
                }
                return true;
            }
        }
    }

    fn remove(&mut self, key: &Key) -> bool {
        let Some(handle) = self.map.remove(key) else {
            return false;
        };
        if self.hand == Some(handle) {
            self.hand = self.arena.prev(handle);
        }
        self.arena.remove(handle);
        true
    }
}

/// Sharded in-memory entry store.
pub struct MemoryStore {
    shards: Sharded<SieveShard>,
    max_body_size: Option<u64>,
}

impl MemoryStore {
    /// `max_entries` is split evenly across shards (at least one each).
    pub fn new(max_entries: usize, max_body_size: Option<u64>) -> Self {
        let per_shard = (max_entries / NUM_SHARDS).max(1);
        Self {
            shards: Sharded::new(|| SieveShard::new(per_shard)),
            max_body_size,
        }
    }

    pub fn stats(&self) -> StoreStats {
        let mut total = StoreStats::default();
        for shard in self.shards.iter() {
            let s = shard.read();
            total.hits += s.hits.load(Ordering::Relaxed);
            total.misses += s.misses.load(Ordering::Relaxed);
            total.evictions += s.evictions;
            total.entries += s.arena.len();
            total.capacity += s.capacity;
        }
        total
    }
}

impl EntryStore for MemoryStore {
    fn get(&self, key: &Key) -> Option<Arc<StoredEntry>> {
        self.shards.shard(key).read().get(key)
    }

    fn put(&self, key: Key, entry: StoredEntry) -> Result<(), CacheError> {
        if let Some(limit) = self.max_body_size {
            let size = entry.body.len() as u64;
            if size > limit {
                return Err(CacheError::BodyTooLarge { size, limit });
            }
        }
        self.shards.shard(&key).write().insert(key, Arc::new(entry));
        Ok(())
    }

    fn update_headers(&self, key: &Key, headers: &ResponseHeaders, metadata: ResponseMetadata) -> bool {
        let mut shard = self.shards.shard(key).write();
        let Some(handle) = shard.map.get(key).copied() else {
            return false;
        };
        match shard.arena.get_mut(handle) {
            Some(slot) => {
                let mut updated = StoredEntry::clone(&slot.entry);
                updated.apply_header_update(headers, metadata);
                slot.entry = Arc::new(updated);
                true
            }
            None => false,
        }
    }

    fn remove(&self, key: &Key) -> bool {
        self.shards.shard(key).write().remove(key)
    }

    fn len(&self) -> usize {
        self.shards.sum_by(|s| s.arena.len())
    }

    fn max_body_size(&self) -> Option<u64> {
        self.max_body_size
    }
}
