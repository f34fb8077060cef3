use parking_lot::RwLock;
use std::hash::Hash;

/// Number of shards. Must be a power of two for fast modulo via bitmask.
pub const NUM_SHARDS: usize = 64;
const SHARD_MASK: u64 = (NUM_SHARDS as u64) - 1;

/// Lock-striped container.
///
/// Keys are distributed across 64 independent shards, each behind its own
/// `RwLock`, so operations on unrelated keys never contend. Shard selection
/// uses `ahash` with fixed seeds so a key always lands on the same shard.
pub struct Sharded<T> {
    shards: Box<[RwLock<T>]>,
}

impl<T> Sharded<T> {
    /// `make_shard` is called once per shard.
    pub fn new<F>(make_shard: F) -> Self
    where
        F: Fn() -> T,
    {
        let shards: Vec<RwLock<T>> = (0..NUM_SHARDS).map(|_| RwLock::new(make_shard())).collect();
        Self {
            shards: shards.into_boxed_slice(),
        }
    }

    #[inline]
    fn shard_index<K: Hash + ?Sized>(key: &K) -> usize {
        let hash = ahash::RandomState::with_seeds(1, 2, 3, 4).hash_one(key);
        (hash & SHARD_MASK) as usize
    }

    /// The shard owning `key`.
    #[inline]
    pub fn shard<K: Hash + ?Sized>(&self, key: &K) -> &RwLock<T> {
        &self.shards[Self::shard_index(key)]
    }

    pub fn iter(&self) -> impl Iterator<Item = &RwLock<T>> {
        self.shards.iter()
    }

    /// Fold a read-locked view of every shard.
    pub fn sum_by<F>(&self, f: F) -> usize
    where
        F: Fn(&T) -> usize,
    {
        self.shards.iter().map(|s| f(&s.read())).sum()
    }
}
