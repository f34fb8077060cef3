use crate::arena::{Arena, Handle};
use crate::entry::ActiveEntry;
use crate::key::Key;
use crate::sharded::Sharded;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long an untouched hub stays registered.
pub const DEFAULT_ENTRY_EXPIRY: Duration = Duration::from_secs(5 * 60);

struct Tracked {
    key: Key,
    entry: Arc<ActiveEntry>,
    expires_at: Instant,
}

#[derive(Default)]
struct RegistryShard {
    map: HashMap<Key, Handle>,
    list: Arena<Tracked>,
    /// Expiry scan position, walking from oldest toward newest.
    hand: Option<Handle>,
}

impl RegistryShard {
    /// Advance the hand one node and drop that node if it has expired and
    /// nothing outside the registry still uses it.
    fn sweep_one(&mut self, now: Instant) {
        let candidate = match self.hand.filter(|h| self.list.contains(*h)) {
            Some(h) => h,
            None => match self.list.tail() {
                Some(h) => h,
                None => return,
            },
        };
        self.hand = self.list.prev(candidate);

        let expired = self
            .list
            .get(candidate)
            .map(|t| t.expires_at <= now && Arc::strong_count(&t.entry) == 1)
            .unwrap_or(false);
        if expired {
            if let Some(tracked) = self.list.remove(candidate) {
                self.map.remove(&tracked.key);
                tracing::trace!(key = %tracked.key, "expired active entry");
            }
        }
    }
}

/// Key to hub mapping with lazy, touch-driven expiry.
///
/// Every `get_entry` refreshes the touched hub's deadline and advances a
/// per-shard hand by one node, dropping it if it has expired. There is no
/// background sweeper.
pub struct ActiveEntries {
    shards: Sharded<RegistryShard>,
    expiry: Duration,
}

impl ActiveEntries {
    pub fn new(expiry: Duration) -> Self {
        Self {
            shards: Sharded::new(RegistryShard::default),
            expiry,
        }
    }

    pub fn get_entry(&self, key: &Key) -> Arc<ActiveEntry> {
        self.get_entry_at(key, Instant::now())
    }

    pub(crate) fn get_entry_at(&self, key: &Key, now: Instant) -> Arc<ActiveEntry> {
        let mut shard = self.shards.shard(key).write();
        let expires_at = now + self.expiry;

        let existing = shard.map.get(key).copied().and_then(|handle| {
            let tracked = shard.list.get_mut(handle)?;
            tracked.expires_at = expires_at;
            Some(Arc::clone(&tracked.entry))
        });

        let entry = match existing {
            Some(entry) => entry,
            None => {
                let entry = Arc::new(ActiveEntry::new(key.clone()));
                let handle = shard.list.push_head(Tracked {
                    key: key.clone(),
                    entry: Arc::clone(&entry),
                    expires_at,
                });
                shard.map.insert(key.clone(), handle);
                entry
            }
        };

        shard.sweep_one(now);
        entry
    }

    /// Number of registered hubs.
    pub fn len(&self) -> usize {
        self.shards.sum_by(|s| s.list.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ActiveEntries {
    fn default() -> Self {
        Self::new(DEFAULT_ENTRY_EXPIRY)
    }
}
