use crate::models::ItemId;
use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// The most recently resolved signed URL of one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// `None` means the backend confirmed the item has no image.
    pub value: Option<String>,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn is_valid_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Classification of a store lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Fresh(Option<String>),
    Stale(Option<String>),
    Absent,
}

impl Lookup {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Lookup::Fresh(_))
    }
}

/// Process-wide item id -> signed URL store with a fixed TTL.
///
/// Expired entries are never removed actively; they stay until overwritten by
/// the next successful resolution or evicted by the capacity bound.
#[derive(Clone)]
pub struct SignedUrlCache {
    cache: Arc<Cache<ItemId, CacheEntry>>,
    ttl: Duration,
}

impl SignedUrlCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder().max_capacity(max_capacity).build();

        Self {
            cache: Arc::new(cache),
            ttl,
        }
    }

    /// Raw entry, expired or not.
    pub fn get(&self, id: ItemId) -> Option<CacheEntry> {
        self.cache.get(&id)
    }

    pub fn lookup(&self, id: ItemId) -> Lookup {
        match self.get(id) {
            Some(entry) if entry.is_valid_at(Instant::now()) => Lookup::Fresh(entry.value),
            Some(entry) => Lookup::Stale(entry.value),
            None => Lookup::Absent,
        }
    }

    /// The cached value if it has not expired yet.
    pub fn fresh(&self, id: ItemId) -> Option<Option<String>> {
        match self.lookup(id) {
            Lookup::Fresh(value) => Some(value),
            _ => None,
        }
    }

    pub fn put(&self, id: ItemId, value: Option<String>) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.cache.insert(id, entry);
    }

    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
