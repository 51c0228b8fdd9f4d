//! Sharded, expiring LRU cache of issued leaf certificates.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use lru::LruCache;
use parking_lot::Mutex;
use rustls::sign::CertifiedKey;

struct Entry {
    cert: Arc<CertifiedKey>,
    expires_at: Instant,
}

/// Common name to certificate cache.
///
/// Each shard has its own lock so concurrent handshakes for different hosts
/// rarely contend. An entry is served only while `now < expires_at`.
pub struct CertificateCache {
    shards: Vec<Mutex<LruCache<String, Entry>>>,
}

impl std::fmt::Debug for CertificateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateCache")
            .field("shards", &self.shards.len())
            .field("len", &self.len())
            .finish()
    }
}

impl CertificateCache {
    /// Creates `shards` shards of `capacity` entries each. Zero values are
    /// bumped to one.
    pub fn new(shards: usize, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(LruCache::new(capacity)))
            .collect();
        Self { shards }
    }

    pub fn get(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        self.get_at(name, Instant::now())
    }

    /// Looks `name` up as of `now`, dropping the entry if it has expired.
    pub fn get_at(&self, name: &str, now: Instant) -> Option<Arc<CertifiedKey>> {
        let mut shard = self.shard(name).lock();
        let expired = match shard.get(name) {
            Some(entry) if now < entry.expires_at => return Some(entry.cert.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            shard.pop(name);
        }
        None
    }

    /// Stores `cert` under `name`, replacing any previous entry.
    pub fn set(&self, name: &str, cert: Arc<CertifiedKey>, expires_at: Instant) {
        self.shard(name)
            .lock()
            .put(name.to_string(), Entry { cert, expires_at });
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, name: &str) -> &Mutex<LruCache<String, Entry>> {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }
}
