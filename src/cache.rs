use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Derive a stable cache key from an operation name and its arguments.
pub fn cache_key(op: &str, args: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(op.as_bytes());
    for arg in args {
        hasher.update([0u8]);
        hasher.update(arg.as_bytes());
    }
    format!("{op}:{:x}", hasher.finalize())
}

/// Bounded in-process TTL cache. Injected where expensive lookups (artifact
/// loads, history reads) repeat within a batch; nothing global.
pub struct TtlCache<V> {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<String, (Instant, V)>,
}

impl<V> TtlCache<V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    pub fn get(&mut self, key: &str) -> Option<&V> {
        let expired = match self.entries.get(key) {
            Some((stored, _)) => stored.elapsed() > self.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|(_, v)| v)
    }

    pub fn put(&mut self, key: String, value: V) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.evict_one();
        }
        self.entries.insert(key, (Instant::now(), value));
    }

    pub fn get_or_insert_with(&mut self, key: &str, fill: impl FnOnce() -> V) -> &V {
        if self.get(key).is_none() {
            let value = fill();
            self.put(key.to_string(), value);
        }
        self.entries.get(key).map(|(_, v)| v).expect("just inserted")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop the stalest entry to make room.
    fn evict_one(&mut self) {
        if let Some(key) = self
            .entries
            .iter()
            .min_by_key(|(_, (stored, _))| *stored)
            .map(|(k, _)| k.clone())
        {
            self.entries.remove(&key);
        }
    }
}
