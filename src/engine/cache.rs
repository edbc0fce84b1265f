//! Module Result Cache
//!
//! Caches module output records keyed by (module UUID, input fingerprint)
//! for modules that opt in with `cache_ms`. A hit republishes the cached
//! outputs without invoking the body.
//!
//! ## Design
//!
//! TTL-based expiry with a capacity bound; eviction removes the oldest
//! entries first. Non-default `cache_backend` values are preserved through
//! the options round-trip but served by this in-memory cache.

use crate::value::RawValue;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Cached output record with its insertion time.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub outputs: HashMap<String, RawValue>,
    pub stored_at: Instant,
}

/// Hit/miss counters, for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
}

/// Fingerprint an input record: order-independent SHA-256 over the
/// serialized (name, value) pairs.
pub fn input_fingerprint(inputs: &HashMap<String, RawValue>) -> String {
    let mut pairs: Vec<(&String, &RawValue)> = inputs.iter().collect();
    pairs.sort_by_key(|(name, _)| (*name).clone());
    let mut hasher = Sha256::new();
    for (name, value) in pairs {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(serde_json::to_vec(value).unwrap_or_default());
        hasher.update(b";");
    }
    format!("{:x}", hasher.finalize())
}

/// In-memory TTL result cache shared across executions of an engine.
pub struct ResultCache {
    entries: Mutex<HashMap<(Uuid, String), CacheEntry>>,
    stats: Mutex<CacheStats>,
    max_entries: usize,
}

impl ResultCache {
    pub fn new(max_entries: usize) -> Self {
        ResultCache {
            entries: Mutex::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
            max_entries,
        }
    }

    /// Look up a fresh entry; an expired one counts as a miss and is
    /// dropped.
    pub fn get(
        &self,
        module: Uuid,
        fingerprint: &str,
        ttl: Duration,
    ) -> Option<HashMap<String, RawValue>> {
        let key = (module, fingerprint.to_string());
        let mut entries = self.entries.lock();
        let hit = match entries.get(&key) {
            Some(entry) if entry.stored_at.elapsed() <= ttl => Some(entry.outputs.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        };
        let mut stats = self.stats.lock();
        if hit.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        hit
    }

    pub fn put(&self, module: Uuid, fingerprint: &str, outputs: HashMap<String, RawValue>) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries {
            // Oldest-first eviction keeps the bound without tracking LRU
            // links.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(key, _)| key.clone())
            {
                entries.remove(&oldest);
                self.stats.lock().evictions += 1;
            }
        }
        entries.insert(
            (module, fingerprint.to_string()),
            CacheEntry {
                outputs,
                stored_at: Instant::now(),
            },
        );
        self.stats.lock().insertions += 1;
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        ResultCache::new(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs(v: i64) -> HashMap<String, RawValue> {
        let mut out = HashMap::new();
        out.insert("result".to_string(), RawValue::Int(v));
        out
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let mut a = HashMap::new();
        a.insert("x".to_string(), RawValue::Int(1));
        a.insert("y".to_string(), RawValue::Int(2));
        let mut b = HashMap::new();
        b.insert("y".to_string(), RawValue::Int(2));
        b.insert("x".to_string(), RawValue::Int(1));
        assert_eq!(input_fingerprint(&a), input_fingerprint(&b));

        let mut c = HashMap::new();
        c.insert("x".to_string(), RawValue::Int(1));
        c.insert("y".to_string(), RawValue::Int(3));
        assert_ne!(input_fingerprint(&a), input_fingerprint(&c));
    }

    #[test]
    fn test_hit_within_ttl() {
        let cache = ResultCache::new(10);
        let module = Uuid::new_v4();
        cache.put(module, "fp", outputs(42));
        let hit = cache.get(module, "fp", Duration::from_secs(60));
        assert_eq!(hit, Some(outputs(42)));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = ResultCache::new(10);
        let module = Uuid::new_v4();
        cache.put(module, "fp", outputs(42));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get(module, "fp", Duration::from_millis(1)).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_capacity_eviction() {
        let cache = ResultCache::new(2);
        let module = Uuid::new_v4();
        cache.put(module, "a", outputs(1));
        cache.put(module, "b", outputs(2));
        cache.put(module, "c", outputs(3));
        assert_eq!(cache.stats().evictions, 1);
    }
}
