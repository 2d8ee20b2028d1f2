//! In-Memory UTXO Cache (C3).
//!
//! A bounded concurrent map from outpoint string to `(address, amount,
//! height)`, populated on income and warmup, drained on spend. It is an
//! optimization over C1, never the source of truth — after eviction the
//! authoritative record is still reachable through the UTXO-store.

use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::constants::{CACHE_EVICTION_FRACTION, CACHE_EVICTION_HEIGHT_WINDOW};

/// `(address, amount, block height)` — the third field is the block
/// **height**, not `block_time`, so eviction can compare it to the current
/// tip height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub address: String,
    pub amount: u64,
    pub height: u64,
}

pub struct UtxoCache {
    entries: DashMap<String, CacheEntry>,
    size: AtomicUsize,
    max_entries: usize,
}

impl UtxoCache {
    pub fn new(max_entries: usize) -> Self {
        Self { entries: DashMap::new(), size: AtomicUsize::new(0), max_entries }
    }

    /// `max_entries == 0` disables the cache entirely.
    pub fn is_enabled(&self) -> bool {
        self.max_entries > 0
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admits `outpoint -> (address, amount, height)`, evicting first if at
    /// capacity. No-op when the cache is disabled.
    pub fn insert(&self, outpoint: String, address: String, amount: u64, height: u64) {
        if !self.is_enabled() {
            return;
        }
        if self.size.load(Ordering::Relaxed) >= self.max_entries {
            self.evict(height);
        }
        if self.entries.insert(outpoint, CacheEntry { address, amount, height }).is_none() {
            self.size.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get(&self, outpoint: &str) -> Option<CacheEntry> {
        self.entries.get(outpoint).map(|e| e.value().clone())
    }

    /// Removes and returns the entry for `outpoint`, if present. Called on
    /// spend (cache hit) and when rolling back an income during a reorg.
    pub fn remove(&self, outpoint: &str) -> Option<CacheEntry> {
        let removed = self.entries.remove(outpoint).map(|(_, v)| v);
        if removed.is_some() {
            self.size.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Two-pass FIFO-by-height eviction targeting roughly 10% of capacity.
    /// First pass drops entries older than `current_height -
    /// CACHE_EVICTION_HEIGHT_WINDOW` outright; if that doesn't reach the
    /// target, a second pass randomly samples the remainder at a probability
    /// calibrated to cover the rest of the quota. A tuning heuristic, not a
    /// correctness boundary — evicted entries remain reachable through the
    /// UTXO-store.
    fn evict(&self, current_height: u64) {
        let target = ((self.max_entries as f64) * CACHE_EVICTION_FRACTION).round().max(1.0) as usize;
        let mut evicted = 0usize;

        let threshold = current_height.saturating_sub(CACHE_EVICTION_HEIGHT_WINDOW);
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().height < threshold)
            .map(|e| e.key().clone())
            .collect();
        for key in stale {
            if evicted >= target {
                break;
            }
            if self.entries.remove(&key).is_some() {
                self.size.fetch_sub(1, Ordering::Relaxed);
                evicted += 1;
            }
        }

        if evicted >= target {
            return;
        }

        let remaining_target = target - evicted;
        let remaining_total = self.entries.len();
        if remaining_total == 0 {
            return;
        }
        let probability = (remaining_target as f64 / remaining_total as f64).min(1.0);

        let mut rng = rand::thread_rng();
        let sampled: Vec<String> = self
            .entries
            .iter()
            .filter(|_| rng.gen::<f64>() < probability)
            .map(|e| e.key().clone())
            .collect();
        for key in sampled {
            if evicted >= target {
                break;
            }
            if self.entries.remove(&key).is_some() {
                self.size.fetch_sub(1, Ordering::Relaxed);
                evicted += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_cache_is_a_no_op() {
        let cache = UtxoCache::new(0);
        assert!(!cache.is_enabled());
        cache.insert("tx:0".to_string(), "addr".to_string(), 100, 1);
        assert_eq!(cache.len(), 0);
        assert!(cache.get("tx:0").is_none());
    }

    #[test]
    fn insert_get_remove_roundtrip() {
        let cache = UtxoCache::new(100);
        cache.insert("tx:0".to_string(), "addrA".to_string(), 500, 10);
        assert_eq!(cache.len(), 1);

        let entry = cache.get("tx:0").unwrap();
        assert_eq!(entry.address, "addrA");
        assert_eq!(entry.amount, 500);
        assert_eq!(entry.height, 10);

        let removed = cache.remove("tx:0").unwrap();
        assert_eq!(removed.address, "addrA");
        assert_eq!(cache.len(), 0);
        assert!(cache.get("tx:0").is_none());
    }

    #[test]
    fn remove_missing_key_is_a_no_op() {
        let cache = UtxoCache::new(10);
        assert!(cache.remove("nope").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn eviction_keeps_size_bounded() {
        let cache = UtxoCache::new(100);
        for i in 0..100u64 {
            cache.insert(format!("tx{i}:0"), "addr".to_string(), 1, i);
        }
        assert_eq!(cache.len(), 100);

        cache.insert("tx100:0".to_string(), "addr".to_string(), 1, 100);
        assert!(cache.len() <= 100);
        assert!(cache.len() > 0);
    }

    #[test]
    fn first_pass_prefers_evicting_stale_heights() {
        let cache = UtxoCache::new(10);
        cache.insert("old:0".to_string(), "addr".to_string(), 1, 0);
        for i in 1..10u64 {
            cache.insert(format!("tx{i}:0"), "addr".to_string(), 1, 20_000 + i);
        }
        assert_eq!(cache.len(), 10);

        cache.insert("new:0".to_string(), "addr".to_string(), 1, 20_010);
        assert!(cache.get("old:0").is_none(), "stale entry should be evicted first");
    }
}
