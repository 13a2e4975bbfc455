//! Memory Tier - bounded LRU map with per-entry TTL
//!
//! Values are cheap clones of already-fetched responses, so a single lock
//! per instance is enough; every operation runs under it.
//!
//! # Design
//!
//! - Entry expiry is `insertion time + ttl`, checked lazily on `get`
//! - `get` hits and `put` both count as a use for LRU ordering
//! - After an insert pushes the map past `max_entries`, the least recently
//!   used entry is evicted (see [`super::policy::lru_victim`])

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::clock::{system_clock, SharedClock};
use super::policy::{lru_victim, AccessOrder};
use crate::error::{Error, Result};

struct Slot<V> {
    value: V,
    expires_at: i64,
    tick: u64,
}

struct State<K, V> {
    slots: HashMap<K, Slot<V>>,
    order: AccessOrder<K>,
}

impl<K: Eq + Hash + Clone, V> State<K, V> {
    fn remove(&mut self, key: &K) -> Option<Slot<V>> {
        let slot = self.slots.remove(key)?;
        self.order.forget(slot.tick);
        Some(slot)
    }
}

/// In-process LRU cache with TTL
pub struct MemoryCache<V, K = String> {
    state: Mutex<State<K, V>>,
    max_entries: usize,
    default_ttl_ms: i64,
    clock: SharedClock,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V, K> std::fmt::Debug for MemoryCache<V, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("max_entries", &self.max_entries)
            .field("default_ttl_ms", &self.default_ttl_ms)
            .finish_non_exhaustive()
    }
}

impl<V: Clone, K: Eq + Hash + Clone> MemoryCache<V, K> {
    /// Create a cache using the system clock
    pub fn new(max_entries: usize, default_ttl_ms: i64) -> Result<Self> {
        Self::with_clock(max_entries, default_ttl_ms, system_clock())
    }

    /// Create a cache with an explicit clock
    pub fn with_clock(max_entries: usize, default_ttl_ms: i64, clock: SharedClock) -> Result<Self> {
        if max_entries == 0 {
            return Err(Error::config("memory cache needs at least one entry"));
        }
        if default_ttl_ms <= 0 {
            return Err(Error::config(format!(
                "memory cache default TTL must be positive, got {default_ttl_ms}"
            )));
        }

        Ok(Self {
            state: Mutex::new(State {
                slots: HashMap::new(),
                order: AccessOrder::new(),
            }),
            max_entries,
            default_ttl_ms,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Get a live value; expired entries are removed and reported as a miss
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();

        let expired = match state.slots.get(key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(slot) => now > slot.expires_at,
        };

        if expired {
            state.remove(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let State { slots, order } = &mut *state;
        let slot = slots.get_mut(key)?;
        slot.tick = order.touch(key, Some(slot.tick));
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(slot.value.clone())
    }

    /// Store a value with the default TTL
    pub fn put(&self, key: K, value: V) -> Result<()> {
        self.put_with_ttl(key, value, self.default_ttl_ms)
    }

    /// Store a value expiring `ttl_ms` from now
    pub fn put_with_ttl(&self, key: K, value: V, ttl_ms: i64) -> Result<()> {
        if ttl_ms <= 0 {
            return Err(Error::config(format!("TTL must be positive, got {ttl_ms}")));
        }

        let expires_at = self.clock.now_ms().saturating_add(ttl_ms);
        let mut state = self.state.lock();

        let previous = state.slots.get(&key).map(|slot| slot.tick);
        let tick = state.order.touch(&key, previous);
        state.slots.insert(
            key,
            Slot {
                value,
                expires_at,
                tick,
            },
        );

        while let Some(victim) = lru_victim(&state.order, state.slots.len(), self.max_entries) {
            state.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Remove one entry
    pub fn invalidate(&self, key: &K) -> Option<V> {
        self.state.lock().remove(key).map(|slot| slot.value)
    }

    /// Check presence without touching LRU order or expiry
    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().slots.contains_key(key)
    }

    /// Remove everything
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.slots.clear();
        state.order.clear();
    }

    /// Number of stored entries (including not-yet-collected expired ones)
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry budget
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// TTL applied by [`MemoryCache::put`]
    pub fn default_ttl_ms(&self) -> i64 {
        self.default_ttl_ms
    }

    /// Get hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================
