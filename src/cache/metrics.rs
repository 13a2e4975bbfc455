//! Client Statistics
//!
//! Lock-free counters describing how requests were served.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-client counters
#[derive(Debug, Default)]
pub struct ClientStats {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    network_fetches: AtomicU64,
    not_modified: AtomicU64,
    offline_fallbacks: AtomicU64,
    failed_fetches: AtomicU64,
    rejected_responses: AtomicU64,
    stale_served: AtomicU64,
    revalidations_started: AtomicU64,
}

impl ClientStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_hit(&self) {
        self.disk_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_fetch(&self) {
        self.network_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_not_modified(&self) {
        self.not_modified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_offline_fallback(&self) {
        self.offline_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_fetch(&self) {
        self.failed_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_response(&self) {
        self.rejected_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_revalidation_started(&self) {
        self.revalidations_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            network_fetches: self.network_fetches.load(Ordering::Relaxed),
            not_modified: self.not_modified.load(Ordering::Relaxed),
            offline_fallbacks: self.offline_fallbacks.load(Ordering::Relaxed),
            failed_fetches: self.failed_fetches.load(Ordering::Relaxed),
            rejected_responses: self.rejected_responses.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            revalidations_started: self.revalidations_started.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`ClientStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Served from the memory tier
    pub memory_hits: u64,
    /// Served from the disk tier
    pub disk_hits: u64,
    /// Calls made to the fetcher
    pub network_fetches: u64,
    /// 304 responses that refreshed a stored entry
    pub not_modified: u64,
    /// Stale entries served after a failed fetch
    pub offline_fallbacks: u64,
    /// Fetches that failed (error or no result)
    pub failed_fetches: u64,
    /// Non-2xx responses that were not cached
    pub rejected_responses: u64,
    /// Stale entries returned by stale-while-revalidate
    pub stale_served: u64,
    /// Background revalidations launched
    pub revalidations_started: u64,
}

impl StatsSnapshot {
    /// Share of lookups answered without the network
    pub fn hit_ratio(&self) -> f64 {
        let hits = (self.memory_hits + self.disk_hits) as f64;
        let total = hits + self.network_fetches as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}
