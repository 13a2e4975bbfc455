//! Three-Tier HTTP Response Cache
//!
//! Memory (LRU + TTL), disk (one file per key, byte budget) and network
//! (conditional requests), coordinated by [`CacheAwareClient`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        CacheAwareClient                                  │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Memory Tier          │ Disk Tier            │ Network                   │
//! │  ┌────────────────┐   │ ┌────────────────┐   │ ┌────────────────────┐    │
//! │  │ MemoryCache    │   │ │ DiskCache      │   │ │ Fetcher            │    │
//! │  │ LRU + TTL      │   │ │ sha256.cache   │   │ │ If-None-Match      │    │
//! │  │ 50-500 entries │   │ │ 0-200 MiB      │   │ │ If-Modified-Since  │    │
//! │  └────────────────┘   │ └────────────────┘   │ └────────────────────┘    │
//! │         │             │         │            │           │               │
//! │         └─────────────┴─────────┴────────────┴───────────┘               │
//! │                              │                                           │
//! │             304 refresh / offline fallback / SWR                         │
//! │             (background work on a TaskScope)                             │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lookup Order
//!
//! 1. Memory, unless `force_refresh`
//! 2. Fresh disk entry, promoted into memory
//! 3. Network, with validators from any stale disk entry
//! 4. Stale disk entry flagged as an offline fallback

mod client;
mod clock;
mod config;
mod disk;
mod entry;
mod memory;
mod metrics;
mod policy;
mod prefetch;
mod scope;

pub use client::{conditional_headers, CacheAwareClient, GetOptions};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{CacheConfig, CacheLevel, OFFLINE_FALLBACK_TTL_MS};
pub use disk::{
    decode_entry, encode_entry, file_name_for, CorruptEntry, DiskCache, DiskEntry, BODY_SEPARATOR,
};
pub use entry::{
    CacheEntry, ConditionalHeaders, FetchError, FetchOutcome, FetchResult, Fetcher,
    IF_MODIFIED_SINCE, IF_NONE_MATCH, STATUS_NOT_MODIFIED,
};
pub use memory::MemoryCache;
pub use metrics::{ClientStats, StatsSnapshot};
pub use policy::{lru_victim, prune_plan, AccessOrder, FileStat};
pub use prefetch::Prefetcher;
pub use scope::TaskScope;
