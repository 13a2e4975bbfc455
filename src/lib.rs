//! tiercache - Three-Tier HTTP Response Cache
//!
//! A client-side cache for scraping-style workloads: many plugins each fetch
//! HTML/JSON pages from their own origin and want repeat reads served
//! locally, conditional revalidation when content may have changed, and
//! stale data when the network is down.
//!
//! # Architecture
//!
//! ```text
//! Memory (LRU + TTL) → Disk (atomic files, byte budget) → Network (conditional GET)
//! ```
//!
//! One [`CacheAwareClient`] per plugin, handed out by a [`SharedHttpPool`].
//! The caller supplies a [`Fetcher`]; the cache never performs HTTP itself.
//!
//! # Modules
//!
//! - [`cache`] - Memory/disk tiers, the client, prefetching and policy presets
//! - [`pool`] - Per-plugin client registry
//! - [`settings`] - Persisted cache level
//! - [`error`] - Error types

pub mod cache;
pub mod error;
pub mod pool;
pub mod settings;

// Re-export commonly used types
pub use cache::{
    CacheAwareClient, CacheConfig, CacheEntry, CacheLevel, ConditionalHeaders, DiskCache,
    FetchError, FetchOutcome, FetchResult, Fetcher, GetOptions, MemoryCache, Prefetcher,
};
pub use error::{Error, Result};
pub use pool::SharedHttpPool;
pub use settings::CacheSettings;
