//! Cache policy presets
//!
//! A single persisted string key picks one of three aggressiveness levels;
//! each level maps to an immutable, validated [`CacheConfig`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MINUTE_MS: i64 = 60 * 1000;
const MIB: u64 = 1024 * 1024;

/// TTL applied to an offline fallback written back into memory
pub const OFFLINE_FALLBACK_TTL_MS: i64 = 30 * 1000;

/// User-facing cache aggressiveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheLevel {
    /// Small memory tier, no disk, short TTLs, no prefetch
    #[default]
    Minimal,
    /// Moderate budgets and TTLs
    Balanced,
    /// Large budgets, long TTLs, detail prefetching
    Aggressive,
}

impl CacheLevel {
    /// Parse a persisted key, case-insensitively
    ///
    /// Anything unrecognised falls back to [`CacheLevel::Minimal`] so a bad
    /// value never grants a larger budget than requested.
    pub fn from_key(key: &str) -> Self {
        match key.trim().to_ascii_uppercase().as_str() {
            "BALANCED" => CacheLevel::Balanced,
            "AGGRESSIVE" => CacheLevel::Aggressive,
            _ => CacheLevel::Minimal,
        }
    }

    /// The persisted key for this level
    pub fn as_key(&self) -> &'static str {
        match self {
            CacheLevel::Minimal => "MINIMAL",
            CacheLevel::Balanced => "BALANCED",
            CacheLevel::Aggressive => "AGGRESSIVE",
        }
    }
}

impl fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key())
    }
}

/// Immutable cache policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    level: CacheLevel,
    memory_max_entries: usize,
    disk_max_bytes: u64,
    page_ttl_ms: i64,
    search_ttl_ms: i64,
    max_detail_prefetch: usize,
}

impl CacheConfig {
    /// Build a validated config
    pub fn new(
        level: CacheLevel,
        memory_max_entries: usize,
        disk_max_bytes: u64,
        page_ttl_ms: i64,
        search_ttl_ms: i64,
        max_detail_prefetch: usize,
    ) -> Result<Self> {
        if memory_max_entries == 0 {
            return Err(Error::config("memoryMaxEntries must be > 0"));
        }
        if page_ttl_ms <= 0 {
            return Err(Error::config(format!("pageTtlMs must be > 0, got {page_ttl_ms}")));
        }
        if search_ttl_ms <= 0 {
            return Err(Error::config(format!(
                "searchTtlMs must be > 0, got {search_ttl_ms}"
            )));
        }

        Ok(Self {
            level,
            memory_max_entries,
            disk_max_bytes,
            page_ttl_ms,
            search_ttl_ms,
            max_detail_prefetch,
        })
    }

    /// Preset for a level
    pub fn for_level(level: CacheLevel) -> Self {
        match level {
            CacheLevel::Minimal => Self {
                level,
                memory_max_entries: 50,
                disk_max_bytes: 0,
                page_ttl_ms: 5 * MINUTE_MS,
                search_ttl_ms: 2 * MINUTE_MS,
                max_detail_prefetch: 0,
            },
            CacheLevel::Balanced => Self {
                level,
                memory_max_entries: 200,
                disk_max_bytes: 50 * MIB,
                page_ttl_ms: 30 * MINUTE_MS,
                search_ttl_ms: 10 * MINUTE_MS,
                max_detail_prefetch: 0,
            },
            CacheLevel::Aggressive => Self {
                level,
                memory_max_entries: 500,
                disk_max_bytes: 200 * MIB,
                page_ttl_ms: 120 * MINUTE_MS,
                search_ttl_ms: 30 * MINUTE_MS,
                max_detail_prefetch: 3,
            },
        }
    }

    /// Preset for a persisted key (unknown keys -> MINIMAL)
    pub fn from_key(key: &str) -> Self {
        Self::for_level(CacheLevel::from_key(key))
    }

    /// Level this config was built for
    pub fn level(&self) -> CacheLevel {
        self.level
    }

    /// Memory tier entry budget
    pub fn memory_max_entries(&self) -> usize {
        self.memory_max_entries
    }

    /// Disk tier byte budget (0 disables the disk tier)
    pub fn disk_max_bytes(&self) -> u64 {
        self.disk_max_bytes
    }

    /// True when the disk tier is in use
    pub fn disk_enabled(&self) -> bool {
        self.disk_max_bytes > 0
    }

    /// TTL for list/detail pages (ms); the default for `cached_get`
    pub fn page_ttl_ms(&self) -> i64 {
        self.page_ttl_ms
    }

    /// TTL for search results (ms)
    pub fn search_ttl_ms(&self) -> i64 {
        self.search_ttl_ms
    }

    /// Page TTL as a Duration
    pub fn page_ttl(&self) -> Duration {
        Duration::from_millis(self.page_ttl_ms as u64)
    }

    /// How many detail pages one `prefetch_urls` call may warm
    pub fn max_detail_prefetch(&self) -> usize {
        self.max_detail_prefetch
    }

    /// Prefetching happens at every level above MINIMAL
    pub fn prefetch_enabled(&self) -> bool {
        self.level != CacheLevel::Minimal
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::for_level(CacheLevel::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
