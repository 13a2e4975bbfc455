//! Cache-aware client - memory, then disk, then network
//!
//! The only entry point callers use. Hides tier coordination and the
//! conditional-request protocol behind [`CacheAwareClient::cached_get`] and
//! [`CacheAwareClient::stale_while_revalidate`].
//!
//! Concurrent misses for the same URL are not coalesced: each one reaches
//! the fetcher.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, info, instrument, warn};

use super::clock::{system_clock, SharedClock};
use super::config::{CacheConfig, OFFLINE_FALLBACK_TTL_MS};
use super::disk::{DiskCache, DiskEntry};
use super::entry::{
    CacheEntry, ConditionalHeaders, FetchError, Fetcher, IF_MODIFIED_SINCE, IF_NONE_MATCH,
};
use super::memory::MemoryCache;
use super::metrics::{ClientStats, StatsSnapshot};
use super::scope::TaskScope;
use crate::error::{Error, Result};

/// Status reported for bodies served from the disk tier
const STATUS_OK: u16 = 200;

/// Per-call options for [`CacheAwareClient::cached_get_with`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Skip both cache tiers and go to the network first
    pub force_refresh: bool,
    /// TTL for whatever gets stored (defaults to the page TTL)
    pub ttl_ms: Option<i64>,
}

impl GetOptions {
    /// Bypass the cache tiers
    pub fn force_refresh() -> Self {
        Self {
            force_refresh: true,
            ttl_ms: None,
        }
    }

    /// Use a specific TTL
    pub fn with_ttl(ttl_ms: i64) -> Self {
        Self {
            force_refresh: false,
            ttl_ms: Some(ttl_ms),
        }
    }
}

/// Build the conditional headers for a stored entry
pub fn conditional_headers(stale: Option<&DiskEntry>) -> ConditionalHeaders {
    let mut headers = ConditionalHeaders::new();
    if let Some(entry) = stale {
        if let Some(etag) = &entry.etag {
            headers.insert(IF_NONE_MATCH.to_string(), etag.clone());
        }
        if let Some(last_modified) = &entry.last_modified {
            headers.insert(IF_MODIFIED_SINCE.to_string(), last_modified.clone());
        }
    }
    headers
}

fn entry_from_disk(url: &str, disk: &DiskEntry) -> CacheEntry {
    CacheEntry {
        body: disk.body.clone(),
        url: url.to_string(),
        status_code: STATUS_OK,
        etag: disk.etag.clone(),
        last_modified: disk.last_modified.clone(),
        is_offline_fallback: false,
    }
}

/// State shared between foreground calls and background tasks
struct ClientInner {
    name: String,
    config: CacheConfig,
    memory: MemoryCache<CacheEntry>,
    disk: Option<DiskCache>,
    clock: SharedClock,
    stats: ClientStats,
    scope: TaskScope,
    /// Held shared by every tier write, exclusively by `close`
    write_gate: RwLock<()>,
}

impl ClientInner {
    /// Permission to write to the tiers on behalf of `owner`
    ///
    /// Fails with [`Error::Cancelled`] once the owning scope is cancelled.
    /// The returned guard must be held for the whole write and never across
    /// an await.
    fn write_permit(&self, owner: Option<&TaskScope>) -> Result<RwLockReadGuard<'_, ()>> {
        let permit = self.write_gate.read();
        if owner.is_some_and(TaskScope::is_cancelled) {
            return Err(Error::Cancelled);
        }
        Ok(permit)
    }

    fn memory_hit(&self, url: &str) -> Option<CacheEntry> {
        let entry = self.memory.get(&url.to_string())?;
        self.stats.record_memory_hit();
        debug!(plugin = %self.name, url, "memory hit");
        Some(entry)
    }

    /// Fresh disk entry, promoted into memory for its remaining lifetime
    fn disk_hit(&self, url: &str, owner: Option<&TaskScope>) -> Result<Option<CacheEntry>> {
        let Some(stored) = self.disk.as_ref().and_then(|disk| disk.get(url)) else {
            return Ok(None);
        };
        let entry = entry_from_disk(url, &stored);

        let remaining = (stored.expires_at() - self.clock.now_ms()).max(1);
        {
            let _permit = self.write_permit(owner)?;
            if let Err(e) = self.memory.put_with_ttl(url.to_string(), entry.clone(), remaining) {
                warn!(plugin = %self.name, url, error = %e, "Failed to promote disk entry");
            }
        }

        self.stats.record_disk_hit();
        debug!(plugin = %self.name, url, "disk hit");
        Ok(Some(entry))
    }

    fn stale_disk(&self, url: &str) -> Option<DiskEntry> {
        self.disk.as_ref()?.get_stale(url)
    }

    fn store(&self, entry: &CacheEntry, ttl_ms: i64, owner: Option<&TaskScope>) -> Result<()> {
        let _permit = self.write_permit(owner)?;

        if let Err(e) = self
            .memory
            .put_with_ttl(entry.url.clone(), entry.clone(), ttl_ms)
        {
            warn!(plugin = %self.name, url = %entry.url, error = %e, "Failed to store in memory");
        }

        if let Some(disk) = &self.disk {
            if let Err(e) = disk.put(
                &entry.url,
                &entry.body,
                entry.etag.as_deref(),
                entry.last_modified.as_deref(),
                ttl_ms,
            ) {
                warn!(plugin = %self.name, url = %entry.url, error = %e, "Failed to store on disk");
            }
        }
        Ok(())
    }

    /// Re-stamp the stored entry after a 304 and put it back into memory
    fn store_not_modified(
        &self,
        url: &str,
        stale: DiskEntry,
        ttl_ms: i64,
        owner: Option<&TaskScope>,
    ) -> Result<CacheEntry> {
        let _permit = self.write_permit(owner)?;

        let refreshed = match &self.disk {
            Some(disk) => match disk.refresh(url, ttl_ms) {
                Ok(Some(entry)) => entry,
                Ok(None) => stale,
                Err(e) => {
                    warn!(plugin = %self.name, url, error = %e, "Failed to refresh disk entry");
                    stale
                }
            },
            None => stale,
        };

        let entry = entry_from_disk(url, &refreshed);
        if let Err(e) = self.memory.put_with_ttl(url.to_string(), entry.clone(), ttl_ms) {
            warn!(plugin = %self.name, url, error = %e, "Failed to store in memory");
        }
        Ok(entry)
    }

    /// One network attempt with conditional headers, writing through on success
    ///
    /// `owner` is the scope the call runs on, if any. Once it is cancelled
    /// nothing is written. `Ok(None)` means the attempt produced nothing
    /// cacheable. `Err` is only ever [`Error::Cancelled`].
    async fn fetch_and_cache(
        &self,
        url: &str,
        ttl_ms: i64,
        fetcher: &dyn Fetcher,
        owner: Option<&TaskScope>,
    ) -> Result<Option<CacheEntry>> {
        let stale = self.stale_disk(url);
        let headers = conditional_headers(stale.as_ref());

        self.stats.record_network_fetch();
        let outcome = fetcher.fetch(headers).await;

        let result = match outcome {
            Ok(Some(result)) => result,
            Ok(None) => {
                self.stats.record_failed_fetch();
                warn!(plugin = %self.name, url, "Fetch returned no result");
                return Ok(None);
            }
            Err(FetchError::Cancelled) => return Err(Error::Cancelled),
            Err(FetchError::Failed(e)) => {
                self.stats.record_failed_fetch();
                warn!(plugin = %self.name, url, error = %e, "Fetch failed");
                return Ok(None);
            }
        };

        if result.is_not_modified() {
            let Some(stale) = stale else {
                warn!(plugin = %self.name, url, "304 Not Modified without a stored entry");
                return Ok(None);
            };

            let entry = self.store_not_modified(url, stale, ttl_ms, owner)?;
            self.stats.record_not_modified();
            debug!(plugin = %self.name, url, "not modified, TTL refreshed");
            return Ok(Some(entry));
        }

        if !result.is_success() {
            self.stats.record_rejected_response();
            debug!(plugin = %self.name, url, status = result.status_code, "not caching non-2xx response");
            return Ok(None);
        }

        let entry = CacheEntry {
            body: result.body,
            url: url.to_string(),
            status_code: result.status_code,
            etag: result.etag,
            last_modified: result.last_modified,
            is_offline_fallback: false,
        };
        self.store(&entry, ttl_ms, owner)?;
        debug!(plugin = %self.name, url, status = entry.status_code, "fetched and cached");
        Ok(Some(entry))
    }

    /// Serve a stale disk entry after a failed fetch
    fn offline_fallback(&self, url: &str, owner: Option<&TaskScope>) -> Result<Option<CacheEntry>> {
        let Some(stale) = self.stale_disk(url) else {
            return Ok(None);
        };
        let entry = entry_from_disk(url, &stale).as_offline_fallback();

        {
            let _permit = self.write_permit(owner)?;
            // Short TTL so the next call after it retries the network
            if let Err(e) =
                self.memory
                    .put_with_ttl(url.to_string(), entry.clone(), OFFLINE_FALLBACK_TTL_MS)
            {
                warn!(plugin = %self.name, url, error = %e, "Failed to store fallback");
            }
        }

        self.stats.record_offline_fallback();
        info!(plugin = %self.name, url, "serving stale entry as offline fallback");
        Ok(Some(entry))
    }

    /// Tier lookup for `cached_get`, with writes bound to `owner`
    async fn lookup(
        &self,
        url: &str,
        ttl_ms: i64,
        force_refresh: bool,
        fetcher: &dyn Fetcher,
        owner: Option<&TaskScope>,
    ) -> Result<Option<CacheEntry>> {
        if !force_refresh {
            if let Some(entry) = self.memory_hit(url) {
                return Ok(Some(entry));
            }
            if let Some(entry) = self.disk_hit(url, owner)? {
                return Ok(Some(entry));
            }
        }

        if let Some(entry) = self.fetch_and_cache(url, ttl_ms, fetcher, owner).await? {
            return Ok(Some(entry));
        }

        self.offline_fallback(url, owner)
    }
}

/// Three-tier HTTP response cache for one plugin
pub struct CacheAwareClient {
    inner: Arc<ClientInner>,
    closed: AtomicBool,
}

impl CacheAwareClient {
    /// Create a client using the system clock
    ///
    /// `cache_dir` is ignored when the config disables the disk tier.
    pub fn new(
        name: impl Into<String>,
        config: CacheConfig,
        cache_dir: Option<PathBuf>,
    ) -> Result<Self> {
        Self::with_clock(name, config, cache_dir, system_clock())
    }

    /// Create a client with an explicit clock
    pub fn with_clock(
        name: impl Into<String>,
        config: CacheConfig,
        cache_dir: Option<PathBuf>,
        clock: SharedClock,
    ) -> Result<Self> {
        let name = name.into();
        let memory = MemoryCache::with_clock(
            config.memory_max_entries(),
            config.page_ttl_ms(),
            clock.clone(),
        )?;

        let disk = match cache_dir {
            Some(dir) if config.disk_enabled() => {
                match DiskCache::open(&dir, config.disk_max_bytes(), clock.clone()) {
                    Ok(disk) => Some(disk),
                    Err(e) => {
                        warn!(plugin = %name, dir = %dir.display(), error = %e,
                            "Disk cache unavailable, continuing memory-only");
                        None
                    }
                }
            }
            _ => None,
        };

        debug!(plugin = %name, level = %config.level(), disk = disk.is_some(), "cache client created");

        Ok(Self {
            inner: Arc::new(ClientInner {
                name,
                config,
                memory,
                disk,
                clock,
                stats: ClientStats::new(),
                scope: TaskScope::new(),
                write_gate: RwLock::new(()),
            }),
            closed: AtomicBool::new(false),
        })
    }

    /// Cache-aware GET with default options
    pub async fn cached_get(&self, url: &str, fetcher: &dyn Fetcher) -> Result<Option<CacheEntry>> {
        self.cached_get_with(url, GetOptions::default(), fetcher).await
    }

    /// Cache-aware GET
    ///
    /// Memory, then fresh disk, then the network. When the network attempt
    /// fails, a stale disk entry is returned flagged `is_offline_fallback`.
    /// `Ok(None)` means nothing is cached and the network failed.
    #[instrument(skip(self, fetcher), fields(plugin = %self.inner.name))]
    pub async fn cached_get_with(
        &self,
        url: &str,
        options: GetOptions,
        fetcher: &dyn Fetcher,
    ) -> Result<Option<CacheEntry>> {
        let ttl_ms = self.resolve_ttl(options.ttl_ms)?;
        self.inner
            .lookup(url, ttl_ms, options.force_refresh, fetcher, None)
            .await
    }

    /// [`CacheAwareClient::cached_get_with`] on behalf of work owned by `scope`
    ///
    /// Returns [`Error::Cancelled`] instead of writing once `scope` is cancelled.
    pub(crate) async fn cached_get_on(
        &self,
        url: &str,
        options: GetOptions,
        fetcher: &dyn Fetcher,
        scope: &TaskScope,
    ) -> Result<Option<CacheEntry>> {
        let ttl_ms = self.resolve_ttl(options.ttl_ms)?;
        self.inner
            .lookup(url, ttl_ms, options.force_refresh, fetcher, Some(scope))
            .await
    }

    /// Stale-while-revalidate GET
    ///
    /// Returns a memory hit, else any disk entry (even expired) immediately.
    /// An expired disk entry triggers a background revalidation whose result
    /// only lands in the cache. With nothing cached, fetches synchronously.
    #[instrument(skip(self, fetcher), fields(plugin = %self.inner.name))]
    pub async fn stale_while_revalidate(
        &self,
        url: &str,
        ttl_ms: Option<i64>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Option<CacheEntry>> {
        let ttl_ms = self.resolve_ttl(ttl_ms)?;
        let inner = &self.inner;

        if let Some(entry) = inner.memory_hit(url) {
            return Ok(Some(entry));
        }

        if let Some(stored) = inner.stale_disk(url) {
            if stored.is_expired_at(inner.clock.now_ms()) {
                inner.stats.record_stale_served();
                self.revalidate_in_background(url, ttl_ms, fetcher);
                return Ok(Some(entry_from_disk(url, &stored)));
            }
            if let Some(entry) = inner.disk_hit(url, None)? {
                return Ok(Some(entry));
            }
        }

        if let Some(entry) = inner.fetch_and_cache(url, ttl_ms, fetcher.as_ref(), None).await? {
            return Ok(Some(entry));
        }
        inner.offline_fallback(url, None)
    }

    fn revalidate_in_background(&self, url: &str, ttl_ms: i64, fetcher: Arc<dyn Fetcher>) {
        let inner = Arc::clone(&self.inner);
        let url = url.to_string();

        let spawned = self.inner.scope.spawn("revalidate", async move {
            let owner = Some(&inner.scope);
            match inner.fetch_and_cache(&url, ttl_ms, fetcher.as_ref(), owner).await {
                Ok(Some(_)) => debug!(plugin = %inner.name, url, "background revalidation done"),
                Ok(None) => debug!(plugin = %inner.name, url, "background revalidation produced nothing"),
                Err(_) => debug!(plugin = %inner.name, url, "background revalidation cancelled"),
            }
        });

        if spawned {
            self.inner.stats.record_revalidation_started();
        }
    }

    /// Drop `url` from both tiers
    pub fn invalidate(&self, url: &str) {
        self.inner.memory.invalidate(&url.to_string());
        if let Some(disk) = &self.inner.disk {
            disk.invalidate(url);
        }
    }

    /// Empty both tiers
    pub fn clear_all(&self) {
        self.inner.memory.clear();
        if let Some(disk) = &self.inner.disk {
            disk.clear();
        }
    }

    /// Cancel background work and empty both tiers. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            // Waits out in-flight background writes; later ones see the cancel
            let _gate = self.inner.write_gate.write();
            self.inner.scope.cancel();
            self.clear_all();
        }
        info!(plugin = %self.inner.name, "cache client closed");
    }

    /// True once [`CacheAwareClient::close`] ran
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Scope for work that must die with this client (used by the prefetcher)
    pub fn child_scope(&self) -> TaskScope {
        self.inner.scope.child()
    }

    /// Wait for outstanding background revalidations
    pub async fn wait_idle(&self) {
        self.inner.scope.wait_idle().await;
    }

    /// Plugin identity
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Active policy
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Memory tier
    pub fn memory(&self) -> &MemoryCache<CacheEntry> {
        &self.inner.memory
    }

    /// Disk tier, when enabled
    pub fn disk(&self) -> Option<&DiskCache> {
        self.inner.disk.as_ref()
    }

    /// Counter snapshot
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    fn resolve_ttl(&self, ttl_ms: Option<i64>) -> Result<i64> {
        let ttl_ms = ttl_ms.unwrap_or_else(|| self.inner.config.page_ttl_ms());
        if ttl_ms <= 0 {
            return Err(Error::config(format!("TTL must be positive, got {ttl_ms}")));
        }
        Ok(ttl_ms)
    }
}

impl std::fmt::Debug for CacheAwareClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAwareClient")
            .field("name", &self.inner.name)
            .field("level", &self.inner.config.level())
            .field("disk", &self.inner.disk)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for CacheAwareClient {
    fn drop(&mut self) {
        self.inner.scope.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::config::CacheLevel;
    use crate::cache::entry::{FetchOutcome, FetchResult};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Replays scripted outcomes and records the headers it saw
    #[derive(Default)]
    struct Script {
        outcomes: Mutex<VecDeque<FetchOutcome>>,
        seen: Mutex<Vec<ConditionalHeaders>>,
        calls: AtomicUsize,
    }

    impl Script {
        fn new(outcomes: Vec<FetchOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                ..Default::default()
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for Script {
        async fn fetch(&self, headers: ConditionalHeaders) -> FetchOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(headers);
            self.outcomes.lock().pop_front().unwrap_or(Ok(None))
        }
    }

    fn ok(body: &str) -> FetchOutcome {
        Ok(Some(FetchResult::new(body, 200)))
    }

    fn failed() -> FetchOutcome {
        Err(FetchError::Failed(anyhow::anyhow!("connection reset")))
    }

    fn client(dir: &std::path::Path, level: CacheLevel) -> (CacheAwareClient, Arc<ManualClock>) {
        let clock = ManualClock::new(1_700_000_000_000);
        let client = CacheAwareClient::with_clock(
            "test-plugin",
            CacheConfig::for_level(level),
            Some(dir.to_path_buf()),
            clock.clone(),
        )
        .unwrap();
        (client, clock)
    }

    #[tokio::test]
    async fn test_second_call_served_from_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let (client, _) = client(tmp.path(), CacheLevel::Balanced);
        let script = Script::new(vec![Ok(Some(
            FetchResult::new("<html>", 200).with_etag("W/\"abc\""),
        ))]);

        let first = client.cached_get("https://x/y", script.as_ref()).await.unwrap().unwrap();
        let second = client.cached_get("https://x/y", script.as_ref()).await.unwrap().unwrap();

        assert_eq!(script.calls(), 1);
        assert_eq!(first.body, "<html>");
        assert_eq!(second, first);
        assert_eq!(client.stats().memory_hits, 1);
    }

    #[tokio::test]
    async fn test_disk_hit_populates_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let (client, _) = client(tmp.path(), CacheLevel::Balanced);
        let script = Script::new(vec![ok("body")]);

        client.cached_get("u", script.as_ref()).await.unwrap();
        client.memory().clear();

        let entry = client.cached_get("u", script.as_ref()).await.unwrap().unwrap();
        assert_eq!(entry.body, "body");
        assert_eq!(script.calls(), 1);
        assert_eq!(client.stats().disk_hits, 1);
        assert!(client.memory().contains(&"u".to_string()));
    }

    #[tokio::test]
    async fn test_force_refresh_skips_tiers() {
        let tmp = tempfile::tempdir().unwrap();
        let (client, _) = client(tmp.path(), CacheLevel::Balanced);
        let script = Script::new(vec![ok("v1"), ok("v2")]);

        client.cached_get("u", script.as_ref()).await.unwrap();
        let entry = client
            .cached_get_with("u", GetOptions::force_refresh(), script.as_ref())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(entry.body, "v2");
        assert_eq!(script.calls(), 2);
    }

    #[tokio::test]
    async fn test_conditional_headers_sent_from_stale_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let (client, clock) = client(tmp.path(), CacheLevel::Balanced);
        let script = Script::new(vec![
            Ok(Some(
                FetchResult::new("B1", 200)
                    .with_etag("\"v1\"")
                    .with_last_modified("Mon, 01 Jan 2024 00:00:00 GMT"),
            )),
            Ok(Some(FetchResult::not_modified())),
        ]);

        client.cached_get_with("u", GetOptions::with_ttl(1_000), script.as_ref()).await.unwrap();
        let first_stored = client.disk().unwrap().get_stale("u").unwrap().stored_at;

        clock.advance(5_000);
        let entry = client
            .cached_get_with("u", GetOptions::with_ttl(1_000), script.as_ref())
            .await
            .unwrap()
            .unwrap();

        let seen = script.seen.lock();
        assert!(seen[0].is_empty());
        assert_eq!(seen[1].get(IF_NONE_MATCH).map(String::as_str), Some("\"v1\""));
        assert_eq!(
            seen[1].get(IF_MODIFIED_SINCE).map(String::as_str),
            Some("Mon, 01 Jan 2024 00:00:00 GMT")
        );

        // 304 reuses the stored body and re-stamps it
        assert_eq!(entry.body, "B1");
        assert!(!entry.is_offline_fallback);
        let refreshed = client.disk().unwrap().get("u").unwrap();
        assert!(refreshed.stored_at > first_stored);
        assert_eq!(client.stats().not_modified, 1);
    }

    #[tokio::test]
    async fn test_304_without_stored_entry_is_a_miss() {
        let tmp = tempfile::tempdir().unwrap();
        let (client, _) = client(tmp.path(), CacheLevel::Balanced);
        let script = Script::new(vec![Ok(Some(FetchResult::not_modified()))]);

        let entry = client.cached_get("u", script.as_ref()).await.unwrap();
        assert!(entry.is_none());
        assert!(client.memory().is_empty());
    }

    #[tokio::test]
    async fn test_non_2xx_not_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let (client, _) = client(tmp.path(), CacheLevel::Balanced);
        let script = Script::new(vec![
            Ok(Some(FetchResult::new("challenge", 403))),
            ok("real"),
        ]);

        assert!(client.cached_get("u", script.as_ref()).await.unwrap().is_none());
        assert!(client.disk().unwrap().get_stale("u").is_none());
        assert_eq!(client.stats().rejected_responses, 1);

        let entry = client.cached_get("u", script.as_ref()).await.unwrap().unwrap();
        assert_eq!(entry.body, "real");
    }

    #[tokio::test]
    async fn test_offline_fallback_and_short_ttl() {
        let tmp = tempfile::tempdir().unwrap();
        let (client, clock) = client(tmp.path(), CacheLevel::Balanced);
        let script = Script::new(vec![ok("cached"), failed(), failed()]);

        client.cached_get_with("u", GetOptions::with_ttl(1_000), script.as_ref()).await.unwrap();
        clock.advance(2_000);

        let fallback = client.cached_get("u", script.as_ref()).await.unwrap().unwrap();
        assert!(fallback.is_offline_fallback);
        assert_eq!(fallback.body, "cached");
        assert_eq!(script.calls(), 2);

        // Within the fallback TTL the network is not retried
        clock.advance(OFFLINE_FALLBACK_TTL_MS - 1);
        let again = client.cached_get("u", script.as_ref()).await.unwrap().unwrap();
        assert!(again.is_offline_fallback);
        assert_eq!(script.calls(), 2);

        // After it, the network is tried again
        clock.advance(2);
        client.cached_get("u", script.as_ref()).await.unwrap();
        assert_eq!(script.calls(), 3);
    }

    #[tokio::test]
    async fn test_nothing_cached_and_network_down() {
        let tmp = tempfile::tempdir().unwrap();
        let (client, _) = client(tmp.path(), CacheLevel::Balanced);
        let script = Script::new(vec![failed()]);

        assert!(client.cached_get("u", script.as_ref()).await.unwrap().is_none());
        assert_eq!(client.stats().failed_fetches, 1);
    }

    #[tokio::test]
    async fn test_cancellation_propagates() {
        let tmp = tempfile::tempdir().unwrap();
        let (client, _) = client(tmp.path(), CacheLevel::Balanced);
        let script = Script::new(vec![Err(FetchError::Cancelled)]);

        let result = client.cached_get("u", script.as_ref()).await;
        assert_matches!(result, Err(Error::Cancelled));
    }

    #[tokio::test]
    async fn test_rejects_non_positive_ttl() {
        let tmp = tempfile::tempdir().unwrap();
        let (client, _) = client(tmp.path(), CacheLevel::Balanced);
        let script = Script::new(vec![ok("x")]);

        let result = client
            .cached_get_with("u", GetOptions::with_ttl(0), script.as_ref())
            .await;
        assert_matches!(result, Err(Error::Config(_)));
        assert_eq!(script.calls(), 0);
    }

    #[tokio::test]
    async fn test_minimal_level_is_memory_only() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("plugin");
        let (client, _) = client(&dir, CacheLevel::Minimal);
        let script = Script::new(vec![ok("x")]);

        client.cached_get("u", script.as_ref()).await.unwrap();
        assert!(client.disk().is_none());
        assert!(!dir.exists());
        assert_eq!(client.memory().len(), 1);
    }

    #[tokio::test]
    async fn test_swr_returns_stale_and_refreshes() {
        let tmp = tempfile::tempdir().unwrap();
        let (client, clock) = client(tmp.path(), CacheLevel::Balanced);
        let script = Script::new(vec![ok("old"), ok("new")]);

        client.cached_get_with("u", GetOptions::with_ttl(1_000), script.as_ref()).await.unwrap();
        client.memory().clear();
        clock.advance(5_000);

        let fetcher: Arc<dyn Fetcher> = script.clone();
        let stale = client
            .stale_while_revalidate("u", Some(1_000), fetcher.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stale.body, "old");

        client.wait_idle().await;
        assert_eq!(script.calls(), 2);

        let fresh = client
            .stale_while_revalidate("u", Some(1_000), fetcher)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.body, "new");
        assert_eq!(client.stats().revalidations_started, 1);
    }

    #[tokio::test]
    async fn test_swr_fresh_disk_entry_no_network() {
        let tmp = tempfile::tempdir().unwrap();
        let (client, _) = client(tmp.path(), CacheLevel::Balanced);
        let script = Script::new(vec![ok("body")]);

        client.cached_get("u", script.as_ref()).await.unwrap();
        client.memory().clear();

        let entry = client
            .stale_while_revalidate("u", None, script.clone())
            .await
            .unwrap()
            .unwrap();
        client.wait_idle().await;

        assert_eq!(entry.body, "body");
        assert_eq!(script.calls(), 1);
    }

    #[tokio::test]
    async fn test_swr_empty_cache_fetches_synchronously() {
        let tmp = tempfile::tempdir().unwrap();
        let (client, _) = client(tmp.path(), CacheLevel::Balanced);
        let script = Script::new(vec![ok("first")]);

        let entry = client
            .stale_while_revalidate("u", None, script.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.body, "first");
        assert_eq!(script.calls(), 1);
    }

    #[tokio::test]
    async fn test_close_cancels_revalidation_without_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let (client, clock) = client(tmp.path(), CacheLevel::Balanced);
        let script = Script::new(vec![ok("old")]);
        client.cached_get_with("u", GetOptions::with_ttl(1_000), script.as_ref()).await.unwrap();
        client.memory().clear();
        clock.advance(5_000);

        // A fetcher that never completes
        let hang = |_headers: ConditionalHeaders| async {
            futures::future::pending::<()>().await;
            FetchOutcome::Ok(Some(FetchResult::new("never", 200)))
        };
        let hang: Arc<dyn Fetcher> = Arc::new(hang);

        client.stale_while_revalidate("u", Some(1_000), hang).await.unwrap();
        client.close();
        client.close();
        client.wait_idle().await;

        assert!(client.is_closed());
        assert!(client.memory().is_empty());
        assert!(client.disk().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_mid_revalidation_discards_response() {
        let tmp = tempfile::tempdir().unwrap();
        let (client, clock) = client(tmp.path(), CacheLevel::Balanced);
        let client = Arc::new(client);
        let script = Script::new(vec![ok("old")]);
        client.cached_get_with("u", GetOptions::with_ttl(1_000), script.as_ref()).await.unwrap();
        client.memory().clear();
        clock.advance(5_000);

        // Close lands while the fetch is in flight; the response is ready in
        // the same poll, so only the write path can notice it
        let closing: Arc<dyn Fetcher> = {
            let client = Arc::clone(&client);
            Arc::new(move |_headers: ConditionalHeaders| {
                client.close();
                async { FetchOutcome::Ok(Some(FetchResult::new("written-after-close", 200))) }
            })
        };

        let stale = client
            .stale_while_revalidate("u", Some(1_000), closing)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stale.body, "old");
        client.wait_idle().await;

        assert!(client.is_closed());
        assert!(client.memory().is_empty());
        assert!(client.disk().unwrap().get_stale("u").is_none());
    }

    #[tokio::test]
    async fn test_scoped_lookup_refuses_writes_once_cancelled() {
        let tmp = tempfile::tempdir().unwrap();
        let (client, _) = client(tmp.path(), CacheLevel::Balanced);
        let scope = client.child_scope();
        scope.cancel();
        let script = Script::new(vec![ok("late")]);

        let result = client
            .cached_get_on("u", GetOptions::default(), script.as_ref(), &scope)
            .await;

        assert_matches!(result, Err(Error::Cancelled));
        assert_eq!(script.calls(), 1);
        assert!(client.memory().is_empty());
        assert!(client.disk().unwrap().is_empty());

        // Unscoped callers are unaffected
        let script = Script::new(vec![ok("fresh")]);
        let entry = client.cached_get("u", script.as_ref()).await.unwrap().unwrap();
        assert_eq!(entry.body, "fresh");
    }

    #[tokio::test]
    async fn test_invalidate_both_tiers() {
        let tmp = tempfile::tempdir().unwrap();
        let (client, _) = client(tmp.path(), CacheLevel::Balanced);
        let script = Script::new(vec![ok("a"), ok("b")]);

        client.cached_get("u", script.as_ref()).await.unwrap();
        client.invalidate("u");
        assert!(client.memory().is_empty());
        assert!(client.disk().unwrap().get_stale("u").is_none());

        let entry = client.cached_get("u", script.as_ref()).await.unwrap().unwrap();
        assert_eq!(entry.body, "b");
    }

    #[tokio::test]
    async fn test_concurrent_misses_both_fetch() {
        let tmp = tempfile::tempdir().unwrap();
        let (client, _) = client(tmp.path(), CacheLevel::Balanced);
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = {
            let calls = calls.clone();
            move |_headers: ConditionalHeaders| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    FetchOutcome::Ok(Some(FetchResult::new("same", 200)))
                }
            }
        };

        let (a, b) = tokio::join!(
            client.cached_get("u", &counted),
            client.cached_get("u", &counted)
        );
        assert_eq!(a.unwrap().unwrap().body, "same");
        assert_eq!(b.unwrap().unwrap().body, "same");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
