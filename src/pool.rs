//! Shared client pool
//!
//! Name-keyed registry that keeps exactly one live [`CacheAwareClient`]
//! (and at most one [`Prefetcher`]) per plugin. Constructed explicitly and
//! passed around; there is no process-global instance.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::cache::{system_clock, CacheAwareClient, CacheConfig, Prefetcher, SharedClock};
use crate::error::Result;

struct Slot {
    client: Arc<CacheAwareClient>,
    prefetcher: Option<Arc<Prefetcher>>,
}

impl Slot {
    fn shutdown(&self) {
        if let Some(prefetcher) = &self.prefetcher {
            prefetcher.cancel();
        }
        self.client.close();
    }
}

/// Directory name for a plugin identity
///
/// Anything outside `[A-Za-z0-9._-]` becomes `_`, so names can't escape the
/// cache root. `.` and `..` are mapped too.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    match cleaned.as_str() {
        "" => "_".to_string(),
        "." | ".." => cleaned.replace('.', "_"),
        _ => cleaned,
    }
}

/// Directory name for a plugin identity, unique per raw name
///
/// The sanitized name keeps the directory readable; the suffix is the first
/// 8 bytes of the SHA-256 of the raw name, so names that sanitize alike
/// (`site/one`, `site_one`) still get separate directories.
pub fn dir_name_for(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let suffix: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", sanitize_name(name), suffix)
}

/// Process-wide registry of per-plugin cache clients
pub struct SharedHttpPool {
    cache_root: PathBuf,
    clock: SharedClock,
    slots: Mutex<HashMap<String, Slot>>,
}

impl SharedHttpPool {
    /// Pool rooted at `cache_root`; each plugin gets its own subdirectory
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self::with_clock(cache_root, system_clock())
    }

    /// Pool whose clients all read time from `clock`
    pub fn with_clock(cache_root: impl Into<PathBuf>, clock: SharedClock) -> Self {
        Self {
            cache_root: cache_root.into(),
            clock,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Directory holding every plugin's cache directory
    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Cache directory used for `name`
    pub fn dir_for(&self, name: &str) -> PathBuf {
        self.cache_root.join(dir_name_for(name))
    }

    /// Create (or replace) the client for `name`
    ///
    /// An existing registration has its prefetcher cancelled and its client
    /// closed before the new client is built.
    pub fn get_client(&self, name: &str, config: CacheConfig) -> Result<Arc<CacheAwareClient>> {
        let mut slots = self.slots.lock();

        if let Some(old) = slots.remove(name) {
            old.shutdown();
            info!(plugin = name, "Replacing cache client");
        }

        let dir = config.disk_enabled().then(|| self.dir_for(name));
        let client = Arc::new(CacheAwareClient::with_clock(
            name,
            config,
            dir,
            self.clock.clone(),
        )?);

        slots.insert(
            name.to_string(),
            Slot {
                client: Arc::clone(&client),
                prefetcher: None,
            },
        );
        info!(plugin = name, level = %client.config().level(), "Registered cache client");
        Ok(client)
    }

    /// Registered client for `name`, if any
    pub fn client(&self, name: &str) -> Option<Arc<CacheAwareClient>> {
        self.slots.lock().get(name).map(|slot| Arc::clone(&slot.client))
    }

    /// Prefetcher for `name`, created on first use
    ///
    /// `None` until a client is registered for `name`.
    pub fn get_prefetcher(&self, name: &str) -> Option<Arc<Prefetcher>> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(name)?;

        let prefetcher = slot.prefetcher.get_or_insert_with(|| {
            debug!(plugin = name, "Creating prefetcher");
            Arc::new(Prefetcher::new(Arc::clone(&slot.client)))
        });
        Some(Arc::clone(prefetcher))
    }

    /// Cancel and close the registration for `name`. No-op when absent.
    pub fn release_client(&self, name: &str) {
        let removed = self.slots.lock().remove(name);
        if let Some(slot) = removed {
            slot.shutdown();
            info!(plugin = name, "Released cache client");
        }
    }

    /// Release every registration
    pub fn release_all(&self) {
        let drained: Vec<(String, Slot)> = self.slots.lock().drain().collect();
        let count = drained.len();

        for (name, slot) in drained {
            slot.shutdown();
            debug!(plugin = %name, "Released cache client");
        }

        if count > 0 {
            info!(count, "Released all cache clients");
        }
    }

    /// Registered plugin names, sorted
    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered plugins
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// True when no plugin is registered
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl std::fmt::Debug for SharedHttpPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedHttpPool")
            .field("cache_root", &self.cache_root)
            .field("registered", &self.registered())
            .finish()
    }
}

impl Drop for SharedHttpPool {
    fn drop(&mut self) {
        for slot in self.slots.get_mut().values() {
            if let Some(prefetcher) = &slot.prefetcher {
                prefetcher.cancel();
            }
        }
    }
}
