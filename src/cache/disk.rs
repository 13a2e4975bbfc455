//! Disk Tier - one file per key, survives restarts
//!
//! # File format
//!
//! ```text
//! storedAt=<epoch-ms>
//! ttlMs=<long>
//! etag=<string or empty>
//! lastModified=<string or empty>
//! bodyLength=<bytes>
//! ---CACHE_BODY_START---
//! <body, exactly bodyLength bytes>
//! ```
//!
//! # Design
//!
//! - File name is the hex SHA-256 of the key plus `.cache`; collisions are
//!   accepted
//! - Writes go to `<name>.tmp` and are renamed into place (copy + delete when
//!   rename fails), so a reader never sees a half-written entry
//! - A file that fails to decode is deleted and reported as absent
//! - After each write the directory is pruned oldest-written first until it
//!   fits the byte budget
//! - Every public operation holds the instance lock

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::clock::SharedClock;
use super::policy::{prune_plan, FileStat};
use crate::error::{Error, Result};

/// Line separating the header block from the body
pub const BODY_SEPARATOR: &str = "---CACHE_BODY_START---";

/// Extension of committed entry files
pub const ENTRY_EXTENSION: &str = "cache";

const TMP_SUFFIX: &str = ".tmp";

// =============================================================================
// Entry + codec
// =============================================================================

/// A disk-resident entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    /// Response body
    pub body: String,
    /// ETag validator
    pub etag: Option<String>,
    /// Last-Modified validator
    pub last_modified: Option<String>,
    /// Write time (epoch ms)
    pub stored_at: i64,
    /// Time to live (ms)
    pub ttl_ms: i64,
}

impl DiskEntry {
    /// Expiry instant (epoch ms)
    #[inline]
    pub fn expires_at(&self) -> i64 {
        self.stored_at.saturating_add(self.ttl_ms)
    }

    /// `now > storedAt + ttlMs`
    #[inline]
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms > self.expires_at()
    }
}

/// Why a cache file could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorruptEntry {
    /// No separator line found
    #[error("body separator not found")]
    MissingSeparator,

    /// A mandatory header is absent
    #[error("missing header field '{0}'")]
    MissingField(&'static str),

    /// A header line is not valid UTF-8 or has no '='
    #[error("malformed header line")]
    MalformedHeader,

    /// A numeric header did not parse
    #[error("invalid value '{value}' for '{field}'")]
    InvalidNumber { field: &'static str, value: String },

    /// Fewer body bytes than announced
    #[error("body truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    /// Body is not valid UTF-8
    #[error("body is not valid UTF-8")]
    InvalidUtf8,
}

/// Header values are single lines
fn header_value(value: Option<&str>) -> String {
    value
        .unwrap_or_default()
        .chars()
        .filter(|c| *c != '\n' && *c != '\r')
        .collect()
}

/// Serialize an entry into the on-disk format
pub fn encode_entry(entry: &DiskEntry) -> Vec<u8> {
    let header = format!(
        "storedAt={}\nttlMs={}\netag={}\nlastModified={}\nbodyLength={}\n{}\n",
        entry.stored_at,
        entry.ttl_ms,
        header_value(entry.etag.as_deref()),
        header_value(entry.last_modified.as_deref()),
        entry.body.len(),
        BODY_SEPARATOR,
    );

    let mut out = Vec::with_capacity(header.len() + entry.body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(entry.body.as_bytes());
    out
}

fn parse_number(field: &'static str, value: &str) -> std::result::Result<i64, CorruptEntry> {
    value.trim().parse().map_err(|_| CorruptEntry::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Parse the on-disk format
///
/// Without a `bodyLength` header the body runs up to the next separator
/// token, which truncates bodies that contain the token themselves.
pub fn decode_entry(bytes: &[u8]) -> std::result::Result<DiskEntry, CorruptEntry> {
    let mut stored_at = None;
    let mut ttl_ms = None;
    let mut etag = None;
    let mut last_modified = None;
    let mut body_length: Option<usize> = None;

    let mut pos = 0;
    let body_start = loop {
        let Some(offset) = bytes[pos..].iter().position(|b| *b == b'\n') else {
            return Err(CorruptEntry::MissingSeparator);
        };
        let line = &bytes[pos..pos + offset];
        let next = pos + offset + 1;

        if line == BODY_SEPARATOR.as_bytes() {
            break next;
        }

        let line = std::str::from_utf8(line).map_err(|_| CorruptEntry::MalformedHeader)?;
        let (key, value) = line.split_once('=').ok_or(CorruptEntry::MalformedHeader)?;
        match key {
            "storedAt" => stored_at = Some(parse_number("storedAt", value)?),
            "ttlMs" => ttl_ms = Some(parse_number("ttlMs", value)?),
            "etag" => etag = Some(value.to_string()),
            "lastModified" => last_modified = Some(value.to_string()),
            "bodyLength" => {
                let len = parse_number("bodyLength", value)?;
                let len = usize::try_from(len).map_err(|_| CorruptEntry::InvalidNumber {
                    field: "bodyLength",
                    value: value.to_string(),
                })?;
                body_length = Some(len);
            }
            _ => {}
        }
        pos = next;
    };

    let rest = &bytes[body_start..];
    let body = match body_length {
        Some(expected) => {
            if rest.len() < expected {
                return Err(CorruptEntry::Truncated {
                    expected,
                    found: rest.len(),
                });
            }
            &rest[..expected]
        }
        None => {
            let token = BODY_SEPARATOR.as_bytes();
            let end = rest
                .windows(token.len())
                .position(|w| w == token)
                .unwrap_or(rest.len());
            &rest[..end]
        }
    };

    let body = String::from_utf8(body.to_vec()).map_err(|_| CorruptEntry::InvalidUtf8)?;

    Ok(DiskEntry {
        body,
        etag: non_empty(etag),
        last_modified: non_empty(last_modified),
        stored_at: stored_at.ok_or(CorruptEntry::MissingField("storedAt"))?,
        ttl_ms: ttl_ms.ok_or(CorruptEntry::MissingField("ttlMs"))?,
    })
}

/// File name for a key: hex SHA-256 plus extension
pub fn file_name_for(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{hex}.{ENTRY_EXTENSION}")
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

fn is_entry_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXTENSION)
}

fn is_tmp_file(path: &Path) -> bool {
    path.to_str().is_some_and(|p| p.ends_with(TMP_SUFFIX))
}

// =============================================================================
// DiskCache
// =============================================================================

/// Durable key -> (body, validators, TTL) store
pub struct DiskCache {
    dir: PathBuf,
    max_bytes: u64,
    clock: SharedClock,
    lock: Mutex<()>,
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("dir", &self.dir)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

impl DiskCache {
    /// Open (creating if needed) a cache directory
    ///
    /// `max_bytes == 0` disables pruning. Leftover temp files from an
    /// interrupted write are swept.
    pub fn open(dir: impl Into<PathBuf>, max_bytes: u64, clock: SharedClock) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let cache = Self {
            dir,
            max_bytes,
            clock,
            lock: Mutex::new(()),
        };
        cache.sweep_tmp_files();
        Ok(cache)
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Byte budget (0 = unbounded)
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Path of the entry file for `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(file_name_for(key))
    }

    /// Entry for `key` if present and not expired
    pub fn get(&self, key: &str) -> Option<DiskEntry> {
        let _guard = self.lock.lock();
        let entry = self.read_locked(key)?;
        if entry.is_expired_at(self.clock.now_ms()) {
            debug!(key, "disk entry expired");
            return None;
        }
        Some(entry)
    }

    /// Entry for `key` regardless of expiry
    pub fn get_stale(&self, key: &str) -> Option<DiskEntry> {
        let _guard = self.lock.lock();
        self.read_locked(key)
    }

    /// Store an entry stamped with the current time
    pub fn put(
        &self,
        key: &str,
        body: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
        ttl_ms: i64,
    ) -> Result<()> {
        if ttl_ms <= 0 {
            return Err(Error::config(format!("TTL must be positive, got {ttl_ms}")));
        }

        let entry = DiskEntry {
            body: body.to_string(),
            etag: etag.map(str::to_string),
            last_modified: last_modified.map(str::to_string),
            stored_at: self.clock.now_ms(),
            ttl_ms,
        };

        let _guard = self.lock.lock();
        self.write_locked(key, &entry)?;
        self.prune_locked(Some(&self.path_for(key)));
        Ok(())
    }

    /// Re-stamp an existing entry with a new TTL starting now
    ///
    /// Returns the refreshed entry, or `None` if nothing was stored.
    pub fn refresh(&self, key: &str, ttl_ms: i64) -> Result<Option<DiskEntry>> {
        if ttl_ms <= 0 {
            return Err(Error::config(format!("TTL must be positive, got {ttl_ms}")));
        }

        let _guard = self.lock.lock();
        let Some(mut entry) = self.read_locked(key) else {
            return Ok(None);
        };
        entry.stored_at = self.clock.now_ms();
        entry.ttl_ms = ttl_ms;
        self.write_locked(key, &entry)?;
        Ok(Some(entry))
    }

    /// Remove one entry; failures are logged
    pub fn invalidate(&self, key: &str) {
        let _guard = self.lock.lock();
        let path = self.path_for(key);
        remove_quietly(&tmp_path(&path));
        remove_quietly(&path);
    }

    /// Remove every entry; failures are logged
    pub fn clear(&self) {
        let _guard = self.lock.lock();
        for path in self.list_paths() {
            if is_entry_file(&path) || is_tmp_file(&path) {
                remove_quietly(&path);
            }
        }
    }

    /// Total bytes of committed entry files
    pub fn cache_size(&self) -> u64 {
        let _guard = self.lock.lock();
        self.entry_stats().iter().map(|f| f.len).sum()
    }

    /// Number of committed entry files
    pub fn len(&self) -> usize {
        let _guard = self.lock.lock();
        self.entry_stats().len()
    }

    /// Check if no entry is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Prune to the byte budget; returns how many files were removed
    pub fn prune_if_needed(&self) -> usize {
        let _guard = self.lock.lock();
        self.prune_locked(None)
    }

    // -------------------------------------------------------------------------
    // Internals (caller holds the lock)
    // -------------------------------------------------------------------------

    fn read_locked(&self, key: &str) -> Option<DiskEntry> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read cache file");
                return None;
            }
        };

        match decode_entry(&bytes) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt cache file, deleting");
                remove_quietly(&path);
                None
            }
        }
    }

    fn write_locked(&self, key: &str, entry: &DiskEntry) -> Result<()> {
        let path = self.path_for(key);
        let tmp = tmp_path(&path);

        if let Err(e) = fs::write(&tmp, encode_entry(entry)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        if let Err(rename_err) = fs::rename(&tmp, &path) {
            debug!(error = %rename_err, "rename failed, falling back to copy");
            let copied = fs::copy(&tmp, &path);
            let _ = fs::remove_file(&tmp);
            copied?;
        }
        Ok(())
    }

    /// `just_written` sorts as the newest file even when mtimes tie
    fn prune_locked(&self, just_written: Option<&Path>) -> usize {
        if self.max_bytes == 0 {
            return 0;
        }

        let mut files = self.entry_stats();
        if let Some(written) = just_written {
            let latest = files.iter().map(|f| f.modified).max();
            if let (Some(latest), Some(stat)) =
                (latest, files.iter_mut().find(|f| f.path == written))
            {
                stat.modified = latest + Duration::from_nanos(1);
            }
        }

        let victims = prune_plan(files, self.max_bytes);
        let mut removed = 0;
        for path in victims {
            if remove_quietly(&path) {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, budget = self.max_bytes, "pruned disk cache");
        }
        removed
    }

    fn list_paths(&self) -> Vec<PathBuf> {
        match fs::read_dir(&self.dir) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Failed to list cache directory");
                Vec::new()
            }
        }
    }

    fn entry_stats(&self) -> Vec<FileStat> {
        self.list_paths()
            .into_iter()
            .filter(|p| is_entry_file(p))
            .filter_map(|path| {
                let meta = fs::metadata(&path).ok()?;
                if !meta.is_file() {
                    return None;
                }
                Some(FileStat {
                    len: meta.len(),
                    modified: meta.modified().ok()?,
                    path,
                })
            })
            .collect()
    }

    fn sweep_tmp_files(&self) {
        let _guard = self.lock.lock();
        for path in self.list_paths() {
            if is_tmp_file(&path) {
                debug!(path = %path.display(), "removing leftover temp file");
                remove_quietly(&path);
            }
        }
    }
}

/// Delete a file, logging anything but NotFound. Returns true if removed.
fn remove_quietly(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to delete cache file");
            false
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
