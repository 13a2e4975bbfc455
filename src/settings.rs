//! Persisted cache settings
//!
//! A tiny JSON document holding the user's chosen cache level:
//!
//! ```json
//! { "cache_level": "BALANCED" }
//! ```

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::cache::{CacheConfig, CacheLevel};
use crate::error::Result;

/// User-editable cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// One of MINIMAL / BALANCED / AGGRESSIVE, any case
    #[serde(default = "default_level_key")]
    pub cache_level: String,
}

fn default_level_key() -> String {
    CacheLevel::default().as_key().to_string()
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_level: default_level_key(),
        }
    }
}

impl CacheSettings {
    /// Settings selecting `level`
    pub fn new(level: CacheLevel) -> Self {
        Self {
            cache_level: level.as_key().to_string(),
        }
    }

    /// Read settings from `path`
    ///
    /// A missing or unreadable file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No settings file, using defaults");
                return Self::default();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read settings, using defaults");
                return Self::default();
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Malformed settings, using defaults");
                Self::default()
            }
        }
    }

    /// Write settings atomically (temp file in the same directory, then persist)
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                parent
            }
            None => Path::new("."),
        };

        let json = serde_json::to_vec_pretty(self)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Parsed level (unknown keys are MINIMAL)
    pub fn level(&self) -> CacheLevel {
        CacheLevel::from_key(&self.cache_level)
    }
}

impl CacheConfig {
    /// Preset selected by persisted settings
    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::for_level(settings.level())
    }
}
