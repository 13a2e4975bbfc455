//! Cache Entry Types
//!
//! Values handed to callers, the result of one network attempt, and the
//! fetch contract the cache consumes from the network layer.

use std::collections::BTreeMap;
use std::future::Future;

use async_trait::async_trait;

/// Request header carrying the stored ETag
pub const IF_NONE_MATCH: &str = "If-None-Match";

/// Request header carrying the stored Last-Modified value
pub const IF_MODIFIED_SINCE: &str = "If-Modified-Since";

/// HTTP 304 Not Modified
pub const STATUS_NOT_MODIFIED: u16 = 304;

/// Conditional request headers passed to a [`Fetcher`]
///
/// Empty when nothing is cached for the URL, otherwise contains
/// [`IF_NONE_MATCH`] and/or [`IF_MODIFIED_SINCE`].
pub type ConditionalHeaders = BTreeMap<String, String>;

/// A cached response as returned to callers
///
/// Built fresh on every read; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Response body
    pub body: String,
    /// URL the entry was fetched from
    pub url: String,
    /// HTTP status of the response that produced the body
    pub status_code: u16,
    /// ETag validator
    pub etag: Option<String>,
    /// Last-Modified validator
    pub last_modified: Option<String>,
    /// True when served because the network attempt failed
    pub is_offline_fallback: bool,
}

impl CacheEntry {
    /// Copy of this entry flagged as an offline fallback
    pub fn as_offline_fallback(&self) -> Self {
        Self {
            is_offline_fallback: true,
            ..self.clone()
        }
    }
}

/// One completed network attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    /// Response body (empty for a 304)
    pub body: String,
    /// HTTP status code
    pub status_code: u16,
    /// ETag response header
    pub etag: Option<String>,
    /// Last-Modified response header
    pub last_modified: Option<String>,
}

impl FetchResult {
    /// Create a result without validators
    pub fn new(body: impl Into<String>, status_code: u16) -> Self {
        Self {
            body: body.into(),
            status_code,
            etag: None,
            last_modified: None,
        }
    }

    /// A bodiless 304 response
    pub fn not_modified() -> Self {
        Self::new(String::new(), STATUS_NOT_MODIFIED)
    }

    /// Attach an ETag
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Attach a Last-Modified value
    pub fn with_last_modified(mut self, last_modified: impl Into<String>) -> Self {
        self.last_modified = Some(last_modified.into());
        self
    }

    /// True for 304 Not Modified
    #[inline]
    pub fn is_not_modified(&self) -> bool {
        self.status_code == STATUS_NOT_MODIFIED
    }

    /// True for any 2xx status
    #[inline]
    pub fn is_success(&self) -> bool {
        (200..=299).contains(&self.status_code)
    }
}

/// Why a network attempt produced no result
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Cooperative cancellation; always propagated, never treated as a failure
    #[error("fetch cancelled")]
    Cancelled,

    /// Any other failure (DNS, TLS, timeout, ...)
    #[error("fetch failed: {0}")]
    Failed(#[from] anyhow::Error),
}

/// What a [`Fetcher`] returns. `Ok(None)` also means the attempt failed.
pub type FetchOutcome = Result<Option<FetchResult>, FetchError>;

/// Network tier, supplied by the caller
///
/// Receives the conditional headers derived from any stale disk entry and
/// performs one network attempt. Transport concerns (TLS, redirects,
/// retries) live entirely behind this trait.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform one network attempt
    async fn fetch(&self, headers: ConditionalHeaders) -> FetchOutcome;
}

#[async_trait]
impl<F, Fut> Fetcher for F
where
    F: Fn(ConditionalHeaders) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchOutcome> + Send + 'static,
{
    async fn fetch(&self, headers: ConditionalHeaders) -> FetchOutcome {
        (self)(headers).await
    }
}

// =============================================================================
// Tests
// =============================================================================
