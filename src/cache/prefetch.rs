//! Background cache warming

use std::sync::Arc;

use tracing::{debug, warn};

use super::client::{CacheAwareClient, GetOptions};
use super::entry::Fetcher;
use super::scope::TaskScope;
use crate::error::Error;

/// Warms entries the caller expects to need soon
///
/// Work runs on a child of the client's scope: closing the client stops it,
/// and so does [`Prefetcher::cancel`].
#[derive(Debug)]
pub struct Prefetcher {
    client: Arc<CacheAwareClient>,
    scope: TaskScope,
}

impl Prefetcher {
    /// Prefetcher bound to `client`, running on a child of its scope
    pub fn new(client: Arc<CacheAwareClient>) -> Self {
        let scope = client.child_scope();
        Self { client, scope }
    }

    /// False at the MINIMAL level
    pub fn is_enabled(&self) -> bool {
        self.client.config().prefetch_enabled()
    }

    /// Warm one URL in the background. Returns true if work was scheduled.
    ///
    /// Needs a Tokio runtime; called outside one, nothing is scheduled.
    /// A response that arrives after [`Prefetcher::cancel`] is discarded.
    pub fn prefetch_url(&self, url: &str, fetcher: Arc<dyn Fetcher>) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let client = Arc::clone(&self.client);
        let scope = self.scope.clone();
        let url = url.to_string();

        self.scope.spawn("prefetch", async move {
            let options = GetOptions::default();
            match client.cached_get_on(&url, options, fetcher.as_ref(), &scope).await {
                Ok(Some(_)) => debug!(plugin = client.name(), url, "prefetched"),
                Ok(None) => debug!(plugin = client.name(), url, "prefetch produced nothing"),
                Err(Error::Cancelled) => debug!(plugin = client.name(), url, "prefetch cancelled"),
                Err(e) => warn!(plugin = client.name(), url, error = %e, "prefetch failed"),
            }
        })
    }

    /// Warm detail pages, capped at the level's detail-prefetch limit
    ///
    /// `fetcher_for` builds the fetcher for each URL. Returns how many URLs
    /// were scheduled.
    pub fn prefetch_urls<I, S, F>(&self, urls: I, fetcher_for: F) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&str) -> Arc<dyn Fetcher>,
    {
        if !self.is_enabled() {
            return 0;
        }

        let limit = self.client.config().max_detail_prefetch();
        let mut scheduled = 0;
        for url in urls.into_iter().take(limit) {
            let url = url.as_ref();
            if self.prefetch_url(url, fetcher_for(url)) {
                scheduled += 1;
            }
        }
        scheduled
    }

    /// Stop all outstanding prefetch work. Idempotent.
    pub fn cancel(&self) {
        self.scope.cancel();
    }

    /// True once this prefetcher or its client was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Wait for scheduled prefetches to settle
    pub async fn wait_idle(&self) {
        self.scope.wait_idle().await;
    }

    /// The client prefetched entries land in
    pub fn client(&self) -> &Arc<CacheAwareClient> {
        &self.client
    }
}
