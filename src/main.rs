//! tiercache CLI
//!
//! Fetch a URL through the three-tier cache, the way a content plugin would.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          tiercache                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  Settings /  │───▶│  Shared      │───▶│  Cache-aware │──▶ reqwest
//! │  │  --level     │    │  HTTP pool   │    │  client      │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use reqwest::header::{HeaderName, ETAG, LAST_MODIFIED};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::{
    CacheConfig, CacheEntry, CacheLevel, CacheSettings, ConditionalHeaders, FetchError,
    FetchOutcome, FetchResult, Fetcher, GetOptions, SharedHttpPool,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercache - cached HTTP GET with memory, disk and network tiers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL to fetch
    url: String,

    /// Root directory holding one cache directory per plugin
    #[arg(long, env = "TIERCACHE_ROOT", default_value = ".tiercache")]
    cache_root: PathBuf,

    /// Plugin identity (selects the cache directory)
    #[arg(long, env = "TIERCACHE_PLUGIN", default_value = "default")]
    plugin: String,

    /// Cache level (MINIMAL, BALANCED, AGGRESSIVE); overrides the settings file
    #[arg(long, env = "TIERCACHE_LEVEL")]
    level: Option<String>,

    /// JSON settings file holding `cache_level`
    #[arg(long, env = "TIERCACHE_SETTINGS")]
    settings: Option<PathBuf>,

    /// Skip both cache tiers
    #[arg(long)]
    force_refresh: bool,

    /// Serve stale entries immediately and revalidate in the background
    #[arg(long, conflicts_with = "force_refresh")]
    swr: bool,

    /// Detail URLs to warm after the main fetch
    #[arg(long, num_args = 1..)]
    prefetch: Vec<String>,

    /// Request timeout in seconds
    #[arg(long, env = "TIERCACHE_TIMEOUT_SECONDS", default_value = "30")]
    timeout_seconds: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Network Tier
// =============================================================================

/// Plain GET of one URL, forwarding the cache's validators
struct HttpFetcher {
    http: reqwest::Client,
    url: String,
}

impl HttpFetcher {
    fn shared(http: &reqwest::Client, url: &str) -> Arc<dyn Fetcher> {
        Arc::new(Self {
            http: http.clone(),
            url: url.to_string(),
        })
    }

    async fn get(&self, headers: ConditionalHeaders) -> tiercache::Result<FetchResult> {
        let mut request = self.http.get(&self.url);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(ETAG);
        let last_modified = header(LAST_MODIFIED);
        let body = response.text().await?;

        Ok(FetchResult {
            body,
            status_code: status,
            etag,
            last_modified,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, headers: ConditionalHeaders) -> FetchOutcome {
        match self.get(headers).await {
            Ok(result) => Ok(Some(result)),
            Err(e) => Err(FetchError::Failed(anyhow::Error::new(e))),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = resolve_config(&args);
    info!("Starting tiercache");
    info!("  Cache root: {}", args.cache_root.display());
    info!("  Plugin: {}", args.plugin);
    info!("  Level: {}", config.level());

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout_seconds))
        .user_agent(concat!("tiercache/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let pool = SharedHttpPool::new(&args.cache_root);
    let client = pool.get_client(&args.plugin, config)?;
    let fetcher = HttpFetcher::shared(&http, &args.url);

    let entry = if args.swr {
        client
            .stale_while_revalidate(&args.url, None, fetcher)
            .await?
    } else {
        let options = GetOptions {
            force_refresh: args.force_refresh,
            ttl_ms: None,
        };
        client
            .cached_get_with(&args.url, options, fetcher.as_ref())
            .await?
    };

    if !args.prefetch.is_empty() {
        if let Some(prefetcher) = pool.get_prefetcher(&args.plugin) {
            let scheduled = prefetcher
                .prefetch_urls(&args.prefetch, |url| HttpFetcher::shared(&http, url));
            info!(scheduled, requested = args.prefetch.len(), "Prefetching detail pages");
            prefetcher.wait_idle().await;
        }
    }

    // Let any background revalidation land before exiting
    client.wait_idle().await;

    let stats = client.stats();
    info!(
        memory_hits = stats.memory_hits,
        disk_hits = stats.disk_hits,
        network_fetches = stats.network_fetches,
        not_modified = stats.not_modified,
        offline_fallbacks = stats.offline_fallbacks,
        "Cache statistics"
    );

    match entry {
        Some(entry) => {
            print_entry(&entry);
            Ok(())
        }
        None => {
            warn!(url = %args.url, "Nothing cached and network unavailable");
            anyhow::bail!("no response for {}", args.url)
        }
    }
}

/// `--level` wins over the settings file, which wins over the default
fn resolve_config(args: &Args) -> CacheConfig {
    if let Some(level) = &args.level {
        return CacheConfig::for_level(CacheLevel::from_key(level));
    }
    match &args.settings {
        Some(path) => CacheConfig::from_settings(&CacheSettings::load(path)),
        None => CacheConfig::default(),
    }
}

fn print_entry(entry: &CacheEntry) {
    eprintln!("status: {}", entry.status_code);
    if let Some(etag) = &entry.etag {
        eprintln!("etag: {}", etag);
    }
    if let Some(last_modified) = &entry.last_modified {
        eprintln!("last-modified: {}", last_modified);
    }
    if entry.is_offline_fallback {
        eprintln!("offline fallback: serving stale copy");
    }
    println!("{}", entry.body);
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "rustls=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // Logs go to stderr; stdout carries the body
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
