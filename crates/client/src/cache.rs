//! Offline cache proxy for outbound fetches.
//!
//! API calls are network-first with a cached fallback, static assets are
//! cache-first, and everything else goes straight to the network. Buckets are
//! named per generation; activating a new generation evicts every other bucket.
//! Buckets live in process memory, so a restart starts from empty storage.

use crate::error::ClientResult;
use crate::fetch::{FetchRequest, FetchResponse, Fetcher, RequestMode, StreamedResponse};
use reqwest::Method;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const CACHE_VERSION: &str = "v3";
const CACHE_PREFIX: &str = "portico";

const AUTH_PREFIX: &str = "/api/auth";
const API_PREFIX: &str = "/api/";
const STATIC_EXTENSIONS: &[&str] = &[".js", ".css", ".svg", ".png", ".jpg", ".webp", ".woff2"];

/// Names of the two buckets that belong to the current generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
    pub static_assets: String,
    pub api: String,
}

impl Default for CacheNames {
    fn default() -> Self {
        Self::for_version(CACHE_VERSION)
    }
}

impl CacheNames {
    pub fn for_version(version: &str) -> Self {
        Self {
            static_assets: format!("{}-{}", CACHE_PREFIX, version),
            api: format!("{}-api-{}", CACHE_PREFIX, version),
        }
    }

    fn is_current(&self, name: &str) -> bool {
        name == self.static_assets || name == self.api
    }
}

#[derive(Debug, Clone, Default)]
pub struct CachePolicy {
    /// Oldest API entry that may still be served as an offline fallback.
    /// `None` keeps entries until their generation is evicted.
    pub api_max_age: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub response: FetchResponse,
    pub stored_at: Instant,
}

struct Bucket {
    name: String,
    entries: HashMap<String, CacheEntry>,
}

/// Named buckets of cached responses, searched in creation order.
#[derive(Default)]
pub struct CacheStorage {
    buckets: RwLock<Vec<Bucket>>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.buckets.read().await.iter().map(|b| b.name.clone()).collect()
    }

    /// Creates the bucket if needed.
    pub async fn open(&self, name: &str) {
        let mut buckets = self.buckets.write().await;
        if !buckets.iter().any(|b| b.name == name) {
            buckets.push(Bucket {
                name: name.to_string(),
                entries: HashMap::new(),
            });
        }
    }

    pub async fn delete(&self, name: &str) -> bool {
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|b| b.name != name);
        buckets.len() != before
    }

    pub async fn put(&self, name: &str, key: String, response: FetchResponse) {
        let mut buckets = self.buckets.write().await;
        let entry = CacheEntry {
            response,
            stored_at: Instant::now(),
        };
        match buckets.iter_mut().find(|b| b.name == name) {
            Some(bucket) => {
                bucket.entries.insert(key, entry);
            }
            None => {
                let mut entries = HashMap::new();
                entries.insert(key, entry);
                buckets.push(Bucket {
                    name: name.to_string(),
                    entries,
                });
            }
        }
    }

    /// First match across all buckets.
    pub async fn match_key(&self, key: &str) -> Option<CacheEntry> {
        self.buckets
            .read()
            .await
            .iter()
            .find_map(|b| b.entries.get(key).cloned())
    }

    pub async fn len(&self, name: &str) -> usize {
        self.buckets
            .read()
            .await
            .iter()
            .find(|b| b.name == name)
            .map(|b| b.entries.len())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Bypass,
    NetworkFirst,
    CacheFirst,
}

/// Chooses a strategy from the request shape alone.
pub fn classify(request: &FetchRequest) -> Strategy {
    if request.method != Method::GET || request.mode == RequestMode::Navigate {
        return Strategy::Bypass;
    }

    let path = request.url.path();
    if path.starts_with(AUTH_PREFIX) {
        return Strategy::Bypass;
    }
    if path.starts_with(API_PREFIX) {
        return Strategy::NetworkFirst;
    }
    if STATIC_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return Strategy::CacheFirst;
    }
    Strategy::Bypass
}

#[derive(Debug)]
pub enum Interception {
    /// The proxy does not handle this request; the caller goes to the network.
    PassThrough,
    /// The proxy answered. `None` means the network failed and nothing was cached.
    Respond(Option<FetchResponse>),
}

/// Result of [`OfflineCache::serve`].
pub enum Served {
    /// Passed through; the body is read from the network as it arrives.
    Streamed(StreamedResponse),
    /// Answered by a caching strategy. `None` means no match.
    Buffered(Option<FetchResponse>),
}

pub struct OfflineCache<F> {
    fetcher: F,
    storage: CacheStorage,
    names: CacheNames,
    policy: CachePolicy,
    active: AtomicBool,
}

impl<F: Fetcher> OfflineCache<F> {
    pub fn new(fetcher: F, names: CacheNames, policy: CachePolicy) -> Self {
        Self {
            fetcher,
            storage: CacheStorage::new(),
            names,
            policy,
            active: AtomicBool::new(false),
        }
    }

    /// Uses an existing storage, e.g. one holding buckets from an earlier generation.
    pub fn with_storage(mut self, storage: CacheStorage) -> Self {
        self.storage = storage;
        self
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    pub fn names(&self) -> &CacheNames {
        &self.names
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Installs without waiting for older generations to release their clients.
    pub async fn install(&self) -> Vec<String> {
        info!("Installing offline cache {}", CACHE_VERSION);
        self.activate().await
    }

    /// Evicts every bucket outside the current generation and starts
    /// intercepting immediately. Returns the deleted bucket names.
    pub async fn activate(&self) -> Vec<String> {
        let mut deleted = Vec::new();
        for name in self.storage.keys().await {
            if self.names.is_current(&name) {
                continue;
            }
            info!("Deleting old cache: {}", name);
            if self.storage.delete(&name).await {
                deleted.push(name);
            }
        }
        self.storage.open(&self.names.static_assets).await;
        self.storage.open(&self.names.api).await;
        self.active.store(true, Ordering::Release);
        deleted
    }

    pub async fn handle(&self, request: &FetchRequest) -> ClientResult<Interception> {
        if !self.is_active() {
            return Ok(Interception::PassThrough);
        }

        match classify(request) {
            Strategy::Bypass => Ok(Interception::PassThrough),
            Strategy::NetworkFirst => Ok(Interception::Respond(self.network_first(request).await)),
            Strategy::CacheFirst => self.cache_first(request).await.map(|r| Interception::Respond(Some(r))),
        }
    }

    /// Intercepts, and performs pass-through requests directly.
    pub async fn fetch(&self, request: &FetchRequest) -> ClientResult<Option<FetchResponse>> {
        match self.handle(request).await? {
            Interception::PassThrough => self.fetcher.fetch(request).await.map(Some),
            Interception::Respond(response) => Ok(response),
        }
    }

    /// Like `fetch`, but pass-through responses keep a streaming body.
    pub async fn serve(&self, request: &FetchRequest) -> ClientResult<Served> {
        match self.handle(request).await? {
            Interception::PassThrough => self.fetcher.open(request).await.map(Served::Streamed),
            Interception::Respond(response) => Ok(Served::Buffered(response)),
        }
    }

    async fn network_first(&self, request: &FetchRequest) -> Option<FetchResponse> {
        let key = request.cache_key();
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.is_cacheable() {
                    self.storage.put(&self.names.api, key, response.clone()).await;
                }
                Some(response)
            }
            Err(e) => {
                debug!("Network failed for {}, trying cache: {}", request.url, e);
                let entry = self.storage.match_key(&key).await?;
                if let Some(max_age) = self.policy.api_max_age {
                    if entry.stored_at.elapsed() > max_age {
                        debug!("Cached {} is older than {:?}", request.url, max_age);
                        return None;
                    }
                }
                Some(entry.response)
            }
        }
    }

    async fn cache_first(&self, request: &FetchRequest) -> ClientResult<FetchResponse> {
        let key = request.cache_key();
        if let Some(entry) = self.storage.match_key(&key).await {
            return Ok(entry.response);
        }

        let response = self.fetcher.fetch(request).await?;
        if response.is_cacheable() {
            self.storage
                .put(&self.names.static_assets, key, response.clone())
                .await;
        }
        Ok(response)
    }
}
