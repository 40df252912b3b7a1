//! Versioned cache storage.
//!
//! ```text
//! CacheStorage (caches)
//!     ├── app-cache-v1 ── Cache: URL → Response
//!     └── app-cache-v2 ── Cache: URL → Response
//! ```
//!
//! A [`CacheStore`] is the handle to the current version's cache. Storage is
//! shared between worker versions so a newer worker can prune what an older
//! one left behind.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use hashbrown::HashMap;
use http::{Method, StatusCode};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;
use watch_net::{Fetcher, Request, Response};

use crate::ServiceWorkerError;

/// Storage shared by every worker version on an origin.
pub type SharedCacheStorage = Arc<RwLock<CacheStorage>>;

/// A cached response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Stored response.
    pub response: Response,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: i64,
}

/// A named cache.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Maximum number of entries.
    quota: Option<usize>,

    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str, quota: Option<usize>) -> Self {
        Self {
            name: name.to_string(),
            quota,
            entries: HashMap::new(),
        }
    }

    /// Match a cache key.
    pub fn match_key(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Insert or overwrite an entry.
    pub fn put(&mut self, key: String, response: Response) -> Result<(), ServiceWorkerError> {
        if let Some(quota) = self.quota {
            if !self.entries.contains_key(&key) && self.entries.len() >= quota {
                return Err(ServiceWorkerError::CacheError(format!(
                    "quota of {quota} entries exceeded in {}",
                    self.name
                )));
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                response,
                cached_at: Utc::now().timestamp_millis(),
            },
        );
        Ok(())
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Get all keys (URLs).
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Every named cache on the origin (the `caches` global).
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create storage ready to be shared between worker versions.
    pub fn shared() -> SharedCacheStorage {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str, quota: Option<usize>) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name, quota))
    }

    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// Get all cache names.
    pub fn keys(&self) -> Vec<String> {
        self.caches.keys().cloned().collect()
    }
}

/// Outcome of an install-time precache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrecacheReport {
    /// Entries written.
    pub stored: usize,
    /// URLs that could not be fetched or stored, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Cache key for a URL: the full URL without fragment.
pub fn cache_key(url: &Url) -> String {
    let mut key = url.clone();
    key.set_fragment(None);
    key.to_string()
}

/// Handle to the current version's cache.
#[derive(Debug, Clone)]
pub struct CacheStore {
    storage: SharedCacheStorage,
    name: Arc<str>,
    quota: Option<usize>,
}

impl CacheStore {
    /// Handle to the named cache. Nothing is created until [`CacheStore::create`].
    pub fn new(storage: SharedCacheStorage, name: &str, quota: Option<usize>) -> Self {
        Self {
            storage,
            name: Arc::from(name),
            quota,
        }
    }

    /// Open the named cache, creating it on first call.
    pub async fn open(storage: SharedCacheStorage, name: &str, quota: Option<usize>) -> Self {
        let store = Self::new(storage, name, quota);
        store.create().await;
        store
    }

    /// Create the cache if it does not exist. Returns whether it was created.
    pub async fn create(&self) -> bool {
        let mut caches = self.storage.write().await;
        let existed = caches.has(&self.name);
        caches.open(&self.name, self.quota);
        if !existed {
            debug!(cache = %self.name, "Cache created");
        }
        !existed
    }

    /// Whether the cache currently exists in storage.
    pub async fn exists(&self) -> bool {
        self.storage.read().await.has(&self.name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage(&self) -> &SharedCacheStorage {
        &self.storage
    }

    /// Look up a GET request.
    pub async fn get(&self, request: &Request) -> Option<Response> {
        if request.method != Method::GET {
            return None;
        }
        self.get_url(&request.url).await
    }

    /// Look up a URL.
    pub async fn get_url(&self, url: &Url) -> Option<Response> {
        let caches = self.storage.read().await;
        caches
            .get(&self.name)
            .and_then(|cache| cache.match_key(&cache_key(url)))
            .map(|entry| entry.response.clone())
    }

    /// Store a response for a GET request, overwriting any previous entry.
    pub async fn put(&self, request: &Request, response: Response) -> Result<(), ServiceWorkerError> {
        if request.method != Method::GET {
            return Err(ServiceWorkerError::CacheError(format!(
                "only GET requests can be cached, got {}",
                request.method
            )));
        }
        if response.status == StatusCode::PARTIAL_CONTENT {
            return Err(ServiceWorkerError::CacheError(
                "partial responses cannot be cached".to_string(),
            ));
        }

        let key = cache_key(&request.url);
        let mut caches = self.storage.write().await;
        let cache = caches
            .caches
            .get_mut(&*self.name)
            .ok_or_else(|| ServiceWorkerError::CacheError(format!("{} was deleted", self.name)))?;
        cache.put(key, response)
    }

    /// Fetch and store every URL. One failure never stops the others.
    pub async fn precache(&self, fetcher: &dyn Fetcher, urls: &[Url]) -> PrecacheReport {
        let attempts = urls.iter().map(|url| async move {
            let request = Request::get(url.clone());
            let result = match fetcher.fetch(request.clone()).await {
                Ok(response) if response.ok() => self.put(&request, response).await,
                Ok(response) => Err(ServiceWorkerError::NetworkError(format!(
                    "bad status {}",
                    response.status
                ))),
                Err(e) => Err(e.into()),
            };
            (url, result)
        });

        let mut report = PrecacheReport::default();
        for (url, result) in join_all(attempts).await {
            match result {
                Ok(()) => report.stored += 1,
                Err(e) => {
                    warn!(url = %url, error = %e, "Precache failed");
                    report.failed.push((url.to_string(), e.to_string()));
                }
            }
        }

        info!(
            cache = %self.name,
            stored = report.stored,
            failed = report.failed.len(),
            "Precache finished"
        );
        report
    }

    /// Delete every cache whose name differs from `current`.
    pub async fn prune(storage: &SharedCacheStorage, current: &str) -> Vec<String> {
        let mut caches = storage.write().await;
        let stale: Vec<String> = caches
            .keys()
            .into_iter()
            .filter(|name| name != current)
            .collect();
        for name in &stale {
            caches.delete(name);
            info!(cache = %name, "Deleted stale cache");
        }
        stale
    }

    /// Number of entries in the current cache.
    pub async fn len(&self) -> usize {
        self.storage
            .read()
            .await
            .get(&self.name)
            .map(Cache::len)
            .unwrap_or(0)
    }

    pub fn quota(&self) -> Option<usize> {
        self.quota
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use http::HeaderMap;
    use watch_net::NetError;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn response(u: &str, status: u16, body: &'static str) -> Response {
        Response::new(
            url(u),
            StatusCode::from_u16(status).unwrap(),
            HeaderMap::new(),
            Bytes::from_static(body.as_bytes()),
        )
    }

    /// Serves every path except the ones listed as failing.
    struct PathFetcher {
        rejected: &'static str,
        not_found: &'static str,
    }

    impl Fetcher for PathFetcher {
        fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
            async move {
                match request.url.path() {
                    p if p == self.rejected => Err(NetError::RequestFailed("offline".into())),
                    p if p == self.not_found => Ok(response(request.url.as_str(), 404, "")),
                    _ => Ok(response(request.url.as_str(), 200, "ok")),
                }
            }
            .boxed()
        }
    }

    #[test]
    fn test_cache_put_and_match() {
        let mut cache = Cache::new("v1", None);
        cache
            .put(
                "https://example.com/style.css".to_string(),
                response("https://example.com/style.css", 200, "body{}"),
            )
            .unwrap();

        assert!(cache.match_key("https://example.com/style.css").is_some());
        assert!(cache.match_key("https://example.com/other.css").is_none());
        assert!(cache.delete("https://example.com/style.css"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_quota_allows_overwrite() {
        let mut cache = Cache::new("v1", Some(1));
        let key = "https://example.com/a.js".to_string();
        cache.put(key.clone(), response(&key, 200, "1")).unwrap();
        cache.put(key.clone(), response(&key, 200, "2")).unwrap();

        let err = cache
            .put("https://example.com/b.js".to_string(), response(&key, 200, "3"))
            .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::CacheError(_)));
        assert_eq!(cache.match_key(&key).unwrap().response.body, "2");
    }

    #[test]
    fn test_cache_key_drops_fragment() {
        assert_eq!(
            cache_key(&url("https://example.com/page?q=1#top")),
            "https://example.com/page?q=1"
        );
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let storage = CacheStorage::shared();
        let first = CacheStore::open(storage.clone(), "app-cache-v1", None).await;
        let request = Request::get(url("https://example.com/app.js"));
        first
            .put(&request, response("https://example.com/app.js", 200, "js"))
            .await
            .unwrap();

        let second = CacheStore::open(storage.clone(), "app-cache-v1", None).await;
        assert!(second.get(&request).await.is_some());
        assert_eq!(storage.read().await.keys().len(), 1);
    }

    #[tokio::test]
    async fn test_put_rejects_non_get_and_partial() {
        let store = CacheStore::open(CacheStorage::shared(), "app-cache-v1", None).await;
        let u = url("https://example.com/video.webm");

        let post = Request::post(u.clone(), Bytes::new());
        assert!(store.put(&post, response(u.as_str(), 200, "")).await.is_err());

        let get = Request::get(u.clone());
        assert!(store.put(&get, response(u.as_str(), 206, "")).await.is_err());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_put_after_prune_fails() {
        let storage = CacheStorage::shared();
        let old = CacheStore::open(storage.clone(), "app-cache-v1", None).await;
        CacheStore::prune(&storage, "app-cache-v2").await;

        let request = Request::get(url("https://example.com/"));
        let err = old
            .put(&request, response("https://example.com/", 200, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::CacheError(_)));
        assert!(!storage.read().await.has("app-cache-v1"));
    }

    #[tokio::test]
    async fn test_precache_partial_failure() {
        let store = CacheStore::open(CacheStorage::shared(), "app-cache-v1", None).await;
        let fetcher = PathFetcher {
            rejected: "/icons/favicon.ico",
            not_found: "/icons/missing.png",
        };
        let urls: Vec<Url> = ["/", "/icons/favicon.ico", "/icons/missing.png", "/manifest.webmanifest"]
            .iter()
            .map(|p| url("https://example.com").join(p).unwrap())
            .collect();

        let report = store.precache(&fetcher, &urls).await;

        assert_eq!(report.stored, 2);
        assert_eq!(report.failed.len(), 2);
        assert!(store.get_url(&url("https://example.com/")).await.is_some());
        assert!(store
            .get_url(&url("https://example.com/manifest.webmanifest"))
            .await
            .is_some());
        assert!(store
            .get_url(&url("https://example.com/icons/favicon.ico"))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_prune_keeps_only_current() {
        let storage = CacheStorage::shared();
        for name in ["app-cache-v0", "app-cache-v1", "other-cache", "app-cache-v2"] {
            CacheStore::open(storage.clone(), name, None).await;
        }

        let mut deleted = CacheStore::prune(&storage, "app-cache-v2").await;
        deleted.sort();

        assert_eq!(deleted, vec!["app-cache-v0", "app-cache-v1", "other-cache"]);
        assert_eq!(storage.read().await.keys(), vec!["app-cache-v2".to_string()]);
    }
}
