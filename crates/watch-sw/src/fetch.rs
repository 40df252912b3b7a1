//! Runtime caching for intercepted requests.
//!
//! Only same-origin GET requests are considered. Documents are served
//! network-first, static assets cache-first with background revalidation,
//! and anything else is left to the host.

use std::sync::{Arc, LazyLock};

use http::Method;
use regex::Regex;
use tracing::{debug, trace, warn};
use url::Url;
use watch_net::{Fetcher, Request, Response};

use crate::cache::CacheStore;
use crate::config::WorkerConfig;
use crate::event::ExtendableEvent;
use crate::ServiceWorkerError;

/// Matched against the URL path only, so query strings never affect it.
static ASSET_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\.(png|jpg|jpeg|svg|gif|webp|ico|css|js|json|webmanifest)$")
        .expect("asset pattern is a valid regex")
});

/// Whether a URL path looks like a static file.
pub fn is_static_asset(url: &Url) -> bool {
    ASSET_PATTERN.is_match(url.path())
}

/// How the interceptor treats a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Non-GET or cross-origin: never touched.
    Bypass,
    /// Document load: network-first.
    Navigation,
    /// Static file: cache-first with background revalidation.
    StaticAsset,
    /// Same-origin GET of unknown type: left to the host.
    Unmatched,
}

impl RequestClass {
    pub fn is_intercepted(self) -> bool {
        matches!(self, RequestClass::Navigation | RequestClass::StaticAsset)
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// The cached site root stood in for an uncached document.
    CachedRoot,
    /// Synthesized offline document.
    OfflineFallback,
}

/// Result of offering a request to the interceptor.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not intercepted; the host applies its default handling.
    Passthrough,
    /// The worker answered the request.
    Responded {
        response: Response,
        source: ResponseSource,
    },
}

impl FetchOutcome {
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchOutcome::Passthrough => None,
            FetchOutcome::Responded { response, .. } => Some(response),
        }
    }

    pub fn source(&self) -> Option<ResponseSource> {
        match self {
            FetchOutcome::Passthrough => None,
            FetchOutcome::Responded { source, .. } => Some(*source),
        }
    }
}

/// Applies the caching strategy for each request class.
#[derive(Clone)]
pub struct FetchInterceptor {
    config: Arc<WorkerConfig>,
    store: CacheStore,
    fetcher: Arc<dyn Fetcher>,
}

impl FetchInterceptor {
    pub fn new(config: Arc<WorkerConfig>, store: CacheStore, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config,
            store,
            fetcher,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn classify(&self, request: &Request) -> RequestClass {
        if request.method != Method::GET || !self.config.is_same_origin(&request.url) {
            RequestClass::Bypass
        } else if request.is_navigation() {
            RequestClass::Navigation
        } else if is_static_asset(&request.url) {
            RequestClass::StaticAsset
        } else {
            RequestClass::Unmatched
        }
    }

    /// Handle one request. Cache writes are registered on `event` and run
    /// after the response has been produced.
    pub async fn handle(
        &self,
        request: Request,
        event: &mut ExtendableEvent,
    ) -> Result<FetchOutcome, ServiceWorkerError> {
        let class = self.classify(&request);
        trace!(url = %request.url, ?class, "Classified request");

        match class {
            RequestClass::Bypass | RequestClass::Unmatched => Ok(FetchOutcome::Passthrough),
            RequestClass::Navigation => Ok(self.network_first(request, event).await),
            RequestClass::StaticAsset => self.cache_first(request, event).await,
        }
    }

    async fn network_first(&self, request: Request, event: &mut ExtendableEvent) -> FetchOutcome {
        match self.fetcher.fetch(request.clone()).await {
            Ok(response) => {
                self.store_later(event, request, response.clone());
                FetchOutcome::Responded {
                    response,
                    source: ResponseSource::Network,
                }
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Navigation offline, trying cache");
                if let Some(response) = self.store.get(&request).await {
                    return FetchOutcome::Responded {
                        response,
                        source: ResponseSource::Cache,
                    };
                }
                if let Some(response) = self.store.get_url(&self.config.root_url()).await {
                    return FetchOutcome::Responded {
                        response,
                        source: ResponseSource::CachedRoot,
                    };
                }
                FetchOutcome::Responded {
                    response: Response::html(request.url, self.config.offline_html.clone()),
                    source: ResponseSource::OfflineFallback,
                }
            }
        }
    }

    async fn cache_first(
        &self,
        request: Request,
        event: &mut ExtendableEvent,
    ) -> Result<FetchOutcome, ServiceWorkerError> {
        if let Some(cached) = self.store.get(&request).await {
            let store = self.store.clone();
            let fetcher = self.fetcher.clone();
            event.wait_until(async move {
                revalidate(store, fetcher, request).await;
            });
            return Ok(FetchOutcome::Responded {
                response: cached,
                source: ResponseSource::Cache,
            });
        }

        let response = self.fetcher.fetch(request.clone()).await?;
        if response.ok() {
            self.store_later(event, request, response.clone());
        }
        Ok(FetchOutcome::Responded {
            response,
            source: ResponseSource::Network,
        })
    }

    fn store_later(&self, event: &mut ExtendableEvent, request: Request, response: Response) {
        let store = self.store.clone();
        event.wait_until(async move {
            if let Err(e) = store.put(&request, response).await {
                warn!(url = %request.url, error = %e, "Cache write failed");
            }
        });
    }
}

/// Refresh a cached asset; failures leave the old entry in place.
async fn revalidate(store: CacheStore, fetcher: Arc<dyn Fetcher>, request: Request) {
    match fetcher.fetch(request.clone()).await {
        Ok(response) if response.ok() => {
            if let Err(e) = store.put(&request, response).await {
                warn!(url = %request.url, error = %e, "Cache write failed");
            } else {
                trace!(url = %request.url, "Revalidated cached asset");
            }
        }
        Ok(response) => {
            debug!(url = %request.url, status = %response.status, "Revalidation skipped")
        }
        Err(e) => debug!(url = %request.url, error = %e, "Revalidation failed"),
    }
}
