//! # Watch Net
//!
//! HTTP request/response model, the network seam used by the background
//! worker, and the client for the upstream registry API.
//!
//! ## Design Goals
//!
//! 1. **Cloneable responses**: bodies are fully buffered so a response can be
//!    stored in a cache and returned to the page at the same time
//! 2. **Pluggable network**: everything that talks to the network goes through
//!    the [`Fetcher`] trait, so worker logic runs without a real host
//! 3. **Bounded API calls**: registry calls carry their own deadline

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use thiserror::Error;
use url::Url;

pub mod api;
pub mod loader;

pub use api::{ApiConfig, NewSpaceship, RegistryClient, Spaceship};
pub use loader::{HttpFetcher, LoaderConfig};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("{message}")]
    Api { status: StatusCode, message: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl From<watch_common::WatchError> for NetError {
    fn from(err: watch_common::WatchError) -> Self {
        match err {
            watch_common::WatchError::Timeout(d) => NetError::Timeout(d),
            other => NetError::RequestFailed(other.to_string()),
        }
    }
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the page issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Loading a new top-level document.
    Navigate,
    /// Same-origin subresource.
    SameOrigin,
    /// Cross-origin request with CORS.
    #[default]
    Cors,
    /// Opaque cross-origin request.
    NoCors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub mode: RequestMode,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            mode: RequestMode::default(),
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Create a document navigation request.
    pub fn navigate(url: Url) -> Self {
        Self::get(url).mode(RequestMode::Navigate)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Create a POST request with a JSON body.
    pub fn post_json<T: serde::Serialize>(url: Url, value: &T) -> Result<Self, NetError> {
        let body = serde_json::to_vec(value).map_err(|e| NetError::InvalidInput(e.to_string()))?;
        Ok(Self::post(url, Bytes::from(body)).header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        ))
    }

    /// Set the method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Whether this request loads a new document.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// HTTP response with a fully buffered body.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn new(url: Url, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            url,
            status,
            headers,
            body,
        }
    }

    /// A 200 `text/html` document.
    pub fn html(url: Url, document: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        Self::new(url, StatusCode::OK, headers, Bytes::from(document.into()))
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Parsed `Content-Type`.
    pub fn content_type(&self) -> Option<Mime> {
        self.header("content-type").and_then(|s| s.parse::<Mime>().ok())
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Anything that can turn a [`Request`] into a [`Response`].
///
/// A rejected fetch (`Err`) means no response was obtained at all; HTTP error
/// statuses are still `Ok` responses.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>>;
}
