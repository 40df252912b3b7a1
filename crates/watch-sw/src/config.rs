//! Worker configuration.
//!
//! The cache version and origin are injected here instead of living in the
//! handlers, so the same worker code can be exercised against several
//! versions side by side.

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::ServiceWorkerError;

/// Root-relative paths stored at install time.
pub const DEFAULT_PRECACHE: &[&str] = &[
    "/",
    "/icons/apple-touch-icon.png",
    "/icons/favicon-96x96.png",
    "/icons/favicon.ico",
    "/icons/favicon.svg",
    "/icons/web-app-manifest-192x192.png",
    "/icons/web-app-manifest-512x512.png",
    "/manifest.webmanifest",
];

/// Background worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the worker is registered for.
    pub origin: Url,

    /// Cache name prefix.
    pub cache_prefix: String,

    /// Cache version; changing it orphans every older cache.
    pub cache_version: String,

    /// Paths fetched and stored at install time.
    pub precache: Vec<String>,

    /// Document served when a navigation fails with nothing cached.
    pub offline_html: String,

    /// Maximum entries per cache, unlimited when absent.
    pub cache_quota: Option<usize>,

    /// Notification defaults.
    pub notifications: NotificationDefaults,
}

/// Values used when a notification payload leaves a field out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    /// Vibration pattern in milliseconds.
    pub vibrate: Vec<u32>,
    /// Title used when a push payload is not JSON.
    pub push_fallback_title: String,
    pub open_action_title: String,
    pub close_action_title: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("http://localhost:3000/").expect("static origin is valid"),
            cache_prefix: "app-cache".to_string(),
            cache_version: "v1".to_string(),
            precache: DEFAULT_PRECACHE.iter().map(|p| p.to_string()).collect(),
            offline_html: "<h1>Offline</h1>".to_string(),
            cache_quota: None,
            notifications: NotificationDefaults::default(),
        }
    }
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            title: "Notification".to_string(),
            body: "You have a new message".to_string(),
            icon: "/icons/favicon.svg".to_string(),
            badge: "/icons/favicon.svg".to_string(),
            vibrate: vec![100, 50, 100],
            push_fallback_title: "Remote Notification".to_string(),
            open_action_title: "Open App".to_string(),
            close_action_title: "Close".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Default configuration for `origin`.
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.cache_version = version.into();
        self
    }

    pub fn with_precache(mut self, paths: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.precache = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_quota(mut self, max_entries: usize) -> Self {
        self.cache_quota = Some(max_entries);
        self
    }

    /// Name of the current cache, e.g. `app-cache-v1`.
    pub fn cache_name(&self) -> String {
        format!("{}-{}", self.cache_prefix, self.cache_version)
    }

    /// Resolve a root-relative path against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url, ServiceWorkerError> {
        self.origin
            .join(path)
            .map_err(|e| ServiceWorkerError::ConfigError(format!("{path}: {e}")))
    }

    /// The site root.
    pub fn root_url(&self) -> Url {
        let mut root = self.origin.clone();
        root.set_path("/");
        root.set_query(None);
        root.set_fragment(None);
        root
    }

    /// Whether `url` shares the worker's origin.
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }

    /// Parse a JSON config; absent fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ServiceWorkerError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ServiceWorkerError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ServiceWorkerError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ServiceWorkerError::ConfigError(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    fn validate(&self) -> Result<(), ServiceWorkerError> {
        if self.cache_version.trim().is_empty() {
            return Err(ServiceWorkerError::ConfigError(
                "cache_version must not be empty".to_string(),
            ));
        }
        if !matches!(self.origin.scheme(), "http" | "https") {
            return Err(ServiceWorkerError::ConfigError(format!(
                "unsupported origin scheme: {}",
                self.origin.scheme()
            )));
        }
        Ok(())
    }
}
