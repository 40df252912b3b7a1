//! # Imperial Watch background worker
//!
//! Offline support and notification delivery for the Imperial Watch PWA.
//!
//! ## Features
//!
//! - **Lifecycle**: install precaches the app shell, activate prunes old caches
//! - **Fetch interception**: network-first documents, cache-first assets
//! - **Notifications**: page messages and push deliveries share one pipeline
//! - **Click routing**: focus an open window or open a new one
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorker (event host)
//!     ├── FetchInterceptor ── CacheStore ── CacheStorage (shared)
//!     ├── NotificationDispatcher ── NotificationPresenter
//!     └── NotificationClickRouter ── Clients
//! ```

use thiserror::Error;
use watch_common::WatchError;
use watch_net::NetError;

pub mod cache;
pub mod clients;
pub mod config;
pub mod event;
pub mod fetch;
pub mod lifecycle;
pub mod notification;
pub mod worker;

pub use cache::{CacheStorage, CacheStore, PrecacheReport, SharedCacheStorage};
pub use clients::{ClickOutcome, ClientInfo, ClientList, ClientMatchOptions, ClientType, Clients, NotificationClickRouter};
pub use config::{NotificationDefaults, WorkerConfig};
pub use event::ExtendableEvent;
pub use fetch::{FetchInterceptor, FetchOutcome, RequestClass, ResponseSource};
pub use lifecycle::{LifecycleEvent, ServiceWorkerId, ServiceWorkerState};
pub use notification::{
    NotificationDispatcher, NotificationOrigin, NotificationPresenter, NotificationRequest,
    NotificationTray, Permission,
};
pub use worker::{EventOutcome, ServiceWorker, WorkerEvent, WorkerServices};

/// Errors that can occur in worker operations.
#[derive(Error, Debug, Clone)]
pub enum ServiceWorkerError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Notification error: {0}")]
    NotificationError(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Client error: {0}")]
    ClientError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<NetError> for ServiceWorkerError {
    fn from(err: NetError) -> Self {
        ServiceWorkerError::NetworkError(err.to_string())
    }
}

impl From<WatchError> for ServiceWorkerError {
    fn from(err: WatchError) -> Self {
        match err {
            WatchError::Cache { message, .. } => ServiceWorkerError::CacheError(message),
            WatchError::Notification { message, .. } => {
                ServiceWorkerError::NotificationError(message)
            }
            WatchError::Config { message, .. } => ServiceWorkerError::ConfigError(message),
            WatchError::NotFound(what) => ServiceWorkerError::NotFound(what),
            other if other.is_transient() => ServiceWorkerError::NetworkError(other.to_string()),
            other => ServiceWorkerError::StateError(other.to_string()),
        }
    }
}
