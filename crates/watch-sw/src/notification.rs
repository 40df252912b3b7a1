//! Notification normalization and presentation.
//!
//! Local requests (page messages) and remote requests (push deliveries) are
//! merged over the same defaults and handed to one presenter. The origin tag
//! in the embedded data is always stamped here; a caller-supplied `type` is
//! ignored so click routing can rely on it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::NotificationDefaults;
use crate::ServiceWorkerError;

/// Which path produced a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationOrigin {
    /// In-page message.
    Local,
    /// Push delivery.
    Remote,
}

impl NotificationOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationOrigin::Local => "local",
            NotificationOrigin::Remote => "remote",
        }
    }

    /// Tag used when the caller supplies none.
    pub fn default_tag(self) -> String {
        format!("{}-notification", self.as_str())
    }
}

/// Caller-supplied notification fields, all optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub icon: Option<String>,
    pub badge: Option<String>,
    pub url: Option<String>,
    pub tag: Option<String>,
}

impl NotificationPayload {
    /// Read the known string fields of a JSON value. Empty strings,
    /// non-string values and non-object values count as absent.
    pub fn from_value(value: &Value) -> Self {
        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            title: field("title"),
            body: field("body"),
            icon: field("icon"),
            badge: field("badge"),
            url: field("url"),
            tag: field("tag"),
        }
    }
}

/// Data block embedded in every presented notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationData {
    /// Where a click should lead.
    pub url: String,
    /// Creation time (ms since epoch).
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub origin: NotificationOrigin,
}

/// A button offered on the notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

/// Options bag handed to the platform alongside the title.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationOptions {
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub data: NotificationData,
    pub require_interaction: bool,
    pub tag: String,
    pub actions: Vec<NotificationAction>,
}

/// A normalized notification, ready to present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub title: String,
    pub options: NotificationOptions,
}

impl NotificationRequest {
    pub fn tag(&self) -> &str {
        &self.options.tag
    }

    pub fn data(&self) -> &NotificationData {
        &self.options.data
    }
}

/// The platform's notification primitive.
pub trait NotificationPresenter: Send + Sync {
    /// Show a notification, replacing any visible one with the same tag.
    fn show(&self, notification: NotificationRequest) -> BoxFuture<'_, Result<(), ServiceWorkerError>>;

    /// Dismiss the visible notification with this tag, if any. Closing by tag
    /// also dismisses a newer notification that replaced the one asked for.
    fn close<'a>(&'a self, tag: &'a str) -> BoxFuture<'a, ()>;
}

/// Builds notifications from either source and presents them.
#[derive(Clone)]
pub struct NotificationDispatcher {
    defaults: NotificationDefaults,
    presenter: Arc<dyn NotificationPresenter>,
}

impl NotificationDispatcher {
    pub fn new(defaults: NotificationDefaults, presenter: Arc<dyn NotificationPresenter>) -> Self {
        Self {
            defaults,
            presenter,
        }
    }

    pub fn presenter(&self) -> &Arc<dyn NotificationPresenter> {
        &self.presenter
    }

    /// Merge `payload` over the defaults and stamp origin and timestamp.
    pub fn build(&self, payload: NotificationPayload, origin: NotificationOrigin) -> NotificationRequest {
        let defaults = &self.defaults;
        NotificationRequest {
            title: payload.title.unwrap_or_else(|| defaults.title.clone()),
            options: NotificationOptions {
                body: payload.body.unwrap_or_else(|| defaults.body.clone()),
                icon: payload.icon.unwrap_or_else(|| defaults.icon.clone()),
                badge: payload.badge.unwrap_or_else(|| defaults.badge.clone()),
                vibrate: defaults.vibrate.clone(),
                data: NotificationData {
                    url: payload.url.unwrap_or_else(|| "/".to_string()),
                    timestamp: Utc::now().timestamp_millis(),
                    origin,
                },
                require_interaction: false,
                tag: payload.tag.unwrap_or_else(|| origin.default_tag()),
                actions: vec![
                    NotificationAction {
                        action: "open".to_string(),
                        title: defaults.open_action_title.clone(),
                    },
                    NotificationAction {
                        action: "close".to_string(),
                        title: defaults.close_action_title.clone(),
                    },
                ],
            },
        }
    }

    /// Notification for a `SHOW_NOTIFICATION` message's `data` block.
    pub fn local(&self, data: &Value) -> NotificationRequest {
        self.build(NotificationPayload::from_value(data), NotificationOrigin::Local)
    }

    /// Notification for push bytes. JSON without usable fields (including
    /// non-object values) gets the defaults; bytes that are not JSON become a
    /// generic notification whose body is the raw text.
    pub fn remote(&self, data: &[u8]) -> NotificationRequest {
        let payload = match serde_json::from_slice::<Value>(data) {
            Ok(value) => NotificationPayload::from_value(&value),
            Err(e) => {
                debug!(error = %e, "Push payload is not JSON, using text");
                let text = String::from_utf8_lossy(data).into_owned();
                NotificationPayload {
                    title: Some(self.defaults.push_fallback_title.clone()),
                    body: Some(text).filter(|t| !t.is_empty()),
                    icon: Some(self.defaults.icon.clone()),
                    ..Default::default()
                }
            }
        };
        self.build(payload, NotificationOrigin::Remote)
    }

    /// Hand a notification to the platform. Failures are returned, not retried.
    pub async fn present(&self, notification: NotificationRequest) -> Result<(), ServiceWorkerError> {
        let tag = notification.tag().to_string();
        let origin = notification.data().origin;
        self.presenter.show(notification).await?;
        info!(tag = %tag, origin = origin.as_str(), "Notification shown");
        Ok(())
    }
}

/// Notification permission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Permission {
    #[default]
    Default,
    Granted,
    Denied,
}

/// In-process presenter: one visible notification per tag.
#[derive(Debug, Default)]
pub struct NotificationTray {
    permission: RwLock<Permission>,
    visible: RwLock<Vec<NotificationRequest>>,
    shown: AtomicUsize,
}

impl NotificationTray {
    pub fn new(permission: Permission) -> Self {
        Self {
            permission: RwLock::new(permission),
            ..Default::default()
        }
    }

    pub async fn set_permission(&self, permission: Permission) {
        *self.permission.write().await = permission;
    }

    /// Currently visible notifications, oldest first.
    pub async fn visible(&self) -> Vec<NotificationRequest> {
        self.visible.read().await.clone()
    }

    pub async fn get(&self, tag: &str) -> Option<NotificationRequest> {
        self.visible
            .read()
            .await
            .iter()
            .find(|n| n.tag() == tag)
            .cloned()
    }

    /// Total presentations, including replaced ones.
    pub fn shown_count(&self) -> usize {
        self.shown.load(Ordering::Relaxed)
    }
}

impl NotificationPresenter for NotificationTray {
    fn show(&self, notification: NotificationRequest) -> BoxFuture<'_, Result<(), ServiceWorkerError>> {
        async move {
            let permission = *self.permission.read().await;
            if permission != Permission::Granted {
                return Err(ServiceWorkerError::PermissionDenied(format!(
                    "notification permission is {permission:?}"
                )));
            }

            let mut visible = self.visible.write().await;
            match visible.iter_mut().find(|n| n.tag() == notification.tag()) {
                Some(existing) => *existing = notification,
                None => visible.push(notification),
            }
            self.shown.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        .boxed()
    }

    fn close<'a>(&'a self, tag: &'a str) -> BoxFuture<'a, ()> {
        async move {
            self.visible.write().await.retain(|n| n.tag() != tag);
        }
        .boxed()
    }
}
