//! Open pages and notification click routing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::notification::{NotificationPresenter, NotificationRequest};
use crate::ServiceWorkerError;

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

/// Options for [`Clients::match_all`].
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

impl ClientMatchOptions {
    /// Every window on the origin, controlled or not.
    pub fn all_windows() -> Self {
        Self {
            include_uncontrolled: true,
            client_type: ClientType::Window,
        }
    }
}

/// Snapshot of an open page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: String,
    /// Current URL as reported by the page; may be empty or stale.
    pub url: String,
    pub client_type: ClientType,
    /// Whether the active worker controls this page.
    pub controlled: bool,
    pub focused: bool,
    /// Whether the page supports in-place navigation.
    pub can_navigate: bool,
}

/// The platform's view of open pages.
pub trait Clients: Send + Sync {
    fn match_all(
        &self,
        options: ClientMatchOptions,
    ) -> BoxFuture<'_, Result<Vec<ClientInfo>, ServiceWorkerError>>;

    fn focus<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), ServiceWorkerError>>;

    fn navigate<'a>(&'a self, id: &'a str, url: &'a Url)
        -> BoxFuture<'a, Result<(), ServiceWorkerError>>;

    fn open_window<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<ClientInfo, ServiceWorkerError>>;

    /// Take control of every uncontrolled window on `origin`. Returns the ids claimed.
    fn claim<'a>(&'a self, origin: &'a Url) -> BoxFuture<'a, Result<Vec<String>, ServiceWorkerError>>;
}

/// In-process client list, kept in opening order.
#[derive(Debug, Default)]
pub struct ClientList {
    clients: RwLock<Vec<ClientInfo>>,
    next_id: AtomicU64,
}

impl ClientList {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> String {
        format!("client-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Add an uncontrolled window showing `url`.
    pub async fn add_window(&self, url: impl Into<String>) -> String {
        let id = self.allocate_id();
        self.add(ClientInfo {
            id: id.clone(),
            url: url.into(),
            client_type: ClientType::Window,
            controlled: false,
            focused: false,
            can_navigate: true,
        })
        .await;
        id
    }

    /// Add a client.
    pub async fn add(&self, client: ClientInfo) {
        self.clients.write().await.push(client);
    }

    /// Get a client by ID.
    pub async fn get(&self, id: &str) -> Option<ClientInfo> {
        self.clients.read().await.iter().find(|c| c.id == id).cloned()
    }

    /// Remove a client.
    pub async fn remove(&self, id: &str) -> Option<ClientInfo> {
        let mut clients = self.clients.write().await;
        let index = clients.iter().position(|c| c.id == id)?;
        Some(clients.remove(index))
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

fn window_only(client: &ClientInfo, verb: &str) -> Result<(), ServiceWorkerError> {
    if client.client_type != ClientType::Window {
        return Err(ServiceWorkerError::StateError(format!(
            "Can only {verb} window clients"
        )));
    }
    Ok(())
}

impl Clients for ClientList {
    fn match_all(
        &self,
        options: ClientMatchOptions,
    ) -> BoxFuture<'_, Result<Vec<ClientInfo>, ServiceWorkerError>> {
        async move {
            Ok(self
                .clients
                .read()
                .await
                .iter()
                .filter(|c| options.include_uncontrolled || c.controlled)
                .filter(|c| match options.client_type {
                    ClientType::All => true,
                    t => c.client_type == t,
                })
                .cloned()
                .collect())
        }
        .boxed()
    }

    fn focus<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), ServiceWorkerError>> {
        async move {
            let mut clients = self.clients.write().await;
            let client = clients
                .iter()
                .find(|c| c.id == id)
                .ok_or_else(|| ServiceWorkerError::NotFound(id.to_string()))?;
            window_only(client, "focus")?;
            for c in clients.iter_mut() {
                c.focused = c.id == id;
            }
            Ok(())
        }
        .boxed()
    }

    fn navigate<'a>(
        &'a self,
        id: &'a str,
        url: &'a Url,
    ) -> BoxFuture<'a, Result<(), ServiceWorkerError>> {
        async move {
            let mut clients = self.clients.write().await;
            let client = clients
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| ServiceWorkerError::NotFound(id.to_string()))?;
            window_only(client, "navigate")?;
            if !client.can_navigate {
                return Err(ServiceWorkerError::StateError(format!(
                    "{id} does not support navigation"
                )));
            }
            client.url = url.to_string();
            Ok(())
        }
        .boxed()
    }

    fn open_window<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<ClientInfo, ServiceWorkerError>> {
        async move {
            let client = ClientInfo {
                id: self.allocate_id(),
                url: url.to_string(),
                client_type: ClientType::Window,
                controlled: true,
                focused: true,
                can_navigate: true,
            };
            let mut clients = self.clients.write().await;
            for c in clients.iter_mut() {
                c.focused = false;
            }
            clients.push(client.clone());
            Ok(client)
        }
        .boxed()
    }

    fn claim<'a>(&'a self, origin: &'a Url) -> BoxFuture<'a, Result<Vec<String>, ServiceWorkerError>> {
        async move {
            let mut claimed = Vec::new();
            for client in self.clients.write().await.iter_mut() {
                let same_origin = Url::parse(&client.url)
                    .map(|u| u.origin() == origin.origin())
                    .unwrap_or(false);
                if client.client_type == ClientType::Window && same_origin && !client.controlled {
                    client.controlled = true;
                    claimed.push(client.id.clone());
                }
            }
            Ok(claimed)
        }
        .boxed()
    }
}

/// What a notification click led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    /// An existing window was focused, and navigated if it showed another URL.
    Focused { client_id: String, navigated: bool },
    /// No window on the origin was open; a new one was opened.
    Opened { client_id: String },
}

/// Routes a notification click to an open window or a new one.
#[derive(Clone)]
pub struct NotificationClickRouter {
    origin: Url,
    clients: Arc<dyn Clients>,
    presenter: Arc<dyn NotificationPresenter>,
}

impl NotificationClickRouter {
    pub fn new(
        origin: Url,
        clients: Arc<dyn Clients>,
        presenter: Arc<dyn NotificationPresenter>,
    ) -> Self {
        Self {
            origin,
            clients,
            presenter,
        }
    }

    /// Absolute click target; the site root when missing or unparsable.
    pub fn target_url(&self, data_url: &str) -> Url {
        let root = || {
            let mut root = self.origin.clone();
            root.set_path("/");
            root.set_query(None);
            root.set_fragment(None);
            root
        };
        if data_url.is_empty() {
            return root();
        }
        self.origin.join(data_url).unwrap_or_else(|_| root())
    }

    pub async fn route(
        &self,
        notification: &NotificationRequest,
    ) -> Result<ClickOutcome, ServiceWorkerError> {
        self.presenter.close(notification.tag()).await;

        let target = self.target_url(&notification.data().url);
        let candidates = self
            .clients
            .match_all(ClientMatchOptions::all_windows())
            .await?;
        debug!(target = %target, candidates = candidates.len(), "Routing notification click");

        for client in &candidates {
            match self.try_client(client, &target).await {
                Ok(Some(navigated)) => {
                    info!(client = %client.id, navigated, "Focused existing window");
                    return Ok(ClickOutcome::Focused {
                        client_id: client.id.clone(),
                        navigated,
                    });
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(client = %client.id, error = %e, "Skipping client");
                    continue;
                }
            }
        }

        let opened = self.clients.open_window(&target).await?;
        info!(client = %opened.id, url = %target, "Opened new window");
        Ok(ClickOutcome::Opened {
            client_id: opened.id,
        })
    }

    /// `Ok(None)` when the client is on another origin, otherwise whether it navigated.
    async fn try_client(
        &self,
        client: &ClientInfo,
        target: &Url,
    ) -> Result<Option<bool>, ServiceWorkerError> {
        let current = Url::parse(&client.url)
            .map_err(|e| ServiceWorkerError::ClientError(format!("bad client url: {e}")))?;
        if current.origin() != self.origin.origin() {
            return Ok(None);
        }

        self.clients.focus(&client.id).await?;
        let navigated = if target.as_str() != client.url && client.can_navigate {
            self.clients.navigate(&client.id, target).await?;
            true
        } else {
            false
        };
        Ok(Some(navigated))
    }
}
