//! The worker host: routes platform events to the right component.
//!
//! ```text
//! Install ──────────────► precache app shell ─► Installed
//! Activate ─────────────► prune + claim ──────► Activated
//! Fetch ────────────────► FetchInterceptor (Activated only)
//! Message / Push ───────► NotificationDispatcher
//! NotificationClick ────► NotificationClickRouter
//! ```
//!
//! Fetch responses are returned as soon as they exist. Cache writes they
//! started are parked and joined by [`ServiceWorker::wait_idle`]. Every other
//! event is fully settled before [`ServiceWorker::dispatch`] returns.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use watch_net::{Fetcher, Request};

use crate::cache::{CacheStore, PrecacheReport, SharedCacheStorage};
use crate::clients::{ClickOutcome, Clients, NotificationClickRouter};
use crate::config::WorkerConfig;
use crate::event::ExtendableEvent;
use crate::fetch::{FetchInterceptor, FetchOutcome};
use crate::lifecycle::{LifecycleEvent, ServiceWorkerId, ServiceWorkerState};
use crate::notification::{NotificationDispatcher, NotificationPresenter, NotificationRequest};
use crate::ServiceWorkerError;

/// Message type that asks the worker to show a notification.
pub const SHOW_NOTIFICATION: &str = "SHOW_NOTIFICATION";

/// Platform services the worker runs against.
#[derive(Clone)]
pub struct WorkerServices {
    pub fetcher: Arc<dyn Fetcher>,
    pub presenter: Arc<dyn NotificationPresenter>,
    pub clients: Arc<dyn Clients>,
    /// Cache storage for the origin, shared across worker versions.
    pub storage: SharedCacheStorage,
}

/// Events delivered by the platform.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    /// Message posted by a page.
    Message(Value),
    /// Push delivery, with its payload if any.
    Push(Option<Bytes>),
    NotificationClick {
        notification: NotificationRequest,
        action: Option<String>,
    },
    NotificationClose(NotificationRequest),
}

impl WorkerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerEvent::Install => "install",
            WorkerEvent::Activate => "activate",
            WorkerEvent::Fetch(_) => "fetch",
            WorkerEvent::Message(_) => "message",
            WorkerEvent::Push(_) => "push",
            WorkerEvent::NotificationClick { .. } => "notificationclick",
            WorkerEvent::NotificationClose(_) => "notificationclose",
        }
    }
}

/// What handling an event produced.
#[derive(Debug)]
pub enum EventOutcome {
    Installed(PrecacheReport),
    Activated {
        /// Stale caches deleted.
        pruned: Vec<String>,
        /// Windows taken under control.
        claimed: Vec<String>,
    },
    Fetch(FetchOutcome),
    NotificationShown { tag: String },
    Clicked(ClickOutcome),
    /// The event needed no work.
    Ignored,
}

/// A worker instance for one cache version.
pub struct ServiceWorker {
    id: ServiceWorkerId,
    config: Arc<WorkerConfig>,
    state: RwLock<ServiceWorkerState>,
    services: WorkerServices,
    interceptor: FetchInterceptor,
    dispatcher: NotificationDispatcher,
    router: NotificationClickRouter,
    lifetimes: Mutex<Vec<ExtendableEvent>>,
    event_tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl ServiceWorker {
    /// Create a worker in the `Parsed` state.
    pub fn new(
        config: WorkerConfig,
        services: WorkerServices,
    ) -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let config = Arc::new(config);

        let store = CacheStore::new(
            services.storage.clone(),
            &config.cache_name(),
            config.cache_quota,
        );
        let interceptor = FetchInterceptor::new(config.clone(), store, services.fetcher.clone());
        let dispatcher =
            NotificationDispatcher::new(config.notifications.clone(), services.presenter.clone());
        let router = NotificationClickRouter::new(
            config.origin.clone(),
            services.clients.clone(),
            services.presenter.clone(),
        );

        (
            Self {
                id: ServiceWorkerId::new(),
                config,
                state: RwLock::new(ServiceWorkerState::Parsed),
                services,
                interceptor,
                dispatcher,
                router,
                lifetimes: Mutex::new(Vec::new()),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn store(&self) -> &CacheStore {
        self.interceptor.store()
    }

    pub async fn state(&self) -> ServiceWorkerState {
        *self.state.read().await
    }

    /// Handle one event.
    pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome, ServiceWorkerError> {
        debug!(worker = %self.id, event = event.kind(), "Dispatching event");
        match event {
            WorkerEvent::Install => self.install().await,
            WorkerEvent::Activate => self.activate().await,
            WorkerEvent::Fetch(request) => self.fetch(request).await,
            WorkerEvent::Message(message) => self.message(message).await,
            WorkerEvent::Push(data) => self.push(data).await,
            WorkerEvent::NotificationClick {
                notification,
                action,
            } => {
                if let Some(action) = &action {
                    debug!(action = %action, "Notification action clicked");
                }
                let outcome = self.router.route(&notification).await?;
                Ok(EventOutcome::Clicked(outcome))
            }
            WorkerEvent::NotificationClose(notification) => {
                info!(tag = %notification.tag(), "Notification closed");
                Ok(EventOutcome::Ignored)
            }
        }
    }

    /// Fetch events whose cache writes have not been reaped yet.
    pub async fn parked(&self) -> usize {
        self.lifetimes.lock().await.len()
    }

    /// Join every cache write started by fetch handling. Returns how many ran.
    pub async fn wait_idle(&self) -> usize {
        let parked = std::mem::take(&mut *self.lifetimes.lock().await);
        let mut joined = 0;
        for event in parked {
            joined += event.settle().await;
        }
        joined
    }

    async fn set_state(&self, new_state: ServiceWorkerState) {
        *self.state.write().await = new_state;
        info!(worker = %self.id, state = %new_state, "State changed");
        self.emit(LifecycleEvent::StateChange {
            worker_id: self.id,
            new_state,
        });
    }

    fn emit(&self, event: LifecycleEvent) {
        // The host may not listen.
        let _ = self.event_tx.send(event);
    }

    async fn expect_state(
        &self,
        expected: ServiceWorkerState,
        operation: &str,
    ) -> Result<(), ServiceWorkerError> {
        let current = self.state().await;
        if current != expected {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot {operation} while {current}"
            )));
        }
        Ok(())
    }

    async fn install(&self) -> Result<EventOutcome, ServiceWorkerError> {
        self.expect_state(ServiceWorkerState::Parsed, "install").await?;
        self.emit(LifecycleEvent::UpdateFound {
            cache_name: self.store().name().to_string(),
        });
        self.set_state(ServiceWorkerState::Installing).await;

        let urls = self
            .config
            .precache
            .iter()
            .map(|path| self.config.resolve(path))
            .collect::<Result<Vec<_>, _>>();
        let urls = match urls {
            Ok(urls) => urls,
            Err(e) => {
                self.set_state(ServiceWorkerState::Redundant).await;
                return Err(e);
            }
        };

        let store = self.store().clone();
        let fetcher = self.services.fetcher.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut event = ExtendableEvent::new("install");
        event.wait_until(async move {
            store.create().await;
            let _ = tx.send(store.precache(fetcher.as_ref(), &urls).await);
        });
        event.settle().await;

        let report = rx.await.map_err(|_| {
            ServiceWorkerError::CacheError("precache did not complete".to_string())
        });
        let report = match report {
            Ok(report) => report,
            Err(e) => {
                self.set_state(ServiceWorkerState::Redundant).await;
                return Err(e);
            }
        };

        // No waiting phase: the host may activate right away.
        self.set_state(ServiceWorkerState::Installed).await;
        Ok(EventOutcome::Installed(report))
    }

    async fn activate(&self) -> Result<EventOutcome, ServiceWorkerError> {
        self.expect_state(ServiceWorkerState::Installed, "activate").await?;
        self.set_state(ServiceWorkerState::Activating).await;

        let pruned = CacheStore::prune(&self.services.storage, self.store().name()).await;
        let claimed = match self.services.clients.claim(&self.config.origin).await {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(error = %e, "Claiming clients failed");
                Vec::new()
            }
        };
        for client_id in &claimed {
            self.emit(LifecycleEvent::ControllerChange {
                client_id: client_id.clone(),
            });
        }

        self.set_state(ServiceWorkerState::Activated).await;
        Ok(EventOutcome::Activated { pruned, claimed })
    }

    async fn fetch(&self, request: Request) -> Result<EventOutcome, ServiceWorkerError> {
        if !self.state().await.controls_fetches() {
            return Ok(EventOutcome::Fetch(FetchOutcome::Passthrough));
        }

        let mut event = ExtendableEvent::new("fetch");
        let outcome = self.interceptor.handle(request, &mut event).await;
        let mut lifetimes = self.lifetimes.lock().await;
        lifetimes.retain(|parked| !parked.is_finished());
        if event.pending() > 0 {
            lifetimes.push(event);
        }
        drop(lifetimes);
        Ok(EventOutcome::Fetch(outcome?))
    }

    async fn message(&self, message: Value) -> Result<EventOutcome, ServiceWorkerError> {
        let kind = message.get("type").and_then(Value::as_str);
        if kind != Some(SHOW_NOTIFICATION) {
            debug!(kind = ?kind, "Ignoring message");
            return Ok(EventOutcome::Ignored);
        }

        let data = message.get("data").unwrap_or(&Value::Null);
        let notification = self.dispatcher.local(data);
        self.present(notification).await
    }

    async fn push(&self, data: Option<Bytes>) -> Result<EventOutcome, ServiceWorkerError> {
        let Some(data) = data else {
            info!("Push received without data");
            return Ok(EventOutcome::Ignored);
        };
        let notification = self.dispatcher.remote(&data);
        self.present(notification).await
    }

    async fn present(
        &self,
        notification: NotificationRequest,
    ) -> Result<EventOutcome, ServiceWorkerError> {
        let tag = notification.tag().to_string();
        self.dispatcher.present(notification).await?;
        Ok(EventOutcome::NotificationShown { tag })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStorage;
    use crate::clients::ClientList;
    use crate::notification::{NotificationTray, Permission};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use http::{HeaderMap, StatusCode};
    use serde_json::json;
    use url::Url;
    use watch_net::{NetError, Response};

    struct OkFetcher;

    impl Fetcher for OkFetcher {
        fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
            async move {
                Ok(Response::new(
                    request.url,
                    StatusCode::OK,
                    HeaderMap::new(),
                    Bytes::from_static(b"ok"),
                ))
            }
            .boxed()
        }
    }

    fn worker() -> (ServiceWorker, mpsc::UnboundedReceiver<LifecycleEvent>, Arc<NotificationTray>) {
        let tray = Arc::new(NotificationTray::new(Permission::Granted));
        let services = WorkerServices {
            fetcher: Arc::new(OkFetcher),
            presenter: tray.clone(),
            clients: Arc::new(ClientList::new()),
            storage: CacheStorage::shared(),
        };
        let config = WorkerConfig::new(Url::parse("https://watch.example/").unwrap());
        let (worker, rx) = ServiceWorker::new(config, services);
        (worker, rx, tray)
    }

    #[tokio::test]
    async fn test_activate_requires_install() {
        let (worker, _rx, _) = worker();
        let err = worker.dispatch(WorkerEvent::Activate).await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::StateError(_)));
        assert_eq!(worker.state().await, ServiceWorkerState::Parsed);
    }

    #[tokio::test]
    async fn test_install_then_activate_emits_lifecycle() {
        let (worker, mut rx, _) = worker();

        worker.dispatch(WorkerEvent::Install).await.unwrap();
        worker.dispatch(WorkerEvent::Activate).await.unwrap();
        assert_eq!(worker.state().await, ServiceWorkerState::Activated);

        let mut states = Vec::new();
        let mut update_found = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                LifecycleEvent::StateChange { new_state, .. } => states.push(new_state),
                LifecycleEvent::UpdateFound { cache_name } => {
                    update_found = cache_name == "app-cache-v1"
                }
                LifecycleEvent::ControllerChange { .. } => {}
            }
        }
        assert!(update_found);
        assert_eq!(
            states,
            vec![
                ServiceWorkerState::Installing,
                ServiceWorkerState::Installed,
                ServiceWorkerState::Activating,
                ServiceWorkerState::Activated,
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_passes_through_before_activation() {
        let (worker, _rx, _) = worker();
        let request = Request::navigate(Url::parse("https://watch.example/").unwrap());
        let outcome = worker.dispatch(WorkerEvent::Fetch(request)).await.unwrap();
        assert!(matches!(outcome, EventOutcome::Fetch(FetchOutcome::Passthrough)));
        assert_eq!(worker.wait_idle().await, 0);
    }

    #[tokio::test]
    async fn test_finished_fetch_work_is_reaped() {
        let (worker, _rx, _) = worker();
        worker.dispatch(WorkerEvent::Install).await.unwrap();
        worker.dispatch(WorkerEvent::Activate).await.unwrap();

        for i in 0..200 {
            let url = Url::parse(&format!("https://watch.example/page/{i}")).unwrap();
            worker
                .dispatch(WorkerEvent::Fetch(Request::navigate(url)))
                .await
                .unwrap();
            if i % 50 == 49 {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let last = Url::parse("https://watch.example/").unwrap();
        worker
            .dispatch(WorkerEvent::Fetch(Request::navigate(last)))
            .await
            .unwrap();

        let parked = worker.parked().await;
        assert!(parked <= 1, "parked {parked}");
        assert!(worker.wait_idle().await <= 1);
        assert_eq!(worker.parked().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_message_is_ignored() {
        let (worker, _rx, tray) = worker();
        let outcome = worker
            .dispatch(WorkerEvent::Message(json!({"type": "PING"})))
            .await
            .unwrap();
        assert!(matches!(outcome, EventOutcome::Ignored));
        assert_eq!(tray.shown_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_push_is_ignored() {
        let (worker, _rx, tray) = worker();
        let outcome = worker.dispatch(WorkerEvent::Push(None)).await.unwrap();
        assert!(matches!(outcome, EventOutcome::Ignored));
        assert_eq!(tray.shown_count(), 0);
    }
}
