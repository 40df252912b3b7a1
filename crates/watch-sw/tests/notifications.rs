//! Notification delivery and click routing through the worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use url::Url;
use watch_net::{Fetcher, NetError, Request, Response};
use watch_sw::{
    CacheStorage, ClickOutcome, ClientInfo, ClientList, ClientMatchOptions, Clients, EventOutcome,
    NotificationOrigin, NotificationRequest, NotificationTray, Permission, ServiceWorker,
    ServiceWorkerError, WorkerConfig, WorkerEvent, WorkerServices,
};

const ORIGIN: &str = "https://watch.example/";

struct OfflineFetcher;

impl Fetcher for OfflineFetcher {
    fn fetch(&self, _request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        async { Err(NetError::RequestFailed("offline".into())) }.boxed()
    }
}

/// Wraps a [`ClientList`] and counts calls.
#[derive(Default)]
struct RecordingClients {
    inner: ClientList,
    focus_calls: AtomicUsize,
    navigate_calls: AtomicUsize,
    open_calls: AtomicUsize,
}

impl RecordingClients {
    fn counts(&self) -> (usize, usize, usize) {
        (
            self.focus_calls.load(Ordering::SeqCst),
            self.navigate_calls.load(Ordering::SeqCst),
            self.open_calls.load(Ordering::SeqCst),
        )
    }
}

impl Clients for RecordingClients {
    fn match_all(
        &self,
        options: ClientMatchOptions,
    ) -> BoxFuture<'_, Result<Vec<ClientInfo>, ServiceWorkerError>> {
        self.inner.match_all(options)
    }

    fn focus<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), ServiceWorkerError>> {
        self.focus_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.focus(id)
    }

    fn navigate<'a>(
        &'a self,
        id: &'a str,
        url: &'a Url,
    ) -> BoxFuture<'a, Result<(), ServiceWorkerError>> {
        self.navigate_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.navigate(id, url)
    }

    fn open_window<'a>(
        &'a self,
        url: &'a Url,
    ) -> BoxFuture<'a, Result<ClientInfo, ServiceWorkerError>> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.open_window(url)
    }

    fn claim<'a>(
        &'a self,
        origin: &'a Url,
    ) -> BoxFuture<'a, Result<Vec<String>, ServiceWorkerError>> {
        self.inner.claim(origin)
    }
}

struct Harness {
    worker: ServiceWorker,
    tray: Arc<NotificationTray>,
    clients: Arc<RecordingClients>,
}

fn harness(permission: Permission) -> Harness {
    let tray = Arc::new(NotificationTray::new(permission));
    let clients = Arc::new(RecordingClients::default());
    let services = WorkerServices {
        fetcher: Arc::new(OfflineFetcher),
        presenter: tray.clone(),
        clients: clients.clone(),
        storage: CacheStorage::shared(),
    };
    let config = WorkerConfig::new(Url::parse(ORIGIN).unwrap());
    let (worker, _rx) = ServiceWorker::new(config, services);
    Harness {
        worker,
        tray,
        clients,
    }
}

async fn push(h: &Harness, body: &'static [u8]) -> NotificationRequest {
    let outcome = h
        .worker
        .dispatch(WorkerEvent::Push(Some(Bytes::from_static(body))))
        .await
        .unwrap();
    match outcome {
        EventOutcome::NotificationShown { tag } => h.tray.get(&tag).await.unwrap(),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

async fn click(h: &Harness, notification: NotificationRequest) -> ClickOutcome {
    let outcome = h
        .worker
        .dispatch(WorkerEvent::NotificationClick {
            notification,
            action: None,
        })
        .await
        .unwrap();
    match outcome {
        EventOutcome::Clicked(outcome) => outcome,
        other => panic!("unexpected outcome: {other:?}"),
    }
}

async fn local(h: &Harness, data: serde_json::Value) -> NotificationRequest {
    let message = json!({ "type": "SHOW_NOTIFICATION", "data": data });
    let outcome = h.worker.dispatch(WorkerEvent::Message(message)).await.unwrap();
    match outcome {
        EventOutcome::NotificationShown { tag } => h.tray.get(&tag).await.unwrap(),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_json_push_is_tagged_remote() {
    let h = harness(Permission::Granted);

    let shown = push(&h, br#"{"title":"T","body":"B"}"#).await;

    assert_eq!(shown.title, "T");
    assert_eq!(shown.options.body, "B");
    assert_eq!(shown.data().origin, NotificationOrigin::Remote);
    assert_eq!(shown.tag(), "remote-notification");
    assert_eq!(shown.data().url, "/");

    let data = serde_json::to_value(shown.data()).unwrap();
    assert_eq!(data["type"], "remote");
}

#[tokio::test]
async fn test_unparsable_push_uses_text_body() {
    let h = harness(Permission::Granted);

    let shown = push(&h, b"Fleet inspection at 0900").await;

    assert!(!shown.title.is_empty());
    assert_eq!(shown.title, "Remote Notification");
    assert_eq!(shown.options.body, "Fleet inspection at 0900");
    assert_eq!(shown.data().origin, NotificationOrigin::Remote);
}

#[tokio::test]
async fn test_local_notifications_replace_by_tag() {
    let h = harness(Permission::Granted);

    local(&h, json!({"title": "First", "tag": "fleet"})).await;
    let second = local(&h, json!({"title": "Second", "tag": "fleet"})).await;

    let visible = h.tray.visible().await;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0], second);
    assert_eq!(second.title, "Second");
    assert_eq!(second.data().origin, NotificationOrigin::Local);
    assert_eq!(h.tray.shown_count(), 2);
}

#[tokio::test]
async fn test_local_notification_defaults() {
    let h = harness(Permission::Granted);

    let shown = local(&h, json!({})).await;

    assert_eq!(shown.title, "Notification");
    assert_eq!(shown.options.body, "You have a new message");
    assert_eq!(shown.tag(), "local-notification");
    assert_eq!(shown.options.actions.len(), 2);
    assert!(!shown.options.require_interaction);
}

#[tokio::test]
async fn test_presentation_failure_is_reported() {
    let h = harness(Permission::Denied);

    let err = h
        .worker
        .dispatch(WorkerEvent::Push(Some(Bytes::from_static(b"{}"))))
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceWorkerError::PermissionDenied(_)));
    assert!(h.tray.visible().await.is_empty());
}

#[tokio::test]
async fn test_click_on_matching_window_only_focuses() {
    let h = harness(Permission::Granted);
    let existing = h.clients.inner.add_window("https://watch.example/fleet").await;
    let shown = local(&h, json!({"url": "/fleet"})).await;

    let outcome = click(&h, shown).await;

    assert_eq!(
        outcome,
        ClickOutcome::Focused {
            client_id: existing,
            navigated: false
        }
    );
    assert_eq!(h.clients.counts(), (1, 0, 0));
    assert!(h.tray.visible().await.is_empty());
}

#[tokio::test]
async fn test_click_on_other_page_focuses_and_navigates() {
    let h = harness(Permission::Granted);
    let existing = h.clients.inner.add_window("https://watch.example/").await;
    let shown = local(&h, json!({"url": "/spaceships/TIE-7"})).await;

    let outcome = click(&h, shown).await;

    assert_eq!(
        outcome,
        ClickOutcome::Focused {
            client_id: existing.clone(),
            navigated: true
        }
    );
    assert_eq!(h.clients.counts(), (1, 1, 0));
    let client = h.clients.inner.get(&existing).await.unwrap();
    assert_eq!(client.url, "https://watch.example/spaceships/TIE-7");
}

#[tokio::test]
async fn test_click_without_windows_opens_one() {
    let h = harness(Permission::Granted);
    h.clients.inner.add_window("https://elsewhere.example/").await;
    let shown = local(&h, json!({"url": "/fleet"})).await;

    let outcome = click(&h, shown).await;

    assert!(matches!(outcome, ClickOutcome::Opened { .. }));
    assert_eq!(h.clients.counts(), (0, 0, 1));
    assert_eq!(h.clients.inner.len().await, 2);
}

#[tokio::test]
async fn test_click_skips_window_that_cannot_navigate() {
    let h = harness(Permission::Granted);
    h.clients
        .inner
        .add(ClientInfo {
            id: "frozen".to_string(),
            url: "https://watch.example/".to_string(),
            client_type: watch_sw::ClientType::Window,
            controlled: true,
            focused: false,
            can_navigate: false,
        })
        .await;
    let shown = local(&h, json!({"url": "/fleet"})).await;

    let outcome = click(&h, shown).await;

    assert_eq!(
        outcome,
        ClickOutcome::Focused {
            client_id: "frozen".to_string(),
            navigated: false
        }
    );
    assert_eq!(h.clients.counts(), (1, 0, 0));
}

#[tokio::test]
async fn test_close_is_acknowledged() {
    let h = harness(Permission::Granted);
    let shown = local(&h, json!({"title": "Bye"})).await;

    let outcome = h
        .worker
        .dispatch(WorkerEvent::NotificationClose(shown))
        .await
        .unwrap();

    assert!(matches!(outcome, EventOutcome::Ignored));
}
