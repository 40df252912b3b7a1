//! Imperial Watch smoke harness
//!
//! Drives one worker through install, activation, a few fetches and the
//! notification flow against a running app server, then prints a JSON
//! summary with per-step timings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use serde_json::json;
use tracing::{error, info, warn};
use url::Url;
use watch_common::{init_logging, LogConfig};
use watch_net::{ApiConfig, HttpFetcher, LoaderConfig, RegistryClient, Request};
use watch_sw::{
    CacheStorage, ClientList, EventOutcome, NotificationTray, Permission, ServiceWorker,
    WorkerConfig, WorkerEvent, WorkerServices,
};

/// Performance timing collector for tracking step durations.
struct PerfTiming {
    timings: HashMap<&'static str, Vec<Duration>>,
}

impl PerfTiming {
    fn new() -> Self {
        Self {
            timings: HashMap::new(),
        }
    }

    fn record(&mut self, operation: &'static str, duration: Duration) {
        self.timings.entry(operation).or_default().push(duration);
    }

    fn summary(&self) -> serde_json::Value {
        let mut summary = serde_json::Map::new();

        for (op, durations) in &self.timings {
            if durations.is_empty() {
                continue;
            }

            let ms: Vec<f64> = durations.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
            let count = ms.len();
            let total_ms: f64 = ms.iter().sum();
            let min_ms = ms.iter().copied().fold(f64::INFINITY, f64::min);
            let max_ms = ms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let round = |v: f64| (v * 100.0).round() / 100.0;

            summary.insert(
                op.to_string(),
                json!({
                    "count": count,
                    "total_ms": round(total_ms),
                    "avg_ms": round(total_ms / count as f64),
                    "min_ms": round(min_ms),
                    "max_ms": round(max_ms),
                }),
            );
        }

        serde_json::Value::Object(summary)
    }
}

/// Parse command line arguments
struct Args {
    config: Option<String>,
    origin: Option<String>,
    version: Option<String>,
    registry_token: Option<String>,
    perf_output: Option<String>,
    json_logs: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            config: None,
            origin: None,
            version: None,
            registry_token: None,
            perf_output: None,
            json_logs: false,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => parsed.config = args.next(),
                "--origin" => parsed.origin = args.next(),
                "--version" => parsed.version = args.next(),
                "--registry-token" => parsed.registry_token = args.next(),
                "--perf-output" => parsed.perf_output = args.next(),
                "--json-logs" => parsed.json_logs = true,
                other => eprintln!("Warning: ignoring unknown argument {other}"),
            }
        }
        parsed
    }

    fn worker_config(&self) -> Result<WorkerConfig> {
        let mut config = match self.config {
            Some(ref path) => WorkerConfig::from_path(path)
                .with_context(|| format!("loading worker config from {path}"))?,
            None => WorkerConfig::default(),
        };
        if let Some(ref origin) = self.origin {
            config.origin = Url::parse(origin).with_context(|| format!("invalid origin {origin}"))?;
        }
        if let Some(ref version) = self.version {
            config = config.with_version(version.clone());
        }
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(if args.json_logs {
        LogConfig::production()
    } else {
        LogConfig::worker()
    });

    let config = args.worker_config()?;
    let origin = config.origin.clone();
    info!(origin = %origin, cache = %config.cache_name(), "Starting smoke run");

    let fetcher = Arc::new(HttpFetcher::new(LoaderConfig::default())?);
    let tray = Arc::new(NotificationTray::new(Permission::Granted));
    let clients = Arc::new(ClientList::new());
    let services = WorkerServices {
        fetcher: fetcher.clone(),
        presenter: tray.clone(),
        clients: clients.clone(),
        storage: CacheStorage::shared(),
    };

    let start = Instant::now();
    let mut perf = PerfTiming::new();
    let (worker, mut lifecycle) = ServiceWorker::new(config, services);
    clients.add_window(origin.as_str()).await;

    let step = Instant::now();
    let precache = match worker.dispatch(WorkerEvent::Install).await? {
        EventOutcome::Installed(report) => report,
        other => anyhow::bail!("install produced {other:?}"),
    };
    perf.record("install", step.elapsed());

    let step = Instant::now();
    let pruned = match worker.dispatch(WorkerEvent::Activate).await? {
        EventOutcome::Activated { pruned, .. } => pruned,
        other => anyhow::bail!("activate produced {other:?}"),
    };
    perf.record("activate", step.elapsed());

    let mut fetches = Vec::new();
    for (path, navigate) in [("/", true), ("/icons/favicon.svg", false), ("/", true)] {
        let url = origin.join(path)?;
        let request = if navigate {
            Request::navigate(url)
        } else {
            Request::get(url)
        };
        let step = Instant::now();
        let result = worker.dispatch(WorkerEvent::Fetch(request)).await;
        perf.record("fetch", step.elapsed());
        match result {
            Ok(EventOutcome::Fetch(outcome)) => {
                fetches.push(json!({ "path": path, "source": format!("{:?}", outcome.source()) }))
            }
            Ok(other) => warn!(?other, "Unexpected fetch outcome"),
            Err(e) => {
                error!(path, error = %e, "Fetch failed");
                fetches.push(json!({ "path": path, "error": e.to_string() }));
            }
        }
    }
    let step = Instant::now();
    let cache_writes = worker.wait_idle().await;
    perf.record("wait_idle", step.elapsed());

    let step = Instant::now();
    worker
        .dispatch(WorkerEvent::Message(json!({
            "type": "SHOW_NOTIFICATION",
            "data": { "title": "Smoke", "body": "Local notification", "url": "/" }
        })))
        .await?;
    let pushed = worker
        .dispatch(WorkerEvent::Push(Some(Bytes::from_static(
            br#"{"title":"Fleet update","url":"/spaceships"}"#,
        ))))
        .await?;
    perf.record("notify", step.elapsed());

    let mut click = serde_json::Value::Null;
    if let EventOutcome::NotificationShown { tag } = pushed {
        if let Some(notification) = tray.get(&tag).await {
            let step = Instant::now();
            let outcome = worker
                .dispatch(WorkerEvent::NotificationClick {
                    notification,
                    action: None,
                })
                .await?;
            perf.record("click", step.elapsed());
            click = json!(format!("{outcome:?}"));
        }
    }

    let mut registry = serde_json::Value::Null;
    if let Some(token) = args.registry_token {
        let api = ApiConfig::new(origin.as_str())?;
        let client = RegistryClient::new(api, fetcher).with_token(token);
        let step = Instant::now();
        registry = match client.list_spaceships().await {
            Ok(ships) => json!({ "spaceships": ships.len() }),
            Err(e) => json!({ "error": e.to_string() }),
        };
        perf.record("registry", step.elapsed());
    }

    let mut states = Vec::new();
    while let Ok(event) = lifecycle.try_recv() {
        states.push(format!("{event:?}"));
    }

    if let Some(ref perf_path) = args.perf_output {
        let perf_json = json!({
            "timings": perf.summary(),
            "total_elapsed_ms": start.elapsed().as_millis()
        });
        if let Err(e) = std::fs::write(perf_path, perf_json.to_string()) {
            error!(?e, "Failed to write perf output");
        } else {
            info!(?perf_path, "Perf summary written");
        }
    }

    let result = json!({
        "status": if precache.failed.is_empty() { "pass" } else { "degraded" },
        "elapsed_ms": start.elapsed().as_millis(),
        "state": worker.state().await.as_str(),
        "cache": {
            "name": worker.store().name(),
            "entries": worker.store().len().await,
            "precached": precache.stored,
            "precache_failures": precache.failed,
            "pruned": pruned,
            "background_writes": cache_writes,
        },
        "fetches": fetches,
        "notifications_visible": tray.visible().await.len(),
        "click": click,
        "registry": registry,
        "lifecycle": states,
        "perf": perf.summary()
    });
    println!("{}", result);
    Ok(())
}
