mod config;
mod origin;
mod proxy;
mod stats;

use arc_swap::ArcSwap;
use axum::routing::{any, get};
use axum::Router;
use cachefront::{MemoryStore, SharedCache, TaskRegistry};
use config::Config;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use metrics_exporter_prometheus::PrometheusHandle;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use origin::HyperOrigin;
use parking_lot::Mutex;
use proxy::{proxy_handler, AppState};
use stats::{gauge_refresher, stats_handler};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

const CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = load_config(Path::new(CONFIG_PATH));

    let prom_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("prometheus recorder");

    let state = build_state(&config);
    let tasks = state.tasks.clone();
    tokio::spawn(gauge_refresher(Arc::clone(&state)));

    tracing::info!(
        proxy = %config.server.listen_addr,
        metrics = %config.server.metrics_addr,
        upstream = %config.upstream.url,
        cache_enabled = config.cache.enabled,
        max_entries = config.cache.max_entries,
        vary = ?config.cache.allowed_vary_headers,
        "cachefront proxy starting"
    );

    let proxy_listener = bind(&config.server.listen_addr, "proxy").await;
    let metrics_listener = bind(&config.server.metrics_addr, "metrics").await;
    let drain_grace = Duration::from_millis(config.server.drain_grace_ms);

    watch_config(PathBuf::from(CONFIG_PATH), config, Arc::clone(&state));

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let proxy_server = axum::serve(proxy_listener, proxy_router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let metrics_server = axum::serve(metrics_listener, admin_router(state, prom_handle))
        .with_graceful_shutdown(shutdown.cancelled_owned());

    tokio::select! {
        result = proxy_server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "proxy server error");
            }
        }
        result = metrics_server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        }
    }

    // Origin fetches may still be filling the cache for clients that left.
    tracing::info!(in_flight = tasks.len(), "waiting for upstream tasks");
    if !tasks.drain(drain_grace).await {
        let aborted = tasks.abort_all();
        tracing::warn!(aborted, "upstream tasks outlived the grace period, aborted");
    }

    tracing::info!("cachefront proxy shut down");
}

/// `config.toml` if present and valid, defaults otherwise.
fn load_config(path: &Path) -> Config {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file found, using defaults");
        return Config::default_config();
    }
    match Config::load(path) {
        Ok(c) => {
            tracing::info!(path = %path.display(), "loaded config");
            c
        }
        Err(e) => {
            tracing::error!(error = %e, path = %path.display(), "failed to load config, using defaults");
            Config::default_config()
        }
    }
}

fn build_state(config: &Config) -> Arc<AppState> {
    let store = Arc::new(MemoryStore::new(
        config.cache.max_entries,
        Some(config.cache.max_body_size_bytes),
    ));
    let cache = config.cache.enabled.then(|| {
        Arc::new(SharedCache::with_entry_expiry(
            store.clone(),
            Duration::from_secs(config.cache.entry_expiry_seconds),
        ))
    });

    let client = Client::builder(TokioExecutor::new()).build_http();
    let origin = Arc::new(HyperOrigin::new(client.clone(), config.upstream.url.clone()));

    Arc::new(AppState {
        filter_config: ArcSwap::from_pointee(config.cache.filter_config()),
        cache,
        store,
        origin,
        client,
        upstream_url: config.upstream.url.clone(),
        tasks: TaskRegistry::new(),
        timeout: config.upstream_timeout(),
        started: Instant::now(),
    })
}

async fn bind(addr: &str, what: &str) -> TcpListener {
    TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {what} listener to {addr}: {e}"))
}

fn proxy_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/{*path}", any(proxy_handler))
        .route("/", any(proxy_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn admin_router(state: Arc<AppState>, prom_handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/api/stats", get(stats_handler))
        .route(
            "/metrics",
            get(move || {
                let h = prom_handle.clone();
                async move { h.render() }
            }),
        )
        .with_state(state)
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, draining connections");
    token.cancel();
}

/// Reload the filter config whenever the config file changes.
fn watch_config(path: PathBuf, initial: Config, state: Arc<AppState>) {
    let current = Arc::new(Mutex::new(initial));

    let watched = path.clone();
    let on_event = move |res: Result<Event, notify::Error>| {
        let Ok(event) = res else { return };
        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
            return;
        }
        match Config::load(&watched) {
            Ok(new) => {
                let mut old = current.lock();
                config::diff_and_apply(&old, &new, &state.filter_config);
                *old = new;
            }
            Err(e) => tracing::error!(error = %e, "failed to reload config"),
        }
    };

    let mut watcher = match notify::recommended_watcher(on_event) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to start config watcher");
            return;
        }
    };
    if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
        tracing::warn!(error = %e, path = %path.display(), "failed to watch config file");
        return;
    }

    // The watcher stops when dropped; keep it for the life of the process.
    std::mem::forget(watcher);
    tracing::info!(path = %path.display(), "config file watcher started");
}
