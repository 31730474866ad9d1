//! Cornstand server: configuration, logging, wiring, and the HTTP listener.

use anyhow::Context;
use cornstand::audit::AuditStore;
use cornstand::rate_limit::RateLimiter;
use cornstand::telemetry::{LogSink, TelemetrySink};
use cornstand::{
    AppState, Clock, Config, DynamicConfig, HistoryService, InMemoryAuditStore, InMemoryTokenStore,
    LocalDenyCache, LogFormat, PurchasePolicy, PurchaseWorkflow, StageTimeout, StaticTokenIdentity,
    SystemClock, TokenBucket,
};
use cornstand_jsonl::JsonlSink;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,cornstand=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("loading configuration")?;
    init_tracing(config.log_format);

    let window = DynamicConfig::new(config.window());
    spawn_window_reload(window.clone());
    let app = cornstand::router(build_state(&config, window));
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;

    tracing::info!(
        bind = %config.bind,
        window_secs = config.window_secs,
        price_policy = ?config.price_policy,
        "cornstand listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;
    tracing::info!("cornstand stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn build_state(config: &Config, window: DynamicConfig<Duration>) -> AppState {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn AuditStore> = Arc::new(InMemoryAuditStore::with_clock(clock.clone()));
    let timeout = StageTimeout::new(config.stage_timeout());

    if config.tokens.is_empty() {
        tracing::warn!("no bearer tokens configured; every request will be unauthenticated");
    }
    let identity = Arc::new(StaticTokenIdentity::from_pairs(config.tokens.clone()));

    // The limiter and the 429 message read the same live window.
    let policy = PurchasePolicy { window: window.clone(), ..PurchasePolicy::from(config) };
    let limiter = match &config.events_path {
        Some(path) => {
            tracing::info!(path = %path, "writing admission events as JSON lines");
            build_limiter(config, window, JsonlSink::new(path))
        }
        None => build_limiter(config, window, LogSink),
    };

    let workflow = PurchaseWorkflow::new(identity.clone(), limiter, store.clone())
        .with_policy(policy)
        .with_timeout(timeout);
    let history = HistoryService::new(identity, store).with_timeout(timeout);
    AppState::new(workflow, history)
}

fn build_limiter<K>(config: &Config, window: DynamicConfig<Duration>, sink: K) -> Arc<dyn RateLimiter>
where
    K: TelemetrySink + Sync,
    K::Future: Send + 'static,
{
    let mut bucket = TokenBucket::new(InMemoryTokenStore::new(), config.window())
        .with_capacity(config.bucket_capacity)
        .with_window(window)
        .with_sink(sink);
    if config.local_cache {
        bucket = bucket.with_local_cache(Arc::new(LocalDenyCache::default()));
    }
    Arc::new(bucket)
}

/// Re-read configuration on SIGHUP and apply the new admission window.
#[cfg(unix)]
fn spawn_window_reload(window: DynamicConfig<Duration>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangups = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "SIGHUP reload unavailable");
                return;
            }
        };
        while hangups.recv().await.is_some() {
            match Config::load() {
                Ok(cfg) => {
                    let previous = *window.get();
                    window.set(cfg.window());
                    tracing::info!(?previous, current = ?cfg.window(), "admission window reloaded");
                }
                Err(e) => tracing::warn!(error = %e, "config reload failed; keeping current window"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_window_reload(_window: DynamicConfig<Duration>) {}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
