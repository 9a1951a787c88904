use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use payrail_config::Settings;
use payrail_exchange::BinanceClient;
use payrail_poller::{PollerConfig, PollerService};
use payrail_rpc::ApiState;
use payrail_storage::PgStore;
use payrail_webhook::{WebhookConfig, WebhookWorker};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Api,
    Poller,
    WebhookWorker,
    All,
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Error reporting is opt-in: without SENTRY_DSN this is a no-op.
pub fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    settings.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    })
}

/// Shutdown channel flipped by ctrl-c. Loops observe it between iterations;
/// in-flight transactions finish before the process exits.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = tx.send(true);
        }
    });
    rx
}

fn build_poller(settings: &Settings, store: PgStore) -> Result<PollerService> {
    let (key, secret) = settings.binance_credentials()?;
    let client = BinanceClient::new(key, secret, &settings.binance_base_url)?;
    Ok(PollerService::new(
        client,
        store,
        PollerConfig {
            poll_interval: Duration::from_secs(settings.poller_poll_interval_seconds),
            window_ms: settings.poller_window_ms,
            initial_lookback_ms: settings.poller_initial_lookback_ms,
            amount_diff_k: settings.amount_diff_k,
            default_confirmations: settings.default_confirmations,
        },
    ))
}

fn build_webhook_worker(settings: &Settings, store: PgStore) -> Result<WebhookWorker> {
    let secret = settings.webhook_secret()?.to_string();
    WebhookWorker::new(
        store,
        WebhookConfig {
            poll_interval: Duration::from_secs(settings.webhook_worker_poll_seconds),
            max_attempts: settings.webhook_max_attempts,
            backoff_base_seconds: settings.webhook_backoff_base_seconds,
            secret,
        },
    )
}

pub async fn run(settings: Settings, service: Service) -> Result<()> {
    let store = PgStore::connect(&settings.database_url, settings.db_pool_size).await?;
    let shutdown = shutdown_signal();
    match service {
        Service::Api => {
            let state = ApiState {
                store,
                settings: Arc::new(settings.clone()),
            };
            payrail_rpc::serve(&settings.api_addr, state, shutdown).await
        }
        Service::Poller => {
            let _metrics = tokio::spawn(payrail_metrics::serve(settings.poller_metrics_port));
            let poller = build_poller(&settings, store)?;
            poller.run(shutdown).await
        }
        Service::WebhookWorker => {
            let _metrics = tokio::spawn(payrail_metrics::serve(settings.webhook_metrics_port));
            let worker = build_webhook_worker(&settings, store)?;
            worker.run(shutdown).await
        }
        Service::All => {
            let _metrics = tokio::spawn(payrail_metrics::serve(settings.poller_metrics_port));
            let _metrics = tokio::spawn(payrail_metrics::serve(settings.webhook_metrics_port));
            let state = ApiState {
                store: store.clone(),
                settings: Arc::new(settings.clone()),
            };
            let poller = build_poller(&settings, store.clone())?;
            let worker = build_webhook_worker(&settings, store)?;
            let api = payrail_rpc::serve(&settings.api_addr, state, shutdown.clone());
            tokio::try_join!(api, poller.run(shutdown.clone()), worker.run(shutdown))?;
            Ok(())
        }
    }
}
