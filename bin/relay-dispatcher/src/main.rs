//! SMS Relay Dispatcher
//!
//! Runs the store scheduler until SIGINT/SIGTERM and serves `/health`,
//! `/ready` and `/metrics` alongside it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{extract::State, routing::get, Json, Router};
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use relay_common::logging::{init_logging, LogFormat};
use relay_config::{AppConfig, ConfigLoader, NotificationConfig};
use relay_dispatch::{
    store, BatchingEngine, ChunkKey, ChunkPolicy, ChunkSender, HttpDeliveryClient,
    HttpDeliveryConfig, NoOpNotifier, Notifier, Routing, SchedulerConfig, SmtpNotifier,
    SmtpNotifierConfig, StoreHandle, StoreScheduler,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "relay-dispatcher")]
#[command(about = "Sends queued outbound SMS from relay message stores to HTTP gateways")]
struct Args {
    /// Config file (otherwise searched in the standard locations)
    #[arg(long, short, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Print an example configuration and exit
    #[arg(long)]
    print_example: bool,
}

#[derive(Clone)]
struct AppState {
    prometheus: PrometheusHandle,
    stores: Arc<Vec<String>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_example {
        print!("{}", AppConfig::example_toml());
        return Ok(());
    }

    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = loader.load()?;

    let format: LogFormat = config.logging.format.parse().map_err(anyhow::Error::msg)?;
    init_logging("relay-dispatcher", format)?;

    config.validate()?;
    let store_names: Vec<String> = config.stores.keys().cloned().collect();
    if args.check {
        info!(stores = ?store_names, "Configuration is valid");
        return Ok(());
    }

    info!(stores = ?store_names, "Starting SMS relay dispatcher");

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let stores = open_stores(&config).await?;

    let client = HttpDeliveryClient::new(HttpDeliveryConfig {
        request_timeout: config.dispatch.delivery_timeout(),
        connect_timeout: config.dispatch.connect_timeout(),
        ..Default::default()
    })?;
    let chunk_key = if config.dispatch.chunk_by_text {
        ChunkKey::BackendAndText
    } else {
        ChunkKey::Backend
    };
    let engine = BatchingEngine::new(
        ChunkSender::new(
            Arc::new(client),
            ChunkPolicy {
                exclude_alphabetic_identities: config.dispatch.exclude_alphabetic_identities,
            },
        ),
        chunk_key,
    );

    let notifier = build_notifier(&config.notifications)?;
    info!(notifications = notifier.is_enabled(), "Failure notifier ready");

    let scheduler = Arc::new(StoreScheduler::new(
        SchedulerConfig {
            chunk_size: config.dispatch.chunk_size,
            poll_interval: config.dispatch.poll_interval(),
        },
        stores,
        engine,
        notifier,
    ));

    let cancel = CancellationToken::new();

    let scheduler_handle = {
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    let state = AppState {
        prometheus,
        stores: Arc::new(store_names),
    };
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port)
        .parse()
        .context("invalid http host/port")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    let http_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
            {
                error!(error = %e, "HTTP server error");
            }
        })
    };

    shutdown_signal().await;
    info!("Shutdown signal received, finishing current pass");
    cancel.cancel();

    let drained = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = scheduler_handle.await;
        let _ = http_handle.await;
    })
    .await;
    if drained.is_err() {
        warn!("Shutdown timed out after 30s");
    }

    info!("SMS relay dispatcher stopped");
    Ok(())
}

async fn open_stores(config: &AppConfig) -> anyhow::Result<Vec<StoreHandle>> {
    let mut handles = Vec::with_capacity(config.stores.len());

    for (name, store_config) in &config.stores {
        let store = store::connect(&store_config.url, store_config.max_connections)
            .await
            .with_context(|| format!("failed to open store '{}'", name))?;
        if store_config.init_schema {
            store
                .init_schema()
                .await
                .with_context(|| format!("failed to initialize schema for store '{}'", name))?;
        }

        let routing = Routing::new(store_config.router_url.clone())
            .with_params(store_config.params.clone());
        info!(store = %name, max_connections = store_config.max_connections, "Store opened");
        handles.push(StoreHandle::new(name.clone(), store, routing));
    }

    Ok(handles)
}

fn build_notifier(config: &NotificationConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    if !config.enabled {
        info!("Failure notifications disabled");
        return Ok(Arc::new(NoOpNotifier));
    }

    let notifier = SmtpNotifier::new(SmtpNotifierConfig {
        smtp_url: config.smtp_url.clone(),
        from: config.from.clone(),
        recipients: config.recipients.clone(),
        subject: config.subject.clone(),
    })
    .context("invalid notification settings")?;
    Ok(Arc::new(notifier))
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.prometheus.render()
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "READY",
        "stores": state.stores.as_slice()
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
