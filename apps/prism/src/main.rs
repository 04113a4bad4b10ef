mod catalog_file;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use prism_coord::{CoordinationStore, MemoryStore, RedisStore};
use prism_core::{
    DispatchConfig, Dispatcher, HealthMonitor, UpstreamClientConfig, WreqUpstreamClient,
};
use prism_router::AppState;
use prism_storage::{DbStorage, NullStorage, RetentionPolicy, Storage};

#[derive(Debug, Parser)]
#[command(name = "prism", about = "Multi-tenant LLM API gateway")]
struct Args {
    #[arg(long, env = "PRISM_HOST", default_value = "0.0.0.0")]
    host: String,
    #[arg(long, env = "PRISM_PORT", default_value_t = 8080)]
    port: u16,
    /// Declarative catalog file (providers, endpoints, keys, models).
    #[arg(long, env = "PRISM_CATALOG")]
    catalog: std::path::PathBuf,
    /// Redis URL for cross-worker coordination. Without it the gateway
    /// falls back to process-local counters (single worker only).
    #[arg(long, env = "PRISM_REDIS_URL")]
    redis_url: Option<String>,
    /// Database DSN for usage metering and telemetry.
    #[arg(long, env = "PRISM_DATABASE_URL")]
    database_url: Option<String>,
    /// Outbound proxy for upstream egress.
    #[arg(long, env = "PRISM_OUTBOUND_PROXY")]
    outbound_proxy: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,prism=debug".into()),
        )
        .init();

    let args = Args::parse();

    let catalog = catalog_file::load(&args.catalog)
        .with_context(|| format!("loading catalog from {}", args.catalog.display()))?;

    let coord: Arc<dyn CoordinationStore> = match args.redis_url.as_deref() {
        Some(url) => {
            let store = RedisStore::connect(url).context("connecting to redis")?;
            tracing::info!(url, "redis coordination enabled");
            Arc::new(store)
        }
        None => {
            tracing::warn!("no redis configured; using in-process coordination");
            Arc::new(MemoryStore::new())
        }
    };

    let storage: Arc<dyn Storage> = match args.database_url.as_deref() {
        Some(dsn) => {
            let storage = DbStorage::connect(dsn).await.context("connecting to db")?;
            storage.sync().await.context("syncing schema")?;
            Arc::new(storage)
        }
        None => {
            tracing::warn!("no database configured; usage metering disabled");
            Arc::new(NullStorage)
        }
    };

    let client = WreqUpstreamClient::new(UpstreamClientConfig {
        proxy: args.outbound_proxy.clone(),
        ..UpstreamClientConfig::default()
    })
    .context("building upstream client")?;

    let dispatcher = Arc::new(Dispatcher::new(
        catalog.clone(),
        coord,
        Arc::new(HealthMonitor::default()),
        Arc::clone(&storage),
        Arc::new(client),
        DispatchConfig::default(),
    ));

    spawn_retention_cleanup(Arc::clone(&storage));

    let app = prism_router::router(AppState {
        dispatcher,
        catalog,
    });

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "prism listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

fn spawn_retention_cleanup(storage: Arc<dyn Storage>) {
    tokio::spawn(async move {
        let policy = RetentionPolicy::default();
        let mut tick = tokio::time::interval(Duration::from_secs(6 * 3600));
        loop {
            tick.tick().await;
            match storage.cleanup(&policy).await {
                Ok((candidates, usage)) if candidates + usage > 0 => {
                    tracing::info!(candidates, usage, "retention cleanup done");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(%err, "retention cleanup failed"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to listen for shutdown signal");
    }
}
