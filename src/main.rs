use anyhow::Context;
use clap::Parser;
use order_stats_worker::broker::memory::MemoryBroker;
use order_stats_worker::broker::types::Broker;
use order_stats_worker::config::{BackendUrl, Config};
use order_stats_worker::executor::dispatcher::TaskDispatcher;
use order_stats_worker::executor::executor::TaskExecutor;
use order_stats_worker::executor::handlers::router;
use order_stats_worker::executor::registry::TaskHandlerRegistry;
use order_stats_worker::results::memory::MemoryResultStore;
use order_stats_worker::results::types::ResultStore;
use order_stats_worker::scheduler::run_periodic;
use order_stats_worker::stats::engine::StatsEngine;
use order_stats_worker::stats::lock::{LocalSingleFlight, SingleFlight};
use order_stats_worker::stats::store::{MemoryOrderStore, OrderStore};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; real deployments set the environment directly.
    dotenvy::dotenv().ok();
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();

    config.validate()?;

    tracing::info!(
        "Starting order-stats-worker: role={:?} broker={} results={} database={}",
        config.role,
        config.broker_url,
        config.result_url(),
        config.database_url
    );

    // 1. Backends:
    let broker = connect_broker(&config).await?;
    let results = connect_result_store(&config).await?;
    let store = connect_order_store(&config).await?;
    let lock = connect_lock(&config).await?;

    let dispatcher = TaskDispatcher::new(broker.clone(), results.clone());

    // 2. Workers:
    if config.role.runs_workers() {
        let registry = TaskHandlerRegistry::new();
        Arc::new(StatsEngine::new(store.clone(), lock)).register(&registry);

        let executor = TaskExecutor::new(broker.clone(), results.clone(), registry, config.workers);
        executor.start()?;
    }

    if !config.role.runs_api() {
        tracing::info!("Worker-only process, press Ctrl+C to shutdown");
        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutting down");
        return Ok(());
    }

    // 3. Periodic trigger:
    if let Some(period) = config.schedule_interval() {
        tokio::spawn(run_periodic(dispatcher.clone(), period));
    }

    // 4. HTTP server:
    let app = router(dispatcher, store);
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;

    tracing::info!("HTTP server listening on {}", config.bind);
    tracing::info!("Press Ctrl+C to shutdown");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}

async fn connect_broker(config: &Config) -> anyhow::Result<Arc<dyn Broker>> {
    match &config.broker_url {
        BackendUrl::Memory => Ok(Arc::new(MemoryBroker::new(config.visibility_timeout()))),
        #[cfg(feature = "redis")]
        BackendUrl::Redis(url) => {
            let broker = order_stats_worker::broker::redis::RedisBroker::connect(
                url,
                &config.queue,
                config.visibility_timeout(),
            )
            .await?;
            Ok(Arc::new(broker))
        }
        other => anyhow::bail!("broker backend {} is not compiled in", other),
    }
}

async fn connect_result_store(config: &Config) -> anyhow::Result<Arc<dyn ResultStore>> {
    match config.result_url() {
        BackendUrl::Memory => Ok(Arc::new(MemoryResultStore::new())),
        #[cfg(feature = "redis")]
        BackendUrl::Redis(url) => {
            let results =
                order_stats_worker::results::redis::RedisResultStore::connect(url, config.result_ttl())
                    .await?;
            Ok(Arc::new(results))
        }
        other => anyhow::bail!("result store backend {} is not compiled in", other),
    }
}

async fn connect_order_store(config: &Config) -> anyhow::Result<Arc<dyn OrderStore>> {
    match &config.database_url {
        BackendUrl::Memory => {
            tracing::warn!("Using an in-process order store; statistics will stay empty");
            Ok(Arc::new(MemoryOrderStore::new()))
        }
        #[cfg(feature = "postgres")]
        BackendUrl::Postgres(url) => {
            let store = order_stats_worker::stats::postgres::PostgresOrderStore::connect(url).await?;
            Ok(Arc::new(store))
        }
        other => anyhow::bail!("database backend {} is not compiled in", other),
    }
}

/// Workers in other processes share a Redis broker, so they share a Redis lock too.
async fn connect_lock(config: &Config) -> anyhow::Result<Arc<dyn SingleFlight>> {
    match &config.broker_url {
        #[cfg(feature = "redis")]
        BackendUrl::Redis(url) => {
            let ttl = config.visibility_timeout() * 4;
            let wait = config.visibility_timeout().max(std::time::Duration::from_secs(5));
            let lock =
                order_stats_worker::stats::lock::RedisSingleFlight::connect(url, ttl, wait).await?;
            Ok(Arc::new(lock))
        }
        _ => Ok(Arc::new(LocalSingleFlight::new())),
    }
}
