#![recursion_limit = "256"]

use std::sync::Arc;

use alloy::transports::http::reqwest::Url;
use engine_core::credentials::PlaintextDecryptor;
use engine_executors::{
    confirm::ConfirmationWatcher,
    events::{EventBus, spawn_listener},
    queue::{TransactionQueue, worker::QueueWorkerPool},
    retry::RetryOrchestrator,
    shutdown::ShutdownHandle,
    signer_resolver::SignerResolver,
    store::RedisExecutorStore,
};
use engine_server::{LoggingListener, build_chain_service, config};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::get_config()?;

    let subscriber = tracing_subscriber::registry().with(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "engine_server=debug,engine_executors=debug,engine_core=debug".into()
        }),
    );

    match config.server.log_format {
        config::LogFormat::Json => subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        config::LogFormat::Pretty => subscriber.with(tracing_subscriber::fmt::layer()).init(),
    }

    let chains = Arc::new(build_chain_service(&config.chains)?);
    tracing::info!(chains = config.chains.len(), "Chain service initialized");

    let store = Arc::new(
        RedisExecutorStore::connect(&config.redis.url, config.redis.namespace.clone()).await?,
    );
    tracing::info!("Redis store initialized");

    config.custody.check_plaintext_credentials()?;
    tracing::warn!("Wallet credentials are read as plaintext; do not use stored secrets from production");

    let default_custody_url = config
        .custody
        .remote_custody_url
        .as_deref()
        .map(Url::parse)
        .transpose()?;
    let resolver = Arc::new(SignerResolver::new(
        Arc::new(PlaintextDecryptor),
        default_custody_url,
    ));

    let events = EventBus::default();
    let queue = Arc::new(TransactionQueue::new(
        store,
        chains,
        resolver,
        events.clone(),
        config.queue.execution(),
    ));

    if let Some(path) = &config.wallets_file {
        let wallets = config::load_wallets(path)?;
        for wallet in wallets {
            queue.register_wallet(wallet).await?;
        }
        tracing::info!(path = %path.display(), "Wallets registered");
    }

    tracing::info!("Starting background workers...");
    let shutdown = ShutdownHandle::new()
        .and_worker(spawn_listener(&events, LoggingListener))
        .and_worker(QueueWorkerPool::new(queue.clone(), config.queue.worker_pool()).start())
        .and_worker(RetryOrchestrator::new(queue.clone(), config.queue.retry()).start())
        .and_worker(
            ConfirmationWatcher::new(queue.clone(), config.queue.confirmation()).start(),
        );
    tracing::info!(workers = shutdown.worker_count(), "Engine running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    shutdown.shutdown().await?;
    tracing::info!("Engine stopped");

    Ok(())
}
