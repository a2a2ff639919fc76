use std::{sync::Arc, time::Duration};

use dashmap::DashSet;
use engine_core::{chain::ChainService, credentials::CredentialDecryptor, error::EngineError};
use tokio::{sync::Semaphore, task::JoinSet};

use super::{ProcessOutcome, TransactionQueue};
use crate::{
    shutdown::WorkerHandle,
    store::{ExecutorStore, TransactionRecord, TransactionStatus, WalletKey},
};

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    /// Wallets processed at the same time
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Queued records read per pass
    pub batch_size: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            poll_interval: Duration::from_millis(500),
            batch_size: 500,
        }
    }
}

/// Splits records into per-wallet groups, keeping each group in input order
/// and the groups in order of first appearance.
pub fn group_by_wallet(records: Vec<TransactionRecord>) -> Vec<(WalletKey, Vec<TransactionRecord>)> {
    let mut groups: Vec<(WalletKey, Vec<TransactionRecord>)> = Vec::new();
    for record in records {
        let key = record.wallet_key();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, group)) => group.push(record),
            None => groups.push((key, vec![record])),
        }
    }
    groups
}

/// Marks a wallet as being drained until dropped, including when the
/// draining task panics.
struct InFlightGuard {
    in_flight: Arc<DashSet<WalletKey>>,
    key: WalletKey,
}

impl InFlightGuard {
    /// `None` when the wallet is already being drained.
    fn claim(in_flight: &Arc<DashSet<WalletKey>>, key: WalletKey) -> Option<Self> {
        in_flight.insert(key).then(|| Self {
            in_flight: in_flight.clone(),
            key,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// Drains queued records. Wallets run concurrently up to the configured
/// limit; records of one wallet are sent one after another, oldest first.
///
/// Every pass reads the queued set from the store, so records left queued by
/// an earlier process are picked up on start.
pub struct QueueWorkerPool<S, CS, D> {
    queue: Arc<TransactionQueue<S, CS, D>>,
    config: WorkerPoolConfig,
    permits: Arc<Semaphore>,
    in_flight: Arc<DashSet<WalletKey>>,
}

impl<S, CS, D> QueueWorkerPool<S, CS, D>
where
    S: ExecutorStore,
    CS: ChainService + 'static,
    D: CredentialDecryptor,
{
    pub fn new(queue: Arc<TransactionQueue<S, CS, D>>, config: WorkerPoolConfig) -> Self {
        Self {
            queue,
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            in_flight: Arc::new(DashSet::new()),
            config,
        }
    }

    pub fn start(self) -> WorkerHandle {
        WorkerHandle::spawn("queue-worker-pool", move |mut shutdown_rx| async move {
            let notify = self.queue.notifier();
            let mut interval = tokio::time::interval(self.config.poll_interval);
            let mut tasks = JoinSet::new();

            tracing::info!(concurrency = self.config.concurrency, "Queue worker pool started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = notify.notified() => {}
                    _ = interval.tick() => {}
                }

                while let Some(result) = tasks.try_join_next() {
                    if let Err(e) = result {
                        tracing::error!(error = ?e, "Wallet task panicked");
                    }
                }

                if let Err(e) = self.dispatch(&mut tasks).await {
                    tracing::warn!(error = %e, "Failed to read queued transactions");
                }
            }

            tracing::info!(in_flight = tasks.len(), "Waiting for in-flight wallets");
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    tracing::error!(error = ?e, "Wallet task panicked");
                }
            }
            Ok(())
        })
    }

    /// Runs one pass inline and waits for it.
    pub async fn run_once(&self) -> Result<(), EngineError> {
        let mut tasks = JoinSet::new();
        self.dispatch(&mut tasks).await?;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = ?e, "Wallet task panicked");
            }
        }
        Ok(())
    }

    async fn dispatch(&self, tasks: &mut JoinSet<()>) -> Result<(), EngineError> {
        let queued = self
            .queue
            .store()
            .list_transactions(TransactionStatus::Queued, self.config.batch_size)
            .await?;

        for (key, records) in group_by_wallet(queued) {
            // A wallet already being drained will see these records on its next pass
            let Some(guard) = InFlightGuard::claim(&self.in_flight, key) else {
                continue;
            };

            let queue = self.queue.clone();
            let permits = self.permits.clone();

            tasks.spawn(async move {
                let _guard = guard;
                if let Ok(_permit) = permits.acquire_owned().await {
                    drain_wallet(&queue, key, records).await;
                }
            });
        }
        Ok(())
    }
}

async fn drain_wallet<S, CS, D>(
    queue: &TransactionQueue<S, CS, D>,
    key: WalletKey,
    records: Vec<TransactionRecord>,
) where
    S: ExecutorStore,
    CS: ChainService,
    D: CredentialDecryptor,
{
    for record in records {
        match queue.process(&record.queue_id).await {
            Ok(ProcessOutcome::Sent { .. } | ProcessOutcome::Errored | ProcessOutcome::Skipped) => {}
            Err(e) => {
                // Keep the wallet's order: later records wait for this one
                tracing::warn!(
                    wallet = %key,
                    queue_id = %record.queue_id,
                    error = %e,
                    "Processing aborted, will retry on next pass"
                );
                break;
            }
        }
    }
}
