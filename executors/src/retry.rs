use std::{collections::HashMap, sync::Arc, time::Duration};

use engine_core::{
    chain::{Chain, ChainService},
    credentials::CredentialDecryptor,
    error::EngineError,
};

use crate::{
    queue::{ResendOutcome, TransactionQueue, now_ms, worker::group_by_wallet},
    shutdown::WorkerHandle,
    store::{ExecutorStore, TransactionRecord, TransactionStatus},
};

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// A sent transaction older than this is resent with higher fees
    pub resend_after: Duration,
    /// Also resend once this many blocks passed since the last attempt
    pub resend_after_blocks: Option<u64>,
    pub interval: Duration,
    pub batch_size: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            resend_after: Duration::from_secs(60),
            resend_after_blocks: None,
            interval: Duration::from_secs(5),
            batch_size: 500,
        }
    }
}

/// Counts of what a single pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPassSummary {
    pub resent: usize,
    pub mined: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Finds stuck `sent` transactions and replaces them with the same nonce
/// and escalated fees.
pub struct RetryOrchestrator<S, CS, D> {
    queue: Arc<TransactionQueue<S, CS, D>>,
    config: RetryConfig,
}

impl<S, CS, D> RetryOrchestrator<S, CS, D>
where
    S: ExecutorStore,
    CS: ChainService + 'static,
    D: CredentialDecryptor,
{
    pub fn new(queue: Arc<TransactionQueue<S, CS, D>>, config: RetryConfig) -> Self {
        Self { queue, config }
    }

    pub fn start(self) -> WorkerHandle {
        WorkerHandle::spawn("retry-orchestrator", move |mut shutdown_rx| async move {
            let mut interval = tokio::time::interval(self.config.interval);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = interval.tick() => {}
                }

                if let Err(e) = self.run_once().await {
                    tracing::warn!(error = %e, "Retry pass failed");
                }
            }
            Ok(())
        })
    }

    /// Resends every stale transaction once. Wallets run concurrently; one
    /// wallet's transactions are resent in nonce order.
    #[tracing::instrument(skip_all, name = "retry_pass")]
    pub async fn run_once(&self) -> Result<RetryPassSummary, EngineError> {
        let sent = self
            .queue
            .store()
            .list_transactions(TransactionStatus::Sent, self.config.batch_size)
            .await?;
        if sent.is_empty() {
            return Ok(RetryPassSummary::default());
        }

        let blocks = self.current_blocks(&sent).await;
        let now = now_ms();

        let mut stale: Vec<TransactionRecord> = sent
            .into_iter()
            .filter(|record| self.is_stale(record, now, blocks.get(&record.chain_id).copied()))
            .collect();
        stale.sort_by_key(|record| (record.chain_id, record.from_address, record.nonce));

        let groups = group_by_wallet(stale);
        let results = futures::future::join_all(groups.into_iter().map(|(key, records)| {
            let queue = &self.queue;
            async move {
                let mut summary = RetryPassSummary::default();
                for record in records {
                    match queue.resend(&record.queue_id).await {
                        Ok(ResendOutcome::Resent { .. }) => summary.resent += 1,
                        Ok(ResendOutcome::Mined) => summary.mined += 1,
                        Ok(ResendOutcome::Skipped) => summary.skipped += 1,
                        Err(e) => {
                            tracing::warn!(
                                wallet = %key,
                                queue_id = %record.queue_id,
                                error = %e,
                                "Resend failed"
                            );
                            summary.failed += 1;
                        }
                    }
                }
                summary
            }
        }))
        .await;

        let summary = results.into_iter().fold(RetryPassSummary::default(), |acc, s| RetryPassSummary {
            resent: acc.resent + s.resent,
            mined: acc.mined + s.mined,
            skipped: acc.skipped + s.skipped,
            failed: acc.failed + s.failed,
        });

        if summary != RetryPassSummary::default() {
            tracing::info!(?summary, "Retry pass finished");
        }
        Ok(summary)
    }

    fn is_stale(&self, record: &TransactionRecord, now: u64, current_block: Option<u64>) -> bool {
        if record.retry_override.is_some() {
            return true;
        }

        let resend_after = u64::try_from(self.config.resend_after.as_millis()).unwrap_or(u64::MAX);
        let aged = record
            .sent_at
            .is_some_and(|sent_at| now.saturating_sub(sent_at) >= resend_after);

        let lagging = match (self.config.resend_after_blocks, record.sent_at_block, current_block) {
            (Some(blocks), Some(sent_at_block), Some(current)) => {
                current.saturating_sub(sent_at_block) >= blocks
            }
            _ => false,
        };

        aged || lagging
    }

    /// Latest block per chain, read once per pass. Chains that fail to answer
    /// are left out and only age-based staleness applies to them.
    async fn current_blocks(&self, records: &[TransactionRecord]) -> HashMap<u64, u64> {
        let mut blocks = HashMap::new();
        if self.config.resend_after_blocks.is_none() {
            return blocks;
        }

        let mut chain_ids: Vec<u64> = records.iter().map(|r| r.chain_id).collect();
        chain_ids.sort_unstable();
        chain_ids.dedup();

        for chain_id in chain_ids {
            let block = match self.queue.chains().get_chain(chain_id) {
                Ok(chain) => chain.get_block_number().await,
                Err(e) => Err(e),
            };
            match block {
                Ok(block) => {
                    blocks.insert(chain_id, block);
                }
                Err(e) => tracing::warn!(chain_id, error = %e, "Failed to read block number"),
            }
        }
        blocks
    }
}
