use std::{sync::Arc, time::Duration};

use engine_core::{chain::ChainService, credentials::CredentialDecryptor, error::EngineError};

use crate::{
    queue::{ConfirmationOutcome, TransactionQueue, worker::group_by_wallet},
    shutdown::WorkerHandle,
    store::{ExecutorStore, TransactionStatus},
};

#[derive(Debug, Clone, Copy)]
pub struct ConfirmationConfig {
    pub interval: Duration,
    pub batch_size: usize,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfirmationPassSummary {
    pub mined: usize,
    pub pending: usize,
    pub errored: usize,
    pub failed: usize,
}

/// Polls receipts for `sent` transactions and moves them to `mined`, or to
/// `errored` once their nonce was consumed by something else.
pub struct ConfirmationWatcher<S, CS, D> {
    queue: Arc<TransactionQueue<S, CS, D>>,
    config: ConfirmationConfig,
}

impl<S, CS, D> ConfirmationWatcher<S, CS, D>
where
    S: ExecutorStore,
    CS: ChainService + 'static,
    D: CredentialDecryptor,
{
    pub fn new(queue: Arc<TransactionQueue<S, CS, D>>, config: ConfirmationConfig) -> Self {
        Self { queue, config }
    }

    pub fn start(self) -> WorkerHandle {
        WorkerHandle::spawn("confirmation-watcher", move |mut shutdown_rx| async move {
            let mut interval = tokio::time::interval(self.config.interval);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = interval.tick() => {}
                }

                if let Err(e) = self.run_once().await {
                    tracing::warn!(error = %e, "Confirmation pass failed");
                }
            }
            Ok(())
        })
    }

    #[tracing::instrument(skip_all, name = "confirmation_pass")]
    pub async fn run_once(&self) -> Result<ConfirmationPassSummary, EngineError> {
        let sent = self
            .queue
            .store()
            .list_transactions(TransactionStatus::Sent, self.config.batch_size)
            .await?;

        let results = futures::future::join_all(group_by_wallet(sent).into_iter().map(
            |(key, records)| {
                let queue = &self.queue;
                async move {
                    let mut summary = ConfirmationPassSummary::default();
                    for record in records {
                        match queue.check_confirmation(&record.queue_id).await {
                            Ok(ConfirmationOutcome::Mined) => summary.mined += 1,
                            Ok(ConfirmationOutcome::Pending) => summary.pending += 1,
                            Ok(ConfirmationOutcome::Errored) => summary.errored += 1,
                            Ok(ConfirmationOutcome::Skipped) => {}
                            Err(e) => {
                                tracing::warn!(
                                    wallet = %key,
                                    queue_id = %record.queue_id,
                                    error = %e,
                                    "Confirmation check failed"
                                );
                                summary.failed += 1;
                            }
                        }
                    }
                    summary
                }
            },
        ))
        .await;

        let summary = results
            .into_iter()
            .fold(ConfirmationPassSummary::default(), |acc, s| ConfirmationPassSummary {
                mined: acc.mined + s.mined,
                pending: acc.pending + s.pending,
                errored: acc.errored + s.errored,
                failed: acc.failed + s.failed,
            });

        if summary.mined + summary.errored + summary.failed > 0 {
            tracing::info!(?summary, "Confirmation pass finished");
        }
        Ok(summary)
    }
}
