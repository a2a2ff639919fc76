use std::sync::Arc;

use alloy::primitives::Address;
use dashmap::DashMap;
use engine_core::{chain::Chain, error::EngineError};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::store::{ExecutorStore, NonceRecord, TransactionRecord, WalletKey};

#[derive(Debug, Default)]
struct WalletNonceState {
    /// `None` until seeded from the chain
    last_issued: Option<u64>,
}

/// Issues nonces per (chain, wallet), one issuer at a time.
///
/// The per-wallet lock doubles as the wallet's processing lock: whoever holds a
/// [`WalletLock`] is the only writer of that wallet's nonce counter and of its
/// transaction records until the lock is dropped.
pub struct NonceManager<S> {
    store: Arc<S>,
    wallets: DashMap<WalletKey, Arc<Mutex<WalletNonceState>>>,
}

impl<S: ExecutorStore> NonceManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            wallets: DashMap::new(),
        }
    }

    /// Waits for exclusive access to the wallet.
    pub async fn lock(&self, key: WalletKey) -> WalletLock<S> {
        let mutex = self
            .wallets
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(WalletNonceState::default())))
            .clone();

        WalletLock {
            key,
            state: mutex.lock_owned().await,
            store: self.store.clone(),
        }
    }

    /// Takes the wallet lock just long enough to issue one nonce.
    pub async fn next_nonce<C: Chain>(
        &self,
        chain: &C,
        wallet_address: Address,
    ) -> Result<u64, EngineError> {
        let key = WalletKey {
            chain_id: chain.chain_id(),
            address: wallet_address,
        };
        self.lock(key).await.next_nonce(chain).await
    }

    /// Records holding nonces in `[from_nonce, to_nonce]`. Does not take the
    /// wallet lock; assigned nonces never change.
    pub async fn nonce_range(
        &self,
        key: WalletKey,
        from_nonce: u64,
        to_nonce: u64,
    ) -> Result<Vec<TransactionRecord>, EngineError> {
        Ok(self.store.nonce_range(key, from_nonce, to_nonce).await?)
    }
}

/// Exclusive access to one wallet's nonce sequence.
pub struct WalletLock<S> {
    key: WalletKey,
    state: OwnedMutexGuard<WalletNonceState>,
    store: Arc<S>,
}

impl<S: ExecutorStore> WalletLock<S> {
    pub fn key(&self) -> WalletKey {
        self.key
    }

    pub fn last_issued(&self) -> Option<u64> {
        self.state.last_issued
    }

    /// Issues the next nonce. The first issue after startup or a resync reads
    /// the wallet's pending transaction count from the chain. After a restart
    /// the persisted counter is honoured as well, so nonces signed into
    /// attempts that never reached the mempool are not handed out again.
    ///
    /// The counter only advances once the new value is persisted.
    pub async fn next_nonce<C: Chain>(&mut self, chain: &C) -> Result<u64, EngineError> {
        let nonce = match self.state.last_issued {
            Some(last) => last.checked_add(1).ok_or_else(|| EngineError::InternalError {
                message: format!("Nonce overflow for {}", self.key),
            })?,
            None => {
                let persisted = self
                    .store
                    .get_nonce_record(self.key)
                    .await?
                    .and_then(|record| record.last_issued_nonce);
                let counts = chain.get_transaction_counts(self.key.address).await?;
                tracing::debug!(
                    wallet = %self.key,
                    latest = counts.latest,
                    pending = counts.pending,
                    persisted = ?persisted,
                    "Seeding nonce"
                );
                match persisted.and_then(|last| last.checked_add(1)) {
                    Some(next) => counts.pending.max(next),
                    None => counts.pending,
                }
            }
        };

        self.persist(Some(nonce)).await?;
        self.state.last_issued = Some(nonce);

        tracing::debug!(wallet = %self.key, nonce, "Issued nonce");
        Ok(nonce)
    }

    /// Forgets the counter so the next issue re-reads the chain.
    pub async fn resync(&mut self) {
        self.state.last_issued = None;
        if let Err(e) = self.persist(None).await {
            tracing::warn!(wallet = %self.key, error = %e, "Failed to persist nonce resync");
        }
        tracing::info!(wallet = %self.key, "Nonce counter reset, will resync from chain");
    }

    /// Returns an unused nonce. Only the most recently issued nonce can be
    /// returned; anything older would leave a gap.
    pub async fn release(&mut self, nonce: u64) -> bool {
        if self.state.last_issued != Some(nonce) {
            return false;
        }

        let previous = nonce.checked_sub(1);
        self.state.last_issued = previous;
        if let Err(e) = self.persist(previous).await {
            tracing::warn!(wallet = %self.key, nonce, error = %e, "Failed to persist released nonce");
        }

        tracing::debug!(wallet = %self.key, nonce, "Released nonce");
        true
    }

    async fn persist(&self, last_issued_nonce: Option<u64>) -> Result<(), EngineError> {
        self.store
            .save_nonce_record(&NonceRecord {
                chain_id: self.key.chain_id,
                wallet_address: self.key.address,
                last_issued_nonce,
            })
            .await?;
        Ok(())
    }
}
