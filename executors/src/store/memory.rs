use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use alloy::primitives::Address;

use super::{
    ExecutorStore, InsertOutcome, NonceRecord, StoreError, TransactionRecord, TransactionStatus,
    WalletKey, check_transition,
};
use crate::signer_resolver::WalletDescriptor;

#[derive(Default)]
struct State {
    /// queue id -> (insertion sequence, record)
    transactions: HashMap<String, (u64, TransactionRecord)>,
    idempotency: HashMap<String, String>,
    wallets: HashMap<Address, WalletDescriptor>,
    nonces: HashMap<WalletKey, NonceRecord>,
    sequence: u64,
}

/// Process-local store.
///
/// Every operation takes one short synchronous lock, which makes each write
/// atomic. The outage switches let tests exercise persistence failures.
pub struct InMemoryExecutorStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
    /// Transaction updates still allowed; `usize::MAX` means unlimited
    update_budget: AtomicUsize,
}

impl Default for InMemoryExecutorStore {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            unavailable: AtomicBool::new(false),
            update_budget: AtomicUsize::new(usize::MAX),
        }
    }
}

impl InMemoryExecutorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every operation with `Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fails only `update_transaction` while set; reads and nonce writes succeed.
    pub fn set_fail_updates(&self, fail: bool) {
        let budget = if fail { 0 } else { usize::MAX };
        self.update_budget.store(budget, Ordering::SeqCst);
    }

    /// Lets `successes` more transaction updates through, then fails the rest
    /// until reset with [`set_fail_updates`](Self::set_fail_updates).
    pub fn fail_updates_after(&self, successes: usize) {
        self.update_budget.store(successes, Ordering::SeqCst);
    }

    fn take_update(&self) -> bool {
        self.update_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |budget| match budget {
                usize::MAX => Some(usize::MAX),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok()
    }

    pub fn transaction_count(&self) -> usize {
        self.state.lock().map(|s| s.transactions.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                message: "in-memory store is offline".to_string(),
            });
        }
        self.state.lock().map_err(|_| StoreError::Unavailable {
            message: "in-memory store lock poisoned".to_string(),
        })
    }
}

impl ExecutorStore for InMemoryExecutorStore {
    async fn insert_transaction(
        &self,
        record: &TransactionRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let mut state = self.lock()?;

        if let Some(key) = &record.idempotency_key {
            if let Some(existing) = state.idempotency.get(key) {
                return Ok(InsertOutcome::Existing(existing.clone()));
            }
        }
        if state.transactions.contains_key(&record.queue_id) {
            return Err(StoreError::DuplicateQueueId {
                queue_id: record.queue_id.clone(),
            });
        }

        if let Some(key) = &record.idempotency_key {
            state
                .idempotency
                .insert(key.clone(), record.queue_id.clone());
        }
        state.sequence += 1;
        let sequence = state.sequence;
        state
            .transactions
            .insert(record.queue_id.clone(), (sequence, record.clone()));

        Ok(InsertOutcome::Inserted)
    }

    async fn get_transaction(&self, queue_id: &str) -> Result<Option<TransactionRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state.transactions.get(queue_id).map(|(_, r)| r.clone()))
    }

    async fn update_transaction(
        &self,
        record: &TransactionRecord,
        expected: TransactionStatus,
    ) -> Result<(), StoreError> {
        if !self.take_update() {
            return Err(StoreError::Unavailable {
                message: "in-memory store rejected write".to_string(),
            });
        }
        let mut state = self.lock()?;

        let stored = state
            .transactions
            .get_mut(&record.queue_id)
            .ok_or_else(|| StoreError::NotFound {
                queue_id: record.queue_id.clone(),
            })?;

        if stored.1.status != expected {
            return Err(StoreError::StatusConflict {
                queue_id: record.queue_id.clone(),
                expected,
                actual: stored.1.status,
            });
        }
        check_transition(record, expected)?;
        stored.1 = record.clone();

        if record.status.releases_idempotency_key() {
            if let Some(key) = &record.idempotency_key {
                if state.idempotency.get(key) == Some(&record.queue_id) {
                    state.idempotency.remove(key);
                }
            }
        }

        Ok(())
    }

    async fn list_transactions(
        &self,
        status: TransactionStatus,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let state = self.lock()?;
        let mut matching: Vec<_> = state
            .transactions
            .values()
            .filter(|(_, r)| r.status == status)
            .collect();
        matching.sort_by_key(|(sequence, _)| *sequence);

        Ok(matching
            .into_iter()
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn nonce_range(
        &self,
        key: WalletKey,
        from_nonce: u64,
        to_nonce: u64,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let state = self.lock()?;
        let mut matching: Vec<TransactionRecord> = state
            .transactions
            .values()
            .map(|(_, r)| r)
            .filter(|r| r.wallet_key() == key)
            .filter(|r| matches!(r.nonce, Some(n) if (from_nonce..=to_nonce).contains(&n)))
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.nonce);
        Ok(matching)
    }

    async fn get_wallet(&self, address: Address) -> Result<Option<WalletDescriptor>, StoreError> {
        let state = self.lock()?;
        Ok(state.wallets.get(&address).cloned())
    }

    async fn save_wallet(&self, descriptor: &WalletDescriptor) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.wallets.insert(descriptor.address, descriptor.clone());
        Ok(())
    }

    async fn get_nonce_record(&self, key: WalletKey) -> Result<Option<NonceRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state.nonces.get(&key).copied())
    }

    async fn save_nonce_record(&self, record: &NonceRecord) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.nonces.insert(
            WalletKey {
                chain_id: record.chain_id,
                address: record.wallet_address,
            },
            *record,
        );
        Ok(())
    }
}
