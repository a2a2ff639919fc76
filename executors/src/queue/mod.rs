use std::{sync::Arc, time::Duration};

use alloy::primitives::{Address, B256, Bytes, U256};
use engine_core::{
    chain::{CallRequest, Chain, ChainService, ReceiptSummary},
    credentials::CredentialDecryptor,
    error::EngineError,
    transaction::{FeeParams, UnsignedTransaction},
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast::error::RecvError};

use crate::{
    error_classifier::{SendErrorClassifier, SendErrorKind},
    events::EventBus,
    gas::GasPricingStrategy,
    nonce_manager::{NonceManager, WalletLock},
    signer_resolver::{Account, SignerResolver, WalletDescriptor},
    store::{
        ExecutorStore, FeeOverride, InsertOutcome, OnchainStatus, PreparedAttempt, StoreError,
        TransactionRecord, TransactionStatus,
    },
};

pub mod worker;

pub const NONCE_CONSUMED_MESSAGE: &str = "nonce consumed by another transaction";

pub(crate) fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Bounds on in-step retries of transient provider failures.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionConfig {
    pub max_send_attempts: u32,
    pub retry_base_delay: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_send_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

/// A caller's request to execute a call from a managed wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    pub chain_id: u64,
    /// Registered wallet address; for contract accounts, the account itself
    pub from: Address,
    /// `None` deploys a contract
    pub to: Option<Address>,
    #[serde(default)]
    pub value: U256,
    #[serde(default)]
    pub data: Bytes,
    #[serde(default)]
    pub gas_limit: Option<u64>,
    #[serde(default)]
    pub fees: Option<FeeParams>,
}

impl TransactionRequest {
    fn validate(&self) -> Result<(), EngineError> {
        let invalid = |message: &str| {
            Err(EngineError::ValidationError {
                message: message.to_string(),
            })
        };

        if self.to.is_none() && self.data.is_empty() {
            return invalid("Contract creation requires init code in `data`");
        }
        if self.gas_limit == Some(0) {
            return invalid("Gas limit must be greater than zero");
        }
        if let Some(FeeParams::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        }) = self.fees
        {
            if max_priority_fee_per_gas > max_fee_per_gas {
                return invalid("maxPriorityFeePerGas cannot exceed maxFeePerGas");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Sent { transaction_hash: B256 },
    Errored,
    /// Record was not queued (cancelled, already processed, or gone)
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResendOutcome {
    Resent { transaction_hash: B256 },
    /// A previous attempt turned out to be confirmed
    Mined,
    /// Nothing was committed; the record stays `sent` for the next pass
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Mined,
    Pending,
    Errored,
    Skipped,
}

/// Why a processing step stopped.
enum StepFailure {
    /// Store trouble: nothing was committed and a later pass retries
    Abort(EngineError),
    /// The transaction cannot be sent; record it as errored
    Fail(EngineError),
}

impl From<EngineError> for StepFailure {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::PersistenceError { .. } => StepFailure::Abort(error),
            other => StepFailure::Fail(other),
        }
    }
}

/// The transaction state machine.
///
/// Every mutation of a record past enqueue happens while holding the owning
/// wallet's [`WalletLock`] and is committed with a compare-and-set on status,
/// so concurrent callers can never move a record backwards or out of a
/// terminal state.
pub struct TransactionQueue<S, CS, D> {
    store: Arc<S>,
    chains: Arc<CS>,
    resolver: Arc<SignerResolver<D>>,
    nonces: NonceManager<S>,
    gas: GasPricingStrategy,
    events: EventBus,
    notify: Arc<Notify>,
    config: ExecutionConfig,
}

impl<S, CS, D> TransactionQueue<S, CS, D>
where
    S: ExecutorStore,
    CS: ChainService,
    D: CredentialDecryptor,
{
    pub fn new(
        store: Arc<S>,
        chains: Arc<CS>,
        resolver: Arc<SignerResolver<D>>,
        events: EventBus,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            nonces: NonceManager::new(store.clone()),
            store,
            chains,
            resolver,
            gas: GasPricingStrategy::new(),
            events,
            notify: Arc::new(Notify::new()),
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn chains(&self) -> &Arc<CS> {
        &self.chains
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn nonce_manager(&self) -> &NonceManager<S> {
        &self.nonces
    }

    /// Signalled on every enqueue.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Stores or replaces a wallet descriptor and drops any account resolved
    /// from its previous credentials.
    pub async fn register_wallet(&self, descriptor: WalletDescriptor) -> Result<(), EngineError> {
        self.store.save_wallet(&descriptor).await?;
        self.resolver.invalidate_wallet(descriptor.address)?;
        if descriptor.is_contract_account() {
            self.resolver.invalidate_wallet(descriptor.sender_address())?;
        }

        tracing::info!(
            wallet = ?descriptor.address,
            custody = descriptor.custody.custody_type(),
            "Registered wallet"
        );
        Ok(())
    }

    /// Creates a queued record, or returns the existing one's id when
    /// `idempotency_key` is already taken.
    #[tracing::instrument(skip_all, fields(chain_id = request.chain_id, wallet = ?request.from))]
    pub async fn enqueue(
        &self,
        request: TransactionRequest,
        idempotency_key: Option<String>,
    ) -> Result<String, EngineError> {
        request.validate()?;
        if idempotency_key.as_deref() == Some("") {
            return Err(EngineError::ValidationError {
                message: "Idempotency key cannot be empty".to_string(),
            });
        }

        self.chains
            .get_chain(request.chain_id)
            .map_err(|e| EngineError::ValidationError {
                message: e.root_cause_message(),
            })?;

        let wallet = self.store.get_wallet(request.from).await?.ok_or_else(|| {
            EngineError::WalletConfigError {
                message: format!("Wallet {} is not registered", request.from),
            }
        })?;

        let is_contract_account = wallet.is_contract_account();
        if is_contract_account && request.to.is_none() {
            return Err(EngineError::ValidationError {
                message: "Contract accounts cannot deploy contracts directly".to_string(),
            });
        }

        let record = TransactionRecord {
            queue_id: uuid::Uuid::new_v4().to_string(),
            chain_id: request.chain_id,
            from_address: wallet.sender_address(),
            to_address: request.to,
            data: request.data,
            value: request.value,
            nonce: None,
            gas_limit: request.gas_limit,
            fee_model: request.fees.map(|fees| fees.model()),
            fees: request.fees,
            status: TransactionStatus::Queued,
            resend_count: 0,
            sent_transaction_hashes: vec![],
            idempotency_key,
            queued_at: now_ms(),
            sent_at: None,
            sent_at_block: None,
            mined_at: None,
            mined_at_block: None,
            cancelled_at: None,
            errored_at: None,
            error_message: None,
            account_address: is_contract_account.then_some(wallet.address),
            signer_address: is_contract_account.then(|| wallet.sender_address()),
            transaction_hash: None,
            onchain_status: None,
            prepared_attempt: None,
            retry_override: None,
        };

        match self.store.insert_transaction(&record).await? {
            InsertOutcome::Inserted => {
                tracing::info!(queue_id = %record.queue_id, "Transaction queued");
                self.events.emit(None, &record);
                self.notify.notify_one();
                Ok(record.queue_id)
            }
            InsertOutcome::Existing(queue_id) => {
                tracing::debug!(queue_id = %queue_id, "Idempotency key already used, returning existing transaction");
                Ok(queue_id)
            }
        }
    }

    /// Last committed state of the record.
    pub async fn get_status(&self, queue_id: &str) -> Result<Option<TransactionRecord>, EngineError> {
        Ok(self.store.get_transaction(queue_id).await?)
    }

    /// Cancels a record that has not been handed to the chain.
    #[tracing::instrument(skip_all, fields(queue_id = %queue_id))]
    pub async fn cancel(&self, queue_id: &str) -> Result<TransactionRecord, EngineError> {
        let record = self.require(queue_id).await?;
        let _lock = self.nonces.lock(record.wallet_key()).await;
        let mut record = self.require(queue_id).await?;

        if record.status != TransactionStatus::Queued {
            return Err(EngineError::ValidationError {
                message: format!(
                    "Transaction {queue_id} is {} and can no longer be cancelled",
                    record.status
                ),
            });
        }
        if record.prepared_attempt.is_some() {
            return Err(EngineError::ValidationError {
                message: format!("Transaction {queue_id} is already being broadcast"),
            });
        }

        record.status = TransactionStatus::Cancelled;
        record.cancelled_at = Some(now_ms());
        self.store
            .update_transaction(&record, TransactionStatus::Queued)
            .await
            .map_err(|e| match e {
                StoreError::StatusConflict { .. } => EngineError::ValidationError {
                    message: e.to_string(),
                },
                other => other.into(),
            })?;

        tracing::info!("Transaction cancelled");
        self.events.emit(Some(TransactionStatus::Queued), &record);
        Ok(record)
    }

    /// Marks a sent record for resend on the next retry pass, optionally with
    /// caller-chosen fees. Overrides below the replacement floor are raised to it.
    #[tracing::instrument(skip_all, fields(queue_id = %queue_id))]
    pub async fn request_resend(
        &self,
        queue_id: &str,
        fee_override: Option<FeeOverride>,
    ) -> Result<TransactionRecord, EngineError> {
        let record = self.require(queue_id).await?;
        let _lock = self.nonces.lock(record.wallet_key()).await;
        let mut record = self.require(queue_id).await?;

        if record.status != TransactionStatus::Sent {
            return Err(EngineError::ValidationError {
                message: format!("Transaction {queue_id} is {}, only sent transactions can be resent", record.status),
            });
        }

        record.retry_override = Some(fee_override.unwrap_or_default());
        self.store
            .update_transaction(&record, TransactionStatus::Sent)
            .await?;

        tracing::info!(fee_override = ?record.retry_override, "Resend requested");
        Ok(record)
    }

    /// Waits until the record reaches a terminal status or `timeout` elapses,
    /// and returns its latest committed state either way.
    pub async fn wait_for_terminal(
        &self,
        queue_id: &str,
        timeout: Duration,
    ) -> Result<TransactionRecord, EngineError> {
        // Subscribe before reading so a transition in between is not missed
        let mut receiver = self.events.subscribe();
        let record = self.require(queue_id).await?;
        if record.status.is_terminal() {
            return Ok(record);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Err(_elapsed) => return self.require(queue_id).await,
                Ok(Ok(event)) => {
                    if event.queue_id == queue_id && event.new_status.is_terminal() {
                        return Ok(event.record);
                    }
                }
                Ok(Err(RecvError::Lagged(_))) => {
                    let record = self.require(queue_id).await?;
                    if record.status.is_terminal() {
                        return Ok(record);
                    }
                }
                Ok(Err(RecvError::Closed)) => {
                    return Err(EngineError::InternalError {
                        message: "Lifecycle event stream closed".to_string(),
                    });
                }
            }
        }
    }

    /// Sends a queued record: resolves its account, assigns a nonce, prices,
    /// signs and broadcasts it, then commits `sent`.
    #[tracing::instrument(skip_all, fields(queue_id = %queue_id))]
    pub async fn process(&self, queue_id: &str) -> Result<ProcessOutcome, EngineError> {
        let Some(record) = self.store.get_transaction(queue_id).await? else {
            return Ok(ProcessOutcome::Skipped);
        };
        if record.status != TransactionStatus::Queued {
            return Ok(ProcessOutcome::Skipped);
        }

        let mut lock = self.nonces.lock(record.wallet_key()).await;
        let Some(record) = self.store.get_transaction(queue_id).await? else {
            return Ok(ProcessOutcome::Skipped);
        };
        if record.status != TransactionStatus::Queued {
            return Ok(ProcessOutcome::Skipped);
        }

        let chain = match self.chains.get_chain(record.chain_id) {
            Ok(chain) => chain,
            Err(e) => {
                self.mark_errored(record, e.root_cause_message()).await?;
                return Ok(ProcessOutcome::Errored);
            }
        };

        self.process_locked(record, &chain, &mut lock).await
    }

    async fn process_locked(
        &self,
        mut record: TransactionRecord,
        chain: &CS::Chain,
        lock: &mut WalletLock<S>,
    ) -> Result<ProcessOutcome, EngineError> {
        let mut resynced = false;

        loop {
            let attempt = match record.prepared_attempt.clone() {
                Some(attempt) => {
                    tracing::info!(nonce = attempt.nonce, hash = %attempt.transaction_hash, "Re-broadcasting prepared transaction");
                    attempt
                }
                None => match self.prepare(&mut record, chain, lock).await {
                    Ok(attempt) => attempt,
                    Err(StepFailure::Abort(e)) => return Err(e),
                    Err(StepFailure::Fail(e)) => {
                        self.mark_errored(record, e.root_cause_message()).await?;
                        return Ok(ProcessOutcome::Errored);
                    }
                },
            };

            let raw = &attempt.raw;
            let broadcast = self
                .with_retries("broadcast", move || chain.send_raw_transaction(raw.clone()))
                .await;
            let error = match broadcast {
                Ok(_) => return self.commit_sent(record, attempt, chain).await,
                Err(e) => e,
            };

            let kind = SendErrorClassifier::classify(&error);
            if kind == SendErrorKind::AlreadyKnown {
                return self.commit_sent(record, attempt, chain).await;
            }

            if kind.needs_resync() {
                // The rejected nonce may belong to this very transaction from before a restart
                // A failed lookup aborts the pass with the attempt still persisted
                let hash = attempt.transaction_hash;
                let receipt = self
                    .with_retries("receipt", move || chain.get_transaction_receipt(hash))
                    .await?;
                if receipt.is_some() {
                    return self.commit_sent(record, attempt, chain).await;
                }

                if !resynced {
                    tracing::warn!(nonce = attempt.nonce, error = %error, "Nonce rejected by chain, resyncing");
                    resynced = true;
                    lock.resync().await;
                    record.prepared_attempt = None;
                    self.store
                        .update_transaction(&record, TransactionStatus::Queued)
                        .await?;
                    continue;
                }
            }

            tracing::warn!(nonce = attempt.nonce, error = %error, "Broadcast failed");
            lock.release(attempt.nonce).await;
            record.prepared_attempt = None;
            self.mark_errored(record, error.root_cause_message()).await?;
            return Ok(ProcessOutcome::Errored);
        }
    }

    /// Builds and signs the first attempt, and persists it before it is broadcast.
    async fn prepare(
        &self,
        record: &mut TransactionRecord,
        chain: &CS::Chain,
        lock: &mut WalletLock<S>,
    ) -> Result<PreparedAttempt, StepFailure> {
        let account = self.resolve_account(record).await?;
        if account.sender() != record.from_address {
            return Err(StepFailure::Fail(EngineError::WalletConfigError {
                message: format!(
                    "Wallet now signs as {}, but the transaction was queued for {}",
                    account.sender(),
                    record.from_address
                ),
            }));
        }

        let (to, value, input) = account.route_call(record.to_address, record.value, record.data.clone());

        let gas_limit = match record.gas_limit {
            Some(gas_limit) => gas_limit,
            None => {
                let call = CallRequest {
                    from: record.from_address,
                    to,
                    value,
                    data: input.clone(),
                };
                let call = &call;
                self.with_retries("estimate_gas", move || chain.estimate_gas(call.clone()))
                    .await?
            }
        };

        let fees = match record.fees {
            Some(fees) => fees,
            None => {
                let gas = self.gas;
                self.with_retries("initial_fees", move || async move {
                    gas.initial_fees(chain).await
                })
                .await?
            }
        };

        let nonce = self.issue_nonce(chain, lock).await?;

        let unsigned = UnsignedTransaction {
            chain_id: record.chain_id,
            nonce,
            to,
            value,
            input,
            gas_limit,
            fees,
        };
        let (account, unsigned) = (&account, &unsigned);
        let signed = match self
            .with_retries("sign", move || account.sign_transaction(unsigned.clone()))
            .await
        {
            Ok(signed) => signed,
            Err(e) => {
                lock.release(nonce).await;
                return Err(e.into());
            }
        };

        let attempt = PreparedAttempt {
            nonce,
            transaction_hash: signed.hash,
            raw: signed.raw,
            gas_limit,
            fees,
        };

        let mut prepared = record.clone();
        prepared.gas_limit = Some(gas_limit);
        prepared.fees = Some(fees);
        prepared.fee_model = Some(fees.model());
        prepared.prepared_attempt = Some(attempt.clone());

        if let Err(e) = self
            .store
            .update_transaction(&prepared, TransactionStatus::Queued)
            .await
        {
            tracing::warn!(nonce, error = %e, "Failed to persist prepared transaction, releasing nonce");
            lock.release(nonce).await;
            return Err(StepFailure::Abort(e.into()));
        }

        tracing::debug!(nonce, hash = %attempt.transaction_hash, "Prepared transaction");
        *record = prepared;
        Ok(attempt)
    }

    async fn issue_nonce(
        &self,
        chain: &CS::Chain,
        lock: &mut WalletLock<S>,
    ) -> Result<u64, StepFailure> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match lock.next_nonce(chain).await {
                Ok(nonce) => return Ok(nonce),
                Err(e) => e,
            };

            let retryable = !matches!(error, EngineError::PersistenceError { .. })
                && SendErrorClassifier::classify(&error).is_retryable();
            if !retryable || attempt >= self.config.max_send_attempts {
                return Err(error.into());
            }

            tracing::warn!(attempt, error = %error, "Failed to issue nonce, retrying");
            tokio::time::sleep(self.backoff(attempt)).await;
        }
    }

    async fn commit_sent(
        &self,
        mut record: TransactionRecord,
        attempt: PreparedAttempt,
        chain: &CS::Chain,
    ) -> Result<ProcessOutcome, EngineError> {
        let sent_at_block = self.current_block(chain).await;

        record.status = TransactionStatus::Sent;
        record.nonce = Some(attempt.nonce);
        record.sent_transaction_hashes.push(attempt.transaction_hash);
        record.sent_at = Some(now_ms());
        record.sent_at_block = sent_at_block;
        record.gas_limit = Some(attempt.gas_limit);
        record.fees = Some(attempt.fees);
        record.fee_model = Some(attempt.fees.model());
        record.prepared_attempt = None;

        self.store
            .update_transaction(&record, TransactionStatus::Queued)
            .await?;

        tracing::info!(
            nonce = attempt.nonce,
            hash = %attempt.transaction_hash,
            "Transaction sent"
        );
        self.events.emit(Some(TransactionStatus::Queued), &record);

        Ok(ProcessOutcome::Sent {
            transaction_hash: attempt.transaction_hash,
        })
    }

    /// Re-signs a stuck `sent` record with the same nonce and higher fees.
    #[tracing::instrument(skip_all, fields(queue_id = %queue_id))]
    pub async fn resend(&self, queue_id: &str) -> Result<ResendOutcome, EngineError> {
        let Some(record) = self.store.get_transaction(queue_id).await? else {
            return Ok(ResendOutcome::Skipped);
        };
        if record.status != TransactionStatus::Sent {
            return Ok(ResendOutcome::Skipped);
        }

        let chain = self.chains.get_chain(record.chain_id)?;
        let chain = &chain;
        let _lock = self.nonces.lock(record.wallet_key()).await;
        let Some(record) = self.store.get_transaction(queue_id).await? else {
            return Ok(ResendOutcome::Skipped);
        };
        if record.status != TransactionStatus::Sent {
            return Ok(ResendOutcome::Skipped);
        }

        if let Some(receipt) = self.find_receipt(chain, &record).await? {
            self.mark_mined(record, receipt).await?;
            return Ok(ResendOutcome::Mined);
        }

        let (record, attempt) = match record.prepared_attempt.clone() {
            Some(attempt) => {
                tracing::info!(nonce = attempt.nonce, hash = %attempt.transaction_hash, "Re-broadcasting pending replacement");
                (record, attempt)
            }
            None => match self.prepare_replacement(record, chain).await? {
                Some(prepared) => prepared,
                None => return Ok(ResendOutcome::Skipped),
            },
        };
        let nonce = attempt.nonce;

        let raw = &attempt.raw;
        let broadcast = self
            .with_retries("broadcast", move || chain.send_raw_transaction(raw.clone()))
            .await;
        if let Err(error) = broadcast {
            match SendErrorClassifier::classify(&error) {
                SendErrorKind::AlreadyKnown => {}
                SendErrorKind::ReplacementUnderpriced => {
                    tracing::warn!(nonce, error = %error, "Replacement underpriced, will escalate again");
                    self.discard_replacement(record).await;
                    return Ok(ResendOutcome::Skipped);
                }
                SendErrorKind::NonceTooLow => {
                    if let Some(receipt) = self.find_receipt(chain, &record).await? {
                        self.mark_mined(record, receipt).await?;
                        return Ok(ResendOutcome::Mined);
                    }
                    tracing::warn!(nonce, "Nonce already used on chain, leaving it to the confirmation watcher");
                    self.discard_replacement(record).await;
                    return Ok(ResendOutcome::Skipped);
                }
                // Outcome unknown; the persisted replacement is retried next pass
                _ => return Err(error),
            }
        }

        let mut updated = record.clone();
        updated.sent_transaction_hashes.push(attempt.transaction_hash);
        updated.resend_count += 1;
        updated.fees = Some(attempt.fees);
        updated.fee_model = Some(attempt.fees.model());
        updated.sent_at = Some(now_ms());
        updated.sent_at_block = self.current_block(chain).await;
        updated.retry_override = None;
        updated.prepared_attempt = None;

        match self
            .store
            .update_transaction(&updated, TransactionStatus::Sent)
            .await
        {
            Ok(()) => {}
            Err(StoreError::StatusConflict { actual, .. }) => {
                tracing::info!(status = %actual, "Transaction moved on during resend, discarding");
                return Ok(ResendOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            nonce,
            hash = %attempt.transaction_hash,
            resend_count = updated.resend_count,
            "Transaction resent"
        );
        self.events.emit(Some(TransactionStatus::Sent), &updated);

        Ok(ResendOutcome::Resent {
            transaction_hash: attempt.transaction_hash,
        })
    }

    /// Signs a fee-bumped replacement and persists it on the record before it
    /// is broadcast. `None` when the record left `sent` in the meantime.
    async fn prepare_replacement(
        &self,
        record: TransactionRecord,
        chain: &CS::Chain,
    ) -> Result<Option<(TransactionRecord, PreparedAttempt)>, EngineError> {
        let missing = |field: &str| EngineError::InternalError {
            message: format!("Sent transaction {} has no {field}", record.queue_id),
        };
        let nonce = record.nonce.ok_or_else(|| missing("nonce"))?;
        let gas_limit = record.gas_limit.ok_or_else(|| missing("gas limit"))?;
        let previous_fees = record.fees.ok_or_else(|| missing("fees"))?;

        let account = match self.resolve_account(&record).await {
            Ok(account) => account,
            Err(StepFailure::Abort(e) | StepFailure::Fail(e)) => return Err(e),
        };

        let gas = self.gas;
        let retry_override = record.retry_override;
        let fees = self
            .with_retries("retry_fees", move || async move {
                gas.retry_fees(&previous_fees, chain, retry_override.as_ref())
                    .await
            })
            .await?;

        let (to, value, input) = account.route_call(record.to_address, record.value, record.data.clone());
        let unsigned = UnsignedTransaction {
            chain_id: record.chain_id,
            nonce,
            to,
            value,
            input,
            gas_limit,
            fees,
        };
        let (account, unsigned) = (&account, &unsigned);
        let signed = self
            .with_retries("sign", move || account.sign_transaction(unsigned.clone()))
            .await?;

        let attempt = PreparedAttempt {
            nonce,
            transaction_hash: signed.hash,
            raw: signed.raw,
            gas_limit,
            fees,
        };

        let mut prepared = record;
        prepared.prepared_attempt = Some(attempt.clone());
        match self
            .store
            .update_transaction(&prepared, TransactionStatus::Sent)
            .await
        {
            Ok(()) => {}
            Err(StoreError::StatusConflict { actual, .. }) => {
                tracing::info!(status = %actual, "Transaction moved on before resend, discarding");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        tracing::debug!(nonce, hash = %attempt.transaction_hash, "Prepared replacement");
        Ok(Some((prepared, attempt)))
    }

    /// Drops a replacement the chain rejected. Failing to do so only costs an
    /// extra re-broadcast on the next pass.
    async fn discard_replacement(&self, mut record: TransactionRecord) {
        record.prepared_attempt = None;
        if let Err(e) = self
            .store
            .update_transaction(&record, TransactionStatus::Sent)
            .await
        {
            tracing::warn!(error = %e, "Failed to discard rejected replacement");
        }
    }

    /// Looks for a receipt of any attempt of a `sent` record.
    #[tracing::instrument(skip_all, fields(queue_id = %queue_id))]
    pub async fn check_confirmation(&self, queue_id: &str) -> Result<ConfirmationOutcome, EngineError> {
        let Some(record) = self.store.get_transaction(queue_id).await? else {
            return Ok(ConfirmationOutcome::Skipped);
        };
        if record.status != TransactionStatus::Sent {
            return Ok(ConfirmationOutcome::Skipped);
        }

        let chain = self.chains.get_chain(record.chain_id)?;
        let chain = &chain;
        let _lock = self.nonces.lock(record.wallet_key()).await;
        let Some(record) = self.store.get_transaction(queue_id).await? else {
            return Ok(ConfirmationOutcome::Skipped);
        };
        if record.status != TransactionStatus::Sent {
            return Ok(ConfirmationOutcome::Skipped);
        }

        if let Some(receipt) = self.find_receipt(chain, &record).await? {
            self.mark_mined(record, receipt).await?;
            return Ok(ConfirmationOutcome::Mined);
        }

        let Some(nonce) = record.nonce else {
            return Ok(ConfirmationOutcome::Pending);
        };
        let from = record.from_address;
        let counts = self
            .with_retries("transaction_count", move || chain.get_transaction_counts(from))
            .await?;

        if counts.latest > nonce {
            // Our attempt may have landed between the two reads
            if let Some(receipt) = self.find_receipt(chain, &record).await? {
                self.mark_mined(record, receipt).await?;
                return Ok(ConfirmationOutcome::Mined);
            }

            tracing::warn!(nonce, latest = counts.latest, "Nonce consumed without any of our attempts");
            self.mark_errored(record, NONCE_CONSUMED_MESSAGE.to_string())
                .await?;
            return Ok(ConfirmationOutcome::Errored);
        }

        Ok(ConfirmationOutcome::Pending)
    }

    async fn find_receipt(
        &self,
        chain: &CS::Chain,
        record: &TransactionRecord,
    ) -> Result<Option<ReceiptSummary>, EngineError> {
        let pending = record.prepared_attempt.as_ref().map(|a| a.transaction_hash);
        let hashes = pending
            .into_iter()
            .chain(record.sent_transaction_hashes.iter().rev().copied());

        for hash in hashes {
            let receipt = self
                .with_retries("receipt", move || chain.get_transaction_receipt(hash))
                .await?;
            if let Some(receipt) = receipt.filter(|r| r.block_number.is_some()) {
                return Ok(Some(receipt));
            }
        }
        Ok(None)
    }

    async fn mark_mined(
        &self,
        mut record: TransactionRecord,
        receipt: ReceiptSummary,
    ) -> Result<(), EngineError> {
        if let Some(pending) = record.prepared_attempt.take() {
            if pending.transaction_hash == receipt.transaction_hash {
                record.sent_transaction_hashes.push(pending.transaction_hash);
            }
        }
        record.status = TransactionStatus::Mined;
        record.transaction_hash = Some(receipt.transaction_hash);
        record.mined_at = Some(now_ms());
        record.mined_at_block = receipt.block_number;
        record.onchain_status = Some(if receipt.success {
            OnchainStatus::Success
        } else {
            OnchainStatus::Reverted
        });
        record.retry_override = None;

        self.store
            .update_transaction(&record, TransactionStatus::Sent)
            .await?;

        tracing::info!(
            hash = %receipt.transaction_hash,
            block = ?receipt.block_number,
            success = receipt.success,
            "Transaction mined"
        );
        self.events.emit(Some(TransactionStatus::Sent), &record);
        Ok(())
    }

    async fn mark_errored(
        &self,
        mut record: TransactionRecord,
        message: String,
    ) -> Result<(), EngineError> {
        let previous = record.status;
        record.status = TransactionStatus::Errored;
        record.errored_at = Some(now_ms());
        record.error_message = Some(message);
        record.prepared_attempt = None;

        self.store.update_transaction(&record, previous).await?;

        tracing::warn!(error = ?record.error_message, "Transaction errored");
        self.events.emit(Some(previous), &record);
        Ok(())
    }

    async fn resolve_account(&self, record: &TransactionRecord) -> Result<Account, StepFailure> {
        let wallet = record.wallet_address();
        let descriptor = self.store.get_wallet(wallet).await.map_err(|e| StepFailure::Abort(e.into()))?;
        let descriptor = descriptor.ok_or_else(|| {
            StepFailure::Fail(EngineError::WalletConfigError {
                message: format!("Wallet {wallet} is not registered"),
            })
        })?;

        let (resolver, descriptor, chain_id) = (&self.resolver, &descriptor, record.chain_id);
        let account = self
            .with_retries("resolve_account", move || async move {
                resolver
                    .resolve(descriptor, chain_id)
                    .await
                    .map_err(EngineError::from)
            })
            .await?;
        Ok(account)
    }

    async fn current_block(&self, chain: &CS::Chain) -> Option<u64> {
        match chain.get_block_number().await {
            Ok(block) => Some(block),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read block number");
                None
            }
        }
    }

    async fn require(&self, queue_id: &str) -> Result<TransactionRecord, EngineError> {
        self.store
            .get_transaction(queue_id)
            .await?
            .ok_or_else(|| EngineError::ValidationError {
                message: format!("Transaction {queue_id} not found"),
            })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.retry_base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Runs `operation`, retrying transient failures with exponential backoff.
    async fn with_retries<T, F, Fut>(&self, name: &'static str, mut operation: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !SendErrorClassifier::classify(&error).is_retryable()
                || attempt >= self.config.max_send_attempts
            {
                return Err(error);
            }

            let delay = self.backoff(attempt);
            tracing::warn!(operation = name, attempt, error = %error, ?delay, "Transient failure, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}
