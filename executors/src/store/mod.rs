use std::fmt;

use alloy::primitives::{Address, B256, Bytes, U256};
use engine_core::{
    error::EngineError,
    transaction::{FeeModel, FeeParams},
};
use serde::{Deserialize, Serialize};

use crate::signer_resolver::WalletDescriptor;

mod memory;
mod redis_store;

pub use memory::InMemoryExecutorStore;
pub use redis_store::RedisExecutorStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Queued,
    Sent,
    Mined,
    Errored,
    Cancelled,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 5] = [
        TransactionStatus::Queued,
        TransactionStatus::Sent,
        TransactionStatus::Mined,
        TransactionStatus::Errored,
        TransactionStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Queued => "queued",
            TransactionStatus::Sent => "sent",
            TransactionStatus::Mined => "mined",
            TransactionStatus::Errored => "errored",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == value)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Mined | TransactionStatus::Errored | TransactionStatus::Cancelled
        )
    }

    /// Whether a committed record may move from `self` to `next`.
    ///
    /// Rewriting a non-terminal record without changing its status (appending a
    /// resend hash, persisting a prepared attempt) is allowed.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        match (self, next) {
            (Queued, Queued | Sent | Errored | Cancelled) => true,
            (Sent, Sent | Mined | Errored) => true,
            _ => false,
        }
    }

    /// Terminal states that free the idempotency key for reuse.
    pub fn releases_idempotency_key(&self) -> bool {
        matches!(self, TransactionStatus::Errored | TransactionStatus::Cancelled)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnchainStatus {
    Success,
    Reverted,
}

/// A signed attempt, persisted before it is broadcast.
///
/// On a queued record this is the first send; on a sent record it is a
/// replacement not yet added to `sent_transaction_hashes`. If the process dies
/// or the store fails between broadcast and commit, the next pass re-sends
/// these exact bytes and receipt checks still see the hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedAttempt {
    pub nonce: u64,
    pub transaction_hash: B256,
    pub raw: Bytes,
    pub gas_limit: u64,
    pub fees: FeeParams,
}

/// Caller-requested fees for the next resend. Each field is floored by the
/// escalation rules rather than used verbatim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeOverride {
    pub gas_price: Option<u128>,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub queue_id: String,
    pub chain_id: u64,
    /// Address whose nonce orders this transaction (the admin for contract accounts)
    pub from_address: Address,
    pub to_address: Option<Address>,
    pub data: Bytes,
    pub value: U256,
    pub nonce: Option<u64>,
    pub gas_limit: Option<u64>,
    pub fee_model: Option<FeeModel>,
    pub fees: Option<FeeParams>,
    pub status: TransactionStatus,
    pub resend_count: u32,
    pub sent_transaction_hashes: Vec<B256>,
    pub idempotency_key: Option<String>,

    pub queued_at: u64,
    pub sent_at: Option<u64>,
    pub sent_at_block: Option<u64>,
    pub mined_at: Option<u64>,
    pub mined_at_block: Option<u64>,
    pub cancelled_at: Option<u64>,
    pub errored_at: Option<u64>,
    pub error_message: Option<String>,

    /// Contract account the call executes from
    pub account_address: Option<Address>,
    /// Admin EOA that signs for `account_address`
    pub signer_address: Option<Address>,

    pub transaction_hash: Option<B256>,
    pub onchain_status: Option<OnchainStatus>,

    #[serde(default)]
    pub prepared_attempt: Option<PreparedAttempt>,
    #[serde(default)]
    pub retry_override: Option<FeeOverride>,
}

impl TransactionRecord {
    /// Address of the wallet descriptor that signs this transaction.
    pub fn wallet_address(&self) -> Address {
        self.account_address.unwrap_or(self.from_address)
    }

    pub fn wallet_key(&self) -> WalletKey {
        WalletKey {
            chain_id: self.chain_id,
            address: self.from_address,
        }
    }
}

/// Identifies one nonce sequence: a sender on a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletKey {
    pub chain_id: u64,
    pub address: Address,
}

impl fmt::Display for WalletKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain_id, self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceRecord {
    pub chain_id: u64,
    pub wallet_address: Address,
    /// `None` means read from chain on next use
    pub last_issued_nonce: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The idempotency key already belongs to this record
    Existing(String),
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum StoreError {
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Transaction not found: {queue_id}")]
    NotFound { queue_id: String },

    #[error("Transaction {queue_id} is {actual}, expected {expected}")]
    StatusConflict {
        queue_id: String,
        expected: TransactionStatus,
        actual: TransactionStatus,
    },

    #[error("Transaction {queue_id} cannot move from {from} to {to}")]
    InvalidTransition {
        queue_id: String,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("Transaction {queue_id} already exists")]
    DuplicateQueueId { queue_id: String },
}

impl From<::redis::RedisError> for StoreError {
    fn from(error: ::redis::RedisError) -> Self {
        StoreError::Unavailable {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Serialization {
            message: error.to_string(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(error: StoreError) -> Self {
        EngineError::PersistenceError {
            message: error.to_string(),
        }
    }
}

pub(crate) fn check_transition(
    record: &TransactionRecord,
    expected: TransactionStatus,
) -> Result<(), StoreError> {
    if expected.can_transition_to(record.status) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            queue_id: record.queue_id.clone(),
            from: expected,
            to: record.status,
        })
    }
}

/// Durable state of the executor.
///
/// Implementations must make each single-record write atomic: either the whole
/// record (with its indexes) is committed or nothing is.
pub trait ExecutorStore: Send + Sync + 'static {
    /// Inserts a queued record, claiming its idempotency key if it has one.
    fn insert_transaction(
        &self,
        record: &TransactionRecord,
    ) -> impl Future<Output = Result<InsertOutcome, StoreError>> + Send;

    fn get_transaction(
        &self,
        queue_id: &str,
    ) -> impl Future<Output = Result<Option<TransactionRecord>, StoreError>> + Send;

    /// Compare-and-set on status: writes `record` only if the stored record is
    /// still in `expected` and the move to `record.status` is legal.
    fn update_transaction(
        &self,
        record: &TransactionRecord,
        expected: TransactionStatus,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Oldest first.
    fn list_transactions(
        &self,
        status: TransactionStatus,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<TransactionRecord>, StoreError>> + Send;

    /// Records with an assigned nonce in `[from_nonce, to_nonce]`, by nonce.
    fn nonce_range(
        &self,
        key: WalletKey,
        from_nonce: u64,
        to_nonce: u64,
    ) -> impl Future<Output = Result<Vec<TransactionRecord>, StoreError>> + Send;

    fn get_wallet(
        &self,
        address: Address,
    ) -> impl Future<Output = Result<Option<WalletDescriptor>, StoreError>> + Send;

    fn save_wallet(
        &self,
        descriptor: &WalletDescriptor,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_nonce_record(
        &self,
        key: WalletKey,
    ) -> impl Future<Output = Result<Option<NonceRecord>, StoreError>> + Send;

    fn save_nonce_record(
        &self,
        record: &NonceRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
