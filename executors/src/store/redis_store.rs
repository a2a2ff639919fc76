use alloy::primitives::Address;
use redis::{AsyncCommands, Script, aio::ConnectionManager};

use super::{
    ExecutorStore, InsertOutcome, NonceRecord, StoreError, TransactionRecord, TransactionStatus,
    WalletKey, check_transition,
};
use crate::signer_resolver::WalletDescriptor;

const INSERT_SCRIPT: &str = r#"
local tx_key = KEYS[1]
local queued_key = KEYS[2]
local idempotency_key = KEYS[3]
local sequence_key = KEYS[4]

local queue_id = ARGV[1]
local record = ARGV[2]
local has_idempotency = ARGV[3] == '1'

if has_idempotency then
    local existing = redis.call('GET', idempotency_key)
    if existing then
        return {0, existing}
    end
end

if redis.call('EXISTS', tx_key) == 1 then
    return {-1, queue_id}
end

local seq = redis.call('INCR', sequence_key)
redis.call('HSET', tx_key, 'status', 'queued', 'record', record, 'seq', seq)
redis.call('ZADD', queued_key, seq, queue_id)

if has_idempotency then
    redis.call('SET', idempotency_key, queue_id)
end

return {1, queue_id}
"#;

const UPDATE_SCRIPT: &str = r#"
local tx_key = KEYS[1]
local expected_status_key = KEYS[2]
local new_status_key = KEYS[3]
local nonce_index_key = KEYS[4]
local idempotency_key = KEYS[5]

local expected = ARGV[1]
local new_status = ARGV[2]
local record = ARGV[3]
local queue_id = ARGV[4]
local nonce = ARGV[5]
local release_idempotency = ARGV[6] == '1'

local current = redis.call('HGET', tx_key, 'status')
if not current then
    return {-1, ''}
end
if current ~= expected then
    return {0, current}
end

local seq = redis.call('HGET', tx_key, 'seq')
redis.call('HSET', tx_key, 'status', new_status, 'record', record)

if expected ~= new_status then
    redis.call('ZREM', expected_status_key, queue_id)
    redis.call('ZADD', new_status_key, seq, queue_id)
end

if nonce ~= '' then
    redis.call('ZADD', nonce_index_key, tonumber(nonce), queue_id)
end

if release_idempotency and redis.call('GET', idempotency_key) == queue_id then
    redis.call('DEL', idempotency_key)
end

return {1, new_status}
"#;

/// Redis-backed store.
///
/// Each record is a hash (`status`, `record` json, `seq`); status sorted sets
/// and the per-wallet nonce index are kept consistent with it by Lua scripts,
/// so every write is a single atomic step.
#[derive(Clone)]
pub struct RedisExecutorStore {
    redis: ConnectionManager,
    namespace: Option<String>,
}

impl RedisExecutorStore {
    pub fn new(redis: ConnectionManager, namespace: Option<String>) -> Self {
        Self { redis, namespace }
    }

    pub async fn connect(url: &str, namespace: Option<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self::new(redis, namespace))
    }

    fn key(&self, name: String) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:engine:{name}"),
            None => format!("engine:{name}"),
        }
    }

    fn transaction_key(&self, queue_id: &str) -> String {
        self.key(format!("tx:{queue_id}"))
    }

    fn status_key(&self, status: TransactionStatus) -> String {
        self.key(format!("status:{status}"))
    }

    fn nonce_index_key(&self, key: WalletKey) -> String {
        self.key(format!("nonce_index:{}:{}", key.chain_id, key.address))
    }

    fn idempotency_key(&self, key: &str) -> String {
        self.key(format!("idempotency:{key}"))
    }

    fn sequence_key(&self) -> String {
        self.key("sequence".to_string())
    }

    fn wallet_key(&self, address: Address) -> String {
        self.key(format!("wallet:{address}"))
    }

    fn nonce_record_key(&self, key: WalletKey) -> String {
        self.key(format!("nonce:{}:{}", key.chain_id, key.address))
    }

    async fn load_records(&self, queue_ids: Vec<String>) -> Result<Vec<TransactionRecord>, StoreError> {
        if queue_ids.is_empty() {
            return Ok(vec![]);
        }

        let mut pipeline = redis::pipe();
        for queue_id in &queue_ids {
            pipeline.hget(self.transaction_key(queue_id), "record");
        }
        let raw: Vec<Option<String>> = pipeline.query_async(&mut self.redis.clone()).await?;

        raw.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .collect()
    }
}

impl ExecutorStore for RedisExecutorStore {
    async fn insert_transaction(
        &self,
        record: &TransactionRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let json = serde_json::to_string(record)?;
        let idempotency = record.idempotency_key.as_deref().unwrap_or_default();

        let (code, queue_id): (i32, String) = Script::new(INSERT_SCRIPT)
            .key(self.transaction_key(&record.queue_id))
            .key(self.status_key(TransactionStatus::Queued))
            .key(self.idempotency_key(idempotency))
            .key(self.sequence_key())
            .arg(&record.queue_id)
            .arg(json)
            .arg(if record.idempotency_key.is_some() { "1" } else { "0" })
            .invoke_async(&mut self.redis.clone())
            .await?;

        match code {
            1 => Ok(InsertOutcome::Inserted),
            0 => Ok(InsertOutcome::Existing(queue_id)),
            _ => Err(StoreError::DuplicateQueueId { queue_id }),
        }
    }

    async fn get_transaction(&self, queue_id: &str) -> Result<Option<TransactionRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let json: Option<String> = conn.hget(self.transaction_key(queue_id), "record").await?;
        json.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn update_transaction(
        &self,
        record: &TransactionRecord,
        expected: TransactionStatus,
    ) -> Result<(), StoreError> {
        check_transition(record, expected)?;

        let json = serde_json::to_string(record)?;
        let idempotency = record.idempotency_key.as_deref().unwrap_or_default();
        let nonce = record.nonce.map(|n| n.to_string()).unwrap_or_default();
        let release = record.status.releases_idempotency_key() && record.idempotency_key.is_some();

        let (code, actual): (i32, String) = Script::new(UPDATE_SCRIPT)
            .key(self.transaction_key(&record.queue_id))
            .key(self.status_key(expected))
            .key(self.status_key(record.status))
            .key(self.nonce_index_key(record.wallet_key()))
            .key(self.idempotency_key(idempotency))
            .arg(expected.as_str())
            .arg(record.status.as_str())
            .arg(json)
            .arg(&record.queue_id)
            .arg(nonce)
            .arg(if release { "1" } else { "0" })
            .invoke_async(&mut self.redis.clone())
            .await?;

        match code {
            1 => Ok(()),
            0 => Err(StoreError::StatusConflict {
                queue_id: record.queue_id.clone(),
                expected,
                actual: TransactionStatus::parse(&actual).ok_or_else(|| {
                    StoreError::Serialization {
                        message: format!("unknown stored status {actual}"),
                    }
                })?,
            }),
            _ => Err(StoreError::NotFound {
                queue_id: record.queue_id.clone(),
            }),
        }
    }

    async fn list_transactions(
        &self,
        status: TransactionStatus,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let mut conn = self.redis.clone();
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let queue_ids: Vec<String> = conn.zrange(self.status_key(status), 0, stop).await?;

        // A record may have moved on between the two reads
        let records = self.load_records(queue_ids).await?;
        Ok(records.into_iter().filter(|r| r.status == status).collect())
    }

    async fn nonce_range(
        &self,
        key: WalletKey,
        from_nonce: u64,
        to_nonce: u64,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let queue_ids: Vec<String> = conn
            .zrangebyscore(self.nonce_index_key(key), from_nonce, to_nonce)
            .await?;
        self.load_records(queue_ids).await
    }

    async fn get_wallet(&self, address: Address) -> Result<Option<WalletDescriptor>, StoreError> {
        let mut conn = self.redis.clone();
        let json: Option<String> = conn.get(self.wallet_key(address)).await?;
        json.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn save_wallet(&self, descriptor: &WalletDescriptor) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let json = serde_json::to_string(descriptor)?;
        let _: () = conn.set(self.wallet_key(descriptor.address), json).await?;
        Ok(())
    }

    async fn get_nonce_record(&self, key: WalletKey) -> Result<Option<NonceRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let json: Option<String> = conn.get(self.nonce_record_key(key)).await?;
        json.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn save_nonce_record(&self, record: &NonceRecord) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let key = WalletKey {
            chain_id: record.chain_id,
            address: record.wallet_address,
        };
        let json = serde_json::to_string(record)?;
        let _: () = conn.set(self.nonce_record_key(key), json).await?;
        Ok(())
    }
}
