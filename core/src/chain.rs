use std::collections::HashMap;

use alloy::{
    network::{ReceiptResponse, TransactionBuilder},
    primitives::{Address, Bytes, TxHash, U256},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::TransactionRequest,
    transports::{RpcError, TransportErrorKind, http::reqwest::Url},
};
use serde::{Deserialize, Serialize};

use crate::error::{AlloyRpcErrorToEngineError, EngineError};

/// Confirmed and pending transaction counts for one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionCounts {
    pub latest: u64,
    pub pending: u64,
}

/// The parts of a receipt the executor acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptSummary {
    pub transaction_hash: TxHash,
    pub block_number: Option<u64>,
    pub success: bool,
    pub gas_used: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip1559Fees {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// Parameters for a gas estimate.
#[derive(Debug, Clone, Default)]
pub struct CallRequest {
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
}

/// RPC surface of a chain, as consumed by the executors.
///
/// Uses the impl Future pattern so test doubles can implement it without boxing.
pub trait Chain: Send + Sync {
    fn chain_id(&self) -> u64;
    fn rpc_url(&self) -> Url;

    fn get_transaction_counts(
        &self,
        address: Address,
    ) -> impl Future<Output = Result<TransactionCounts, EngineError>> + Send;

    fn send_raw_transaction(
        &self,
        raw: Bytes,
    ) -> impl Future<Output = Result<TxHash, EngineError>> + Send;

    fn get_transaction_receipt(
        &self,
        hash: TxHash,
    ) -> impl Future<Output = Result<Option<ReceiptSummary>, EngineError>> + Send;

    /// `None` when the chain has no EIP-1559 support.
    fn estimate_eip1559_fees(
        &self,
    ) -> impl Future<Output = Result<Option<Eip1559Fees>, EngineError>> + Send;

    fn get_gas_price(&self) -> impl Future<Output = Result<u128, EngineError>> + Send;

    fn get_block_number(&self) -> impl Future<Output = Result<u64, EngineError>> + Send;

    fn estimate_gas(
        &self,
        call: CallRequest,
    ) -> impl Future<Output = Result<u64, EngineError>> + Send;
}

pub trait ChainService: Send + Sync {
    type Chain: Chain + Clone + 'static;

    fn get_chain(&self, chain_id: u64) -> Result<Self::Chain, EngineError>;
}

pub fn is_unsupported_eip1559_error(error: &RpcError<TransportErrorKind>) -> bool {
    if let RpcError::UnsupportedFeature(_) = error {
        return true;
    }

    if let RpcError::ErrorResp(resp) = error {
        let message = resp.message.to_lowercase();
        return message.contains("method not found");
    }

    false
}

/// A chain reached over JSON-RPC HTTP.
#[derive(Clone)]
pub struct RpcChain {
    chain_id: u64,
    rpc_url: Url,
    provider: RootProvider,
}

impl RpcChain {
    pub fn new(chain_id: u64, rpc_url: &str) -> Result<Self, EngineError> {
        let rpc_url = Url::parse(rpc_url).map_err(|e| EngineError::RpcConfigError {
            message: format!("Failed to parse RPC URL for chain {chain_id}: {e}"),
        })?;

        let provider = ProviderBuilder::new()
            .disable_recommended_fillers()
            .connect_http(rpc_url.clone());

        Ok(Self {
            chain_id,
            rpc_url,
            provider,
        })
    }

    pub fn provider(&self) -> &RootProvider {
        &self.provider
    }
}

impl Chain for RpcChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn rpc_url(&self) -> Url {
        self.rpc_url.clone()
    }

    async fn get_transaction_counts(&self, address: Address) -> Result<TransactionCounts, EngineError> {
        let latest = self
            .provider
            .get_transaction_count(address)
            .latest()
            .await
            .map_err(|e| e.to_engine_error(self))?;
        let pending = self
            .provider
            .get_transaction_count(address)
            .pending()
            .await
            .map_err(|e| e.to_engine_error(self))?;

        Ok(TransactionCounts { latest, pending })
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash, EngineError> {
        let pending = self
            .provider
            .send_raw_transaction(&raw)
            .await
            .map_err(|e| e.to_engine_error(self))?;
        Ok(*pending.tx_hash())
    }

    async fn get_transaction_receipt(
        &self,
        hash: TxHash,
    ) -> Result<Option<ReceiptSummary>, EngineError> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| e.to_engine_error(self))?;

        Ok(receipt.map(|receipt| ReceiptSummary {
            transaction_hash: ReceiptResponse::transaction_hash(&receipt),
            block_number: ReceiptResponse::block_number(&receipt),
            success: ReceiptResponse::status(&receipt),
            gas_used: ReceiptResponse::gas_used(&receipt),
        }))
    }

    async fn estimate_eip1559_fees(&self) -> Result<Option<Eip1559Fees>, EngineError> {
        match self.provider.estimate_eip1559_fees().await {
            Ok(estimate) => Ok(Some(Eip1559Fees {
                max_fee_per_gas: estimate.max_fee_per_gas,
                max_priority_fee_per_gas: estimate.max_priority_fee_per_gas,
            })),
            Err(e) if is_unsupported_eip1559_error(&e) => {
                tracing::debug!(chain_id = self.chain_id, "Chain does not support EIP-1559");
                Ok(None)
            }
            Err(e) => Err(e.to_engine_error(self)),
        }
    }

    async fn get_gas_price(&self) -> Result<u128, EngineError> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| e.to_engine_error(self))
    }

    async fn get_block_number(&self) -> Result<u64, EngineError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| e.to_engine_error(self))
    }

    async fn estimate_gas(&self, call: CallRequest) -> Result<u64, EngineError> {
        let mut request = TransactionRequest::default()
            .with_from(call.from)
            .with_value(call.value)
            .with_input(call.data);
        if let Some(to) = call.to {
            request = request.with_to(to);
        }

        self.provider
            .estimate_gas(request)
            .await
            .map_err(|e| e.to_engine_error(self))
    }
}

/// Chains configured by id.
#[derive(Clone, Default)]
pub struct RpcChainService {
    chains: HashMap<u64, RpcChain>,
}

impl RpcChainService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chain(&mut self, chain_id: u64, rpc_url: &str) -> Result<(), EngineError> {
        let chain = RpcChain::new(chain_id, rpc_url)?;
        self.chains.insert(chain_id, chain);
        Ok(())
    }
}

impl ChainService for RpcChainService {
    type Chain = RpcChain;

    fn get_chain(&self, chain_id: u64) -> Result<RpcChain, EngineError> {
        self.chains
            .get(&chain_id)
            .cloned()
            .ok_or_else(|| EngineError::RpcConfigError {
                message: format!("Chain {chain_id} is not configured"),
            })
    }
}
