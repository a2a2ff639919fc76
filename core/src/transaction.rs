use alloy::{
    consensus::{SignableTransaction, TxEip1559, TxEnvelope, TxLegacy},
    eips::eip2718::Encodable2718,
    primitives::{Address, B256, Bytes, Signature, TxKind, U256},
};
use serde::{Deserialize, Serialize};

/// Which fee fields a transaction carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeModel {
    Legacy,
    Eip1559,
}

/// Fee parameters of one broadcast attempt, in wei.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeParams {
    #[serde(rename_all = "camelCase")]
    Legacy { gas_price: u128 },
    #[serde(rename_all = "camelCase")]
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
}

impl FeeParams {
    pub fn model(&self) -> FeeModel {
        match self {
            FeeParams::Legacy { .. } => FeeModel::Legacy,
            FeeParams::Eip1559 { .. } => FeeModel::Eip1559,
        }
    }
}

/// A fully specified transaction waiting for a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    pub gas_limit: u64,
    pub fees: FeeParams,
}

/// Typed transaction ready to be hashed and signed.
#[derive(Debug, Clone)]
pub enum TypedUnsigned {
    Legacy(TxLegacy),
    Eip1559(TxEip1559),
}

impl UnsignedTransaction {
    pub fn into_typed(self) -> TypedUnsigned {
        let to = self.to.map(TxKind::Call).unwrap_or(TxKind::Create);
        match self.fees {
            FeeParams::Legacy { gas_price } => TypedUnsigned::Legacy(TxLegacy {
                chain_id: Some(self.chain_id),
                nonce: self.nonce,
                gas_price,
                gas_limit: self.gas_limit,
                to,
                value: self.value,
                input: self.input,
            }),
            FeeParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => TypedUnsigned::Eip1559(TxEip1559 {
                chain_id: self.chain_id,
                nonce: self.nonce,
                gas_limit: self.gas_limit,
                max_fee_per_gas,
                max_priority_fee_per_gas,
                to,
                value: self.value,
                access_list: Default::default(),
                input: self.input,
            }),
        }
    }
}

impl TypedUnsigned {
    pub fn signature_hash(&self) -> B256 {
        match self {
            TypedUnsigned::Legacy(tx) => tx.signature_hash(),
            TypedUnsigned::Eip1559(tx) => tx.signature_hash(),
        }
    }

    pub fn into_signed(self, signature: Signature) -> SignedTransaction {
        let envelope: TxEnvelope = match self {
            TypedUnsigned::Legacy(tx) => tx.into_signed(signature).into(),
            TypedUnsigned::Eip1559(tx) => tx.into_signed(signature).into(),
        };

        SignedTransaction {
            hash: *envelope.tx_hash(),
            raw: envelope.encoded_2718().into(),
        }
    }
}

/// EIP-2718 encoded signed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub hash: B256,
    pub raw: Bytes,
}
