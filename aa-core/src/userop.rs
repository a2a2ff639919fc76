use alloy::{
    primitives::{Address, B256, Bytes, ChainId, U256, keccak256},
    rpc::types::{PackedUserOperation, UserOperation},
    sol_types::SolValue,
};
use engine_core::{
    constants::{ENTRYPOINT_ADDRESS_V0_6, ENTRYPOINT_ADDRESS_V0_7},
    error::EngineError,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntrypointVersion {
    #[serde(rename = "0.6")]
    V0_6,
    #[serde(rename = "0.7")]
    V0_7,
}

impl EntrypointVersion {
    pub fn entrypoint_address(&self) -> Address {
        match self {
            EntrypointVersion::V0_6 => ENTRYPOINT_ADDRESS_V0_6,
            EntrypointVersion::V0_7 => ENTRYPOINT_ADDRESS_V0_7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VersionedUserOp {
    V0_6(UserOperation),
    V0_7(PackedUserOperation),
}

impl VersionedUserOp {
    pub fn version(&self) -> EntrypointVersion {
        match self {
            VersionedUserOp::V0_6(_) => EntrypointVersion::V0_6,
            VersionedUserOp::V0_7(_) => EntrypointVersion::V0_7,
        }
    }

    pub fn sender(&self) -> Address {
        match self {
            VersionedUserOp::V0_6(op) => op.sender,
            VersionedUserOp::V0_7(op) => op.sender,
        }
    }

    /// The hash the account's admin signs, for the given entrypoint and chain.
    pub fn hash(&self, entrypoint: Address, chain_id: ChainId) -> Result<B256, EngineError> {
        match self {
            VersionedUserOp::V0_6(op) => Ok(compute_user_op_v06_hash(op, entrypoint, chain_id)),
            VersionedUserOp::V0_7(op) => compute_user_op_v07_hash(op, entrypoint, chain_id),
        }
    }
}

fn pack_u128_pair(high: U256, low: U256, field: &str) -> Result<B256, EngineError> {
    let to_u128 = |value: U256, name: &str| -> Result<u128, EngineError> {
        value.try_into().map_err(|_| EngineError::ValidationError {
            message: format!("{name} too large for {field}"),
        })
    };

    let mut packed = [0u8; 32];
    packed[0..16].copy_from_slice(&to_u128(high, "high half")?.to_be_bytes());
    packed[16..32].copy_from_slice(&to_u128(low, "low half")?.to_be_bytes());
    Ok(B256::from(packed))
}

fn final_hash(inner: Vec<u8>, entrypoint: Address, chain_id: ChainId) -> B256 {
    let inner_hash = keccak256(&inner);
    keccak256((inner_hash, entrypoint, U256::from(chain_id)).abi_encode())
}

pub fn compute_user_op_v06_hash(op: &UserOperation, entrypoint: Address, chain_id: ChainId) -> B256 {
    // signature is excluded from the hash
    let inner = (
        op.sender,
        op.nonce,
        keccak256(&op.init_code),
        keccak256(&op.call_data),
        op.call_gas_limit,
        op.verification_gas_limit,
        op.pre_verification_gas,
        op.max_fee_per_gas,
        op.max_priority_fee_per_gas,
        keccak256(&op.paymaster_and_data),
    )
        .abi_encode();

    final_hash(inner, entrypoint, chain_id)
}

pub fn compute_user_op_v07_hash(
    op: &PackedUserOperation,
    entrypoint: Address,
    chain_id: ChainId,
) -> Result<B256, EngineError> {
    let init_code: Bytes = match op.factory {
        Some(factory) if factory != Address::ZERO => [
            factory.as_slice(),
            &op.factory_data.clone().unwrap_or_default()[..],
        ]
        .concat()
        .into(),
        Some(_) => op.factory_data.clone().unwrap_or_default(),
        None => Bytes::default(),
    };

    let account_gas_limits = pack_u128_pair(
        op.verification_gas_limit,
        op.call_gas_limit,
        "accountGasLimits",
    )?;
    let gas_fees = pack_u128_pair(op.max_priority_fee_per_gas, op.max_fee_per_gas, "gasFees")?;

    let paymaster_and_data: Bytes = match op.paymaster {
        Some(paymaster) if paymaster != Address::ZERO => {
            let limits = pack_u128_pair(
                op.paymaster_verification_gas_limit.unwrap_or_default(),
                op.paymaster_post_op_gas_limit.unwrap_or_default(),
                "paymasterAndData",
            )?;
            [
                paymaster.as_slice(),
                limits.as_slice(),
                &op.paymaster_data.clone().unwrap_or_default()[..],
            ]
            .concat()
            .into()
        }
        Some(_) => op.paymaster_data.clone().unwrap_or_default(),
        None => Bytes::default(),
    };

    let inner = (
        op.sender,
        op.nonce,
        keccak256(&init_code),
        keccak256(&op.call_data),
        account_gas_limits,
        op.pre_verification_gas,
        gas_fees,
        keccak256(&paymaster_and_data),
    )
        .abi_encode();

    Ok(final_hash(inner, entrypoint, chain_id))
}
