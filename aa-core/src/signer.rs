use alloy::{
    dyn_abi::TypedData,
    primitives::{Address, B256, Bytes, ChainId, Signature, U256, eip191_hash_message},
    sol,
    sol_types::{SolCall, SolStruct, SolValue, eip712_domain},
};
use engine_core::{error::EngineError, signer::AccountSigner};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    account_factory::{AccountFactory, get_account_factory},
    userop::{EntrypointVersion, VersionedUserOp},
};

sol! {
    function execute(address _target, uint256 _value, bytes _calldata);
}

sol! {
    struct AccountMessage {
        bytes message;
    }
}

/// How a contract account is derived from its admin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartAccountConfig {
    pub factory_address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation_address: Option<Address>,
    #[serde(default)]
    pub account_salt: Bytes,
    pub entrypoint_version: EntrypointVersion,
    /// Expected account address. Checked against the prediction when the
    /// factory is known; required when it is not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_address: Option<Address>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SmartAccountError {
    #[error("configured account {configured} does not match predicted address {predicted}")]
    AddressMismatch {
        configured: Address,
        predicted: Address,
    },

    #[error("factory {factory} cannot predict addresses offline; an account address is required")]
    UnpredictableFactory { factory: Address },

    #[error("user operation for entrypoint {actual:?} cannot be signed by a {expected:?} account")]
    EntrypointMismatch {
        expected: EntrypointVersion,
        actual: EntrypointVersion,
    },

    #[error("user operation sender {sender} is not account {account}")]
    WrongSender { sender: Address, account: Address },
}

impl From<SmartAccountError> for EngineError {
    fn from(err: SmartAccountError) -> Self {
        match err {
            SmartAccountError::EntrypointMismatch { .. } | SmartAccountError::WrongSender { .. } => {
                EngineError::ValidationError {
                    message: err.to_string(),
                }
            }
            _ => EngineError::WalletConfigError {
                message: err.to_string(),
            },
        }
    }
}

/// Contract account controlled by an admin EOA.
///
/// Composes the admin signer rather than replacing it: user operations and
/// messages are signed by the admin on behalf of the account, and plain sends
/// are wrapped in `execute` calls that the admin broadcasts itself.
#[derive(Debug, Clone)]
pub struct SmartAccountSigner<S> {
    admin: S,
    chain_id: ChainId,
    account_address: Address,
    factory_address: Address,
    entrypoint_version: EntrypointVersion,
    init_calldata: Bytes,
}

impl<S: AccountSigner> SmartAccountSigner<S> {
    pub fn new(
        admin: S,
        chain_id: ChainId,
        config: &SmartAccountConfig,
    ) -> Result<Self, SmartAccountError> {
        let admin_address = admin.address();
        let factory = get_account_factory(config.factory_address, config.implementation_address);

        let account_address = match (factory, config.account_address) {
            (Some(factory), configured) => {
                let predicted = factory.predict_address(&admin_address, &config.account_salt);
                if let Some(configured) = configured {
                    if configured != predicted {
                        return Err(SmartAccountError::AddressMismatch {
                            configured,
                            predicted,
                        });
                    }
                }
                predicted
            }
            (None, Some(configured)) => configured,
            (None, None) => {
                return Err(SmartAccountError::UnpredictableFactory {
                    factory: config.factory_address,
                });
            }
        };

        let init_calldata = get_account_factory(config.factory_address, None)
            .map(|factory| factory.init_calldata(admin_address, config.account_salt.clone()))
            .unwrap_or_default();

        tracing::debug!(
            account = ?account_address,
            admin = ?admin_address,
            chain_id,
            "Resolved contract account"
        );

        Ok(Self {
            admin,
            chain_id,
            account_address,
            factory_address: config.factory_address,
            entrypoint_version: config.entrypoint_version,
            init_calldata,
        })
    }

    pub fn address(&self) -> Address {
        self.account_address
    }

    pub fn admin(&self) -> &S {
        &self.admin
    }

    pub fn factory_address(&self) -> Address {
        self.factory_address
    }

    /// `createAccount` calldata for the default factories; empty otherwise.
    pub fn init_calldata(&self) -> &Bytes {
        &self.init_calldata
    }

    /// Calldata routing a call through the account.
    pub fn encode_execute(&self, target: Address, value: U256, calldata: Bytes) -> Bytes {
        executeCall {
            _target: target,
            _value: value,
            _calldata: calldata,
        }
        .abi_encode()
        .into()
    }

    pub async fn sign_user_operation(&self, op: &VersionedUserOp) -> Result<Signature, EngineError> {
        if op.version() != self.entrypoint_version {
            return Err(SmartAccountError::EntrypointMismatch {
                expected: self.entrypoint_version,
                actual: op.version(),
            }
            .into());
        }
        if op.sender() != self.account_address {
            return Err(SmartAccountError::WrongSender {
                sender: op.sender(),
                account: self.account_address,
            }
            .into());
        }

        let hash = op.hash(self.entrypoint_version.entrypoint_address(), self.chain_id)?;
        self.admin.sign_message(hash.as_slice()).await
    }

    /// Signs an EIP-191 message, wrapped in the account's `AccountMessage` domain.
    pub async fn sign_message(&self, message: &[u8]) -> Result<Signature, EngineError> {
        self.sign_wrapped_hash(eip191_hash_message(message)).await
    }

    pub async fn sign_typed_data(&self, typed_data: &TypedData) -> Result<Signature, EngineError> {
        // Typed data addressed to the account itself is verified against the admin directly
        let is_self_verifying = typed_data.domain.verifying_contract == Some(self.account_address);
        if is_self_verifying {
            return self.admin.sign_typed_data(typed_data).await;
        }

        let hash = typed_data
            .eip712_signing_hash()
            .map_err(|e| EngineError::ValidationError {
                message: format!("Failed to compute typed data hash: {e}"),
            })?;
        self.sign_wrapped_hash(hash).await
    }

    async fn sign_wrapped_hash(&self, hash: B256) -> Result<Signature, EngineError> {
        let domain = eip712_domain! {
            name: "Account",
            version: "1",
            chain_id: self.chain_id,
            verifying_contract: self.account_address,
        };

        let account_message = AccountMessage {
            message: hash.abi_encode().into(),
        };

        self.admin
            .sign_hash(account_message.eip712_signing_hash(&domain))
            .await
    }
}

#[cfg(test)]
mod tests {
    use alloy::{
        primitives::{address, hex},
        rpc::types::PackedUserOperation,
    };
    use engine_core::{constants::DEFAULT_FACTORY_ADDRESS_V0_7, signer::EoaAccount};

    use super::*;

    const ADMIN_KEY: [u8; 32] =
        hex!("59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d");

    fn admin() -> EoaAccount {
        EoaAccount::from_private_key(&ADMIN_KEY).unwrap()
    }

    fn config() -> SmartAccountConfig {
        SmartAccountConfig {
            factory_address: DEFAULT_FACTORY_ADDRESS_V0_7,
            implementation_address: None,
            account_salt: Bytes::new(),
            entrypoint_version: EntrypointVersion::V0_7,
            account_address: None,
        }
    }

    #[test]
    fn predicts_account_for_default_factory() {
        let account = SmartAccountSigner::new(admin(), 80002, &config()).unwrap();
        let predicted = crate::account_factory::DefaultAccountFactory::v0_7()
            .predict_address(&admin().address(), &Bytes::new());
        assert_eq!(account.address(), predicted);
        assert!(!account.init_calldata().is_empty());
    }

    #[test]
    fn rejects_mismatched_account_address() {
        let mut config = config();
        config.account_address = Some(address!("0x000000000000000000000000000000000000dEaD"));
        let err = SmartAccountSigner::new(admin(), 80002, &config).unwrap_err();
        assert!(matches!(err, SmartAccountError::AddressMismatch { .. }));
    }

    #[test]
    fn custom_factory_requires_explicit_address() {
        let mut config = config();
        config.factory_address = address!("0x1111111111111111111111111111111111111111");
        assert!(matches!(
            SmartAccountSigner::new(admin(), 80002, &config),
            Err(SmartAccountError::UnpredictableFactory { .. })
        ));

        let explicit = address!("0x3333333333333333333333333333333333333333");
        config.account_address = Some(explicit);
        let account = SmartAccountSigner::new(admin(), 80002, &config).unwrap();
        assert_eq!(account.address(), explicit);
    }

    fn packed_op(sender: Address, call_data: Bytes) -> PackedUserOperation {
        PackedUserOperation {
            sender,
            nonce: U256::from(1),
            factory: None,
            factory_data: None,
            call_data,
            call_gas_limit: U256::from(100_000),
            verification_gas_limit: U256::from(200_000),
            pre_verification_gas: U256::from(50_000),
            max_fee_per_gas: U256::from(30_000_000_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000_000u64),
            paymaster: None,
            paymaster_verification_gas_limit: None,
            paymaster_post_op_gas_limit: None,
            paymaster_data: None,
            signature: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn user_operation_is_signed_by_admin() {
        let account = SmartAccountSigner::new(admin(), 80002, &config()).unwrap();
        let op = VersionedUserOp::V0_7(packed_op(
            account.address(),
            account.encode_execute(Address::ZERO, U256::ZERO, Bytes::new()),
        ));

        let signature = account.sign_user_operation(&op).await.unwrap();
        let hash = op
            .hash(EntrypointVersion::V0_7.entrypoint_address(), 80002)
            .unwrap();
        let recovered = signature.recover_address_from_msg(hash.as_slice()).unwrap();
        assert_eq!(recovered, admin().address());
    }

    #[tokio::test]
    async fn user_operation_for_other_sender_is_rejected() {
        let account = SmartAccountSigner::new(admin(), 80002, &config()).unwrap();
        let op = VersionedUserOp::V0_7(packed_op(Address::ZERO, Bytes::new()));
        let err = account.sign_user_operation(&op).await.unwrap_err();
        assert!(matches!(err, EngineError::ValidationError { .. }));
    }

    #[tokio::test]
    async fn message_is_wrapped_in_account_domain() {
        let account = SmartAccountSigner::new(admin(), 80002, &config()).unwrap();
        let wrapped = account.sign_message(b"gm").await.unwrap();
        let direct = admin().sign_message(b"gm").await.unwrap();
        assert_ne!(wrapped, direct);
    }
}
