use std::{fmt, sync::Arc};

use alloy::{
    dyn_abi::TypedData,
    primitives::{Address, B256, Bytes, Signature, eip191_hash_message},
    signers::{Signer, local::PrivateKeySigner},
    transports::http::reqwest::Url,
};
use alloy_signer_aws::AwsSigner;
use alloy_signer_gcp::GcpSigner;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    error::EngineError,
    transaction::{SignedTransaction, UnsignedTransaction},
};

/// Uniform signing capability, using the impl Future pattern.
///
/// Every operation funnels through [`AccountSigner::sign_hash`], so a custody
/// backend only has to produce a secp256k1 signature over a digest.
pub trait AccountSigner: Send + Sync {
    fn address(&self) -> Address;

    fn sign_hash(&self, hash: B256) -> impl Future<Output = Result<Signature, EngineError>> + Send;

    /// EIP-191 personal message signature.
    fn sign_message(
        &self,
        message: &[u8],
    ) -> impl Future<Output = Result<Signature, EngineError>> + Send {
        self.sign_hash(eip191_hash_message(message))
    }

    /// EIP-712 typed data signature.
    fn sign_typed_data(
        &self,
        typed_data: &TypedData,
    ) -> impl Future<Output = Result<Signature, EngineError>> + Send {
        let hash = typed_data
            .eip712_signing_hash()
            .map_err(|e| EngineError::ValidationError {
                message: format!("Failed to compute typed data hash: {e}"),
            });
        async move { self.sign_hash(hash?).await }
    }

    fn sign_transaction(
        &self,
        transaction: UnsignedTransaction,
    ) -> impl Future<Output = Result<SignedTransaction, EngineError>> + Send {
        async move {
            let typed = transaction.into_typed();
            let signature = self.sign_hash(typed.signature_hash()).await?;
            Ok(typed.into_signed(signature))
        }
    }
}

/// An externally owned account, closed over every supported custody backend.
#[derive(Clone)]
pub enum EoaAccount {
    Local(PrivateKeySigner),
    AwsKms(Arc<AwsSigner>),
    GcpKms(Arc<GcpSigner>),
    RemoteCustody(RemoteCustodySigner),
}

impl fmt::Debug for EoaAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EoaAccount")
            .field("custody", &self.custody_name())
            .field("address", &self.address())
            .finish()
    }
}

impl EoaAccount {
    pub fn custody_name(&self) -> &'static str {
        match self {
            EoaAccount::Local(_) => "local",
            EoaAccount::AwsKms(_) => "aws-kms",
            EoaAccount::GcpKms(_) => "gcp-kms",
            EoaAccount::RemoteCustody(_) => "remote-custody",
        }
    }

    /// Builds an in-process signer. The caller's buffer should be zeroized.
    pub fn from_private_key(private_key: &[u8]) -> Result<Self, EngineError> {
        let signer = PrivateKeySigner::from_slice(private_key)
            .map_err(|e| EngineError::custody("local", format!("Invalid private key: {e}")))?;
        Ok(EoaAccount::Local(signer))
    }
}

impl AccountSigner for EoaAccount {
    fn address(&self) -> Address {
        match self {
            EoaAccount::Local(signer) => signer.address(),
            EoaAccount::AwsKms(signer) => signer.address(),
            EoaAccount::GcpKms(signer) => signer.address(),
            EoaAccount::RemoteCustody(signer) => signer.address,
        }
    }

    async fn sign_hash(&self, hash: B256) -> Result<Signature, EngineError> {
        let provider = self.custody_name();
        let result = match self {
            EoaAccount::Local(signer) => signer.sign_hash(&hash).await,
            EoaAccount::AwsKms(signer) => signer.sign_hash(&hash).await,
            EoaAccount::GcpKms(signer) => signer.sign_hash(&hash).await,
            EoaAccount::RemoteCustody(signer) => return signer.sign_digest(hash).await,
        };

        result.map_err(|e| {
            tracing::error!(provider, error = %e, "Failed to sign with custody backend");
            EngineError::custody(provider, e.to_string())
        })
    }
}

#[derive(Serialize)]
struct RemoteSignRequest {
    hash: B256,
}

#[derive(Deserialize)]
struct RemoteSignResponse {
    signature: Bytes,
}

/// HTTP custody service that signs digests for a wallet it holds.
#[derive(Clone)]
pub struct RemoteCustodySigner {
    client: reqwest::Client,
    base_url: Url,
    wallet_id: String,
    api_key: Arc<Zeroizing<String>>,
    address: Address,
}

impl RemoteCustodySigner {
    pub fn new(
        client: reqwest::Client,
        base_url: Url,
        wallet_id: String,
        api_key: Zeroizing<String>,
        address: Address,
    ) -> Self {
        Self {
            client,
            base_url,
            wallet_id,
            api_key: Arc::new(api_key),
            address,
        }
    }

    fn sign_url(&self) -> Result<Url, EngineError> {
        self.base_url
            .join(&format!("v1/wallets/{}/sign", self.wallet_id))
            .map_err(|e| EngineError::WalletConfigError {
                message: format!("Invalid remote custody URL: {e}"),
            })
    }

    async fn sign_digest(&self, hash: B256) -> Result<Signature, EngineError> {
        let response = self
            .client
            .post(self.sign_url()?)
            .bearer_auth(self.api_key.as_str())
            .json(&RemoteSignRequest { hash })
            .send()
            .await
            .map_err(|e| EngineError::custody("remote-custody", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                wallet_id = %self.wallet_id,
                status = status.as_u16(),
                "Remote custody service rejected signing request"
            );
            let message = if body.is_empty() {
                status.to_string()
            } else {
                body
            };
            return Err(EngineError::custody("remote-custody", message));
        }

        let body: RemoteSignResponse = response
            .json()
            .await
            .map_err(|e| EngineError::custody("remote-custody", e.to_string()))?;

        let signature = Signature::try_from(body.signature.as_ref())
            .map_err(|e| EngineError::custody("remote-custody", format!("Bad signature: {e}")))?;

        let recovered = signature
            .recover_address_from_prehash(&hash)
            .map_err(|e| EngineError::custody("remote-custody", e.to_string()))?;
        if recovered != self.address {
            return Err(EngineError::custody(
                "remote-custody",
                format!(
                    "Signature recovers to {recovered}, expected {}",
                    self.address
                ),
            ));
        }

        Ok(signature)
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{U256, address};

    use super::*;
    use crate::transaction::FeeParams;

    // Well-known development key (anvil account #0).
    const DEV_KEY: [u8; 32] = alloy::primitives::hex!(
        "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
    );

    fn dev_account() -> EoaAccount {
        EoaAccount::from_private_key(&DEV_KEY).unwrap()
    }

    #[test]
    fn local_account_address() {
        assert_eq!(
            dev_account().address(),
            address!("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266")
        );
    }

    #[tokio::test]
    async fn message_signature_recovers_to_account() {
        let account = dev_account();
        let signature = account.sign_message(b"hello engine").await.unwrap();
        let recovered = signature
            .recover_address_from_msg(b"hello engine")
            .unwrap();
        assert_eq!(recovered, account.address());
    }

    #[tokio::test]
    async fn signed_transaction_hash_matches_envelope() {
        let account = dev_account();
        let unsigned = UnsignedTransaction {
            chain_id: 80002,
            nonce: 7,
            to: Some(address!("0x70997970C51812dc3A010C7d01b50e0d17dc79C8")),
            value: U256::from(1_000u64),
            input: Bytes::new(),
            gas_limit: 21_000,
            fees: FeeParams::Eip1559 {
                max_fee_per_gas: 40_000_000_000,
                max_priority_fee_per_gas: 2_000_000_000,
            },
        };

        let signed = account.sign_transaction(unsigned.clone()).await.unwrap();
        assert_eq!(signed.hash, alloy::primitives::keccak256(&signed.raw));
        // EIP-1559 envelopes carry the 0x02 type byte.
        assert_eq!(signed.raw[0], 0x02);

        let typed = unsigned.into_typed();
        let signature = account.sign_hash(typed.signature_hash()).await.unwrap();
        assert_eq!(
            signature
                .recover_address_from_prehash(&typed.signature_hash())
                .unwrap(),
            account.address()
        );
    }
}
