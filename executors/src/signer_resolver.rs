use std::sync::Arc;

use alloy::{
    dyn_abi::TypedData,
    primitives::{Address, Bytes, Signature, U256},
    transports::http::reqwest::Url,
};
use engine_aa_core::{
    signer::{SmartAccountConfig, SmartAccountError, SmartAccountSigner},
    userop::VersionedUserOp,
};
use engine_core::{
    credentials::{AwsKmsCredential, CredentialDecryptor, GcpKmsCredential},
    error::EngineError,
    keystore::{Keystore, decrypt_key},
    signer::{AccountSigner, EoaAccount, RemoteCustodySigner},
    transaction::{SignedTransaction, UnsignedTransaction},
};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

/// A managed signing identity. Secrets are referenced by ciphertext only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletDescriptor {
    pub address: Address,
    pub custody: CustodyConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "custodyType",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum CustodyConfig {
    Local {
        keystore: Keystore,
        password_ciphertext: Option<String>,
    },
    AwsKms {
        key_id: String,
        region: String,
        access_key_id_ciphertext: Option<String>,
        secret_access_key_ciphertext: Option<String>,
    },
    GcpKms {
        project_id: String,
        location: String,
        key_ring: String,
        key_name: String,
        key_version: u64,
        service_account_ciphertext: Option<String>,
    },
    RemoteCustody {
        wallet_id: String,
        api_key_ciphertext: Option<String>,
        /// Falls back to the resolver's default custody service
        base_url: Option<String>,
    },
    ContractAccount {
        admin: Box<WalletDescriptor>,
        account: SmartAccountConfig,
    },
}

impl CustodyConfig {
    pub fn custody_type(&self) -> &'static str {
        match self {
            CustodyConfig::Local { .. } => "local",
            CustodyConfig::AwsKms { .. } => "aws-kms",
            CustodyConfig::GcpKms { .. } => "gcp-kms",
            CustodyConfig::RemoteCustody { .. } => "remote-custody",
            CustodyConfig::ContractAccount { .. } => "contract-account",
        }
    }
}

impl WalletDescriptor {
    /// Address whose nonce orders this wallet's transactions.
    pub fn sender_address(&self) -> Address {
        match &self.custody {
            CustodyConfig::ContractAccount { admin, .. } => admin.address,
            _ => self.address,
        }
    }

    pub fn is_contract_account(&self) -> bool {
        matches!(self.custody, CustodyConfig::ContractAccount { .. })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignerResolverError {
    #[error("Wallet {wallet} is missing {credential}")]
    CredentialsMissing {
        wallet: Address,
        credential: &'static str,
    },

    #[error("Failed to decrypt credentials for wallet {wallet}: {message}")]
    DecryptionFailed { wallet: Address, message: String },

    #[error("Unsupported custody type: {custody_type}")]
    UnsupportedCustodyType { custody_type: String },

    #[error("{provider} error: {message}")]
    RemoteProviderError {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Wallet is registered as {expected} but its key controls {actual}")]
    AddressMismatch { expected: Address, actual: Address },

    #[error("Wallet misconfigured: {message}")]
    Misconfigured { message: String },
}

impl From<SignerResolverError> for EngineError {
    fn from(err: SignerResolverError) -> Self {
        match err {
            SignerResolverError::RemoteProviderError {
                provider, message, ..
            } => EngineError::CustodyError { provider, message },
            other => EngineError::WalletConfigError {
                message: other.to_string(),
            },
        }
    }
}

impl From<SmartAccountError> for SignerResolverError {
    fn from(err: SmartAccountError) -> Self {
        match err {
            SmartAccountError::AddressMismatch {
                configured,
                predicted,
            } => SignerResolverError::AddressMismatch {
                expected: configured,
                actual: predicted,
            },
            other => SignerResolverError::Misconfigured {
                message: other.to_string(),
            },
        }
    }
}

fn remote_provider_error(error: EngineError) -> SignerResolverError {
    match error {
        EngineError::CustodyError { provider, message } => {
            SignerResolverError::RemoteProviderError {
                provider,
                status: None,
                message,
            }
        }
        other => SignerResolverError::RemoteProviderError {
            provider: "unknown".to_string(),
            status: None,
            message: other.root_cause_message(),
        },
    }
}

/// A resolved signing capability for one wallet on one chain.
#[derive(Debug, Clone)]
pub enum Account {
    Eoa(EoaAccount),
    SmartAccount(SmartAccountSigner<EoaAccount>),
}

impl Account {
    /// Address the wallet is known by.
    pub fn address(&self) -> Address {
        match self {
            Account::Eoa(eoa) => eoa.address(),
            Account::SmartAccount(account) => account.address(),
        }
    }

    /// Address that signs and broadcasts transactions (and owns the nonce).
    pub fn sender(&self) -> Address {
        match self {
            Account::Eoa(eoa) => eoa.address(),
            Account::SmartAccount(account) => account.admin().address(),
        }
    }

    /// Turns a user call into what the sender actually broadcasts. Contract
    /// accounts route through `execute` on the account.
    pub fn route_call(&self, to: Option<Address>, value: U256, data: Bytes) -> (Option<Address>, U256, Bytes) {
        match (self, to) {
            (Account::SmartAccount(account), Some(target)) => (
                Some(account.address()),
                U256::ZERO,
                account.encode_execute(target, value, data),
            ),
            _ => (to, value, data),
        }
    }

    pub async fn sign_transaction(
        &self,
        transaction: UnsignedTransaction,
    ) -> Result<SignedTransaction, EngineError> {
        match self {
            Account::Eoa(eoa) => eoa.sign_transaction(transaction).await,
            Account::SmartAccount(account) => account.admin().sign_transaction(transaction).await,
        }
    }

    pub async fn sign_message(&self, message: &[u8]) -> Result<Signature, EngineError> {
        match self {
            Account::Eoa(eoa) => eoa.sign_message(message).await,
            Account::SmartAccount(account) => account.sign_message(message).await,
        }
    }

    pub async fn sign_typed_data(&self, typed_data: &TypedData) -> Result<Signature, EngineError> {
        match self {
            Account::Eoa(eoa) => eoa.sign_typed_data(typed_data).await,
            Account::SmartAccount(account) => account.sign_typed_data(typed_data).await,
        }
    }

    pub async fn sign_user_operation(&self, op: &VersionedUserOp) -> Result<Signature, EngineError> {
        match self {
            Account::SmartAccount(account) => account.sign_user_operation(op).await,
            Account::Eoa(eoa) => Err(EngineError::ValidationError {
                message: format!("{} is not a contract account", eoa.address()),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccountCacheKey {
    pub chain_id: u64,
    pub wallet_address: Address,
    pub account_address: Option<Address>,
}

impl AccountCacheKey {
    pub fn for_descriptor(descriptor: &WalletDescriptor, chain_id: u64) -> Self {
        match &descriptor.custody {
            CustodyConfig::ContractAccount { admin, .. } => Self {
                chain_id,
                wallet_address: admin.address,
                account_address: Some(descriptor.address),
            },
            _ => Self {
                chain_id,
                wallet_address: descriptor.address,
                account_address: None,
            },
        }
    }
}

/// Resolves wallet descriptors into signing accounts.
///
/// Resolved accounts are cached without expiry; call
/// [`SignerResolver::invalidate_wallet`] when a wallet's credentials change.
pub struct SignerResolver<D> {
    decryptor: Arc<D>,
    http: reqwest::Client,
    default_custody_url: Option<Url>,
    cache: Cache<AccountCacheKey, Account>,
}

impl<D: CredentialDecryptor> SignerResolver<D> {
    pub fn new(decryptor: Arc<D>, default_custody_url: Option<Url>) -> Self {
        let cache = Cache::builder()
            .name("resolved-accounts")
            .support_invalidation_closures()
            .build();

        Self {
            decryptor,
            http: reqwest::Client::new(),
            default_custody_url,
            cache,
        }
    }

    pub async fn resolve(
        &self,
        descriptor: &WalletDescriptor,
        chain_id: u64,
    ) -> Result<Account, SignerResolverError> {
        let key = AccountCacheKey::for_descriptor(descriptor, chain_id);
        self.cache
            .try_get_with(key, self.build_account(descriptor, chain_id))
            .await
            .map_err(|e| e.as_ref().clone())
    }

    /// Drops every cached account that `address` signs for or is known by.
    pub fn invalidate_wallet(&self, address: Address) -> Result<(), EngineError> {
        self.cache
            .invalidate_entries_if(move |key, _| {
                key.wallet_address == address || key.account_address == Some(address)
            })
            .map(|_| ())
            .map_err(|e| EngineError::InternalError {
                message: format!("Failed to invalidate account cache: {e}"),
            })?;

        tracing::debug!(wallet = ?address, "Invalidated resolved accounts");
        Ok(())
    }

    async fn build_account(
        &self,
        descriptor: &WalletDescriptor,
        chain_id: u64,
    ) -> Result<Account, SignerResolverError> {
        let CustodyConfig::ContractAccount { admin, account } = &descriptor.custody else {
            return Ok(Account::Eoa(self.resolve_eoa(descriptor, chain_id).await?));
        };

        if admin.is_contract_account() {
            return Err(SignerResolverError::UnsupportedCustodyType {
                custody_type: "nested contract-account".to_string(),
            });
        }

        let admin_account = self.resolve_eoa(admin, chain_id).await?;
        let signer = SmartAccountSigner::new(admin_account, chain_id, account)?;
        if signer.address() != descriptor.address {
            return Err(SignerResolverError::AddressMismatch {
                expected: descriptor.address,
                actual: signer.address(),
            });
        }

        Ok(Account::SmartAccount(signer))
    }

    async fn resolve_eoa(
        &self,
        descriptor: &WalletDescriptor,
        chain_id: u64,
    ) -> Result<EoaAccount, SignerResolverError> {
        let wallet = descriptor.address;

        let account = match &descriptor.custody {
            CustodyConfig::Local {
                keystore,
                password_ciphertext,
            } => {
                let password = self
                    .decrypt(wallet, password_ciphertext, "keystore password")
                    .await?;
                let private_key = decrypt_key(keystore, password.as_bytes()).map_err(|e| {
                    SignerResolverError::DecryptionFailed {
                        wallet,
                        message: e.to_string(),
                    }
                })?;
                EoaAccount::from_private_key(&private_key).map_err(|e| {
                    SignerResolverError::DecryptionFailed {
                        wallet,
                        message: e.root_cause_message(),
                    }
                })?
            }

            CustodyConfig::AwsKms {
                key_id,
                region,
                access_key_id_ciphertext,
                secret_access_key_ciphertext,
            } => {
                let credential = AwsKmsCredential {
                    access_key_id: self
                        .decrypt(wallet, access_key_id_ciphertext, "AWS access key id")
                        .await?,
                    secret_access_key: self
                        .decrypt(wallet, secret_access_key_ciphertext, "AWS secret access key")
                        .await?,
                    key_id: key_id.clone(),
                    region: region.clone(),
                };
                let signer = credential
                    .get_signer(Some(chain_id))
                    .await
                    .map_err(remote_provider_error)?;
                EoaAccount::AwsKms(Arc::new(signer))
            }

            CustodyConfig::GcpKms {
                project_id,
                location,
                key_ring,
                key_name,
                key_version,
                service_account_ciphertext,
            } => {
                let credential = GcpKmsCredential {
                    project_id: project_id.clone(),
                    location: location.clone(),
                    key_ring: key_ring.clone(),
                    key_name: key_name.clone(),
                    key_version: *key_version,
                    service_account_json: self
                        .decrypt(wallet, service_account_ciphertext, "GCP service account")
                        .await?,
                };
                let signer = credential
                    .get_signer(Some(chain_id))
                    .await
                    .map_err(remote_provider_error)?;
                EoaAccount::GcpKms(Arc::new(signer))
            }

            CustodyConfig::RemoteCustody {
                wallet_id,
                api_key_ciphertext,
                base_url,
            } => {
                let base_url = self.custody_url(base_url.as_deref())?;
                let api_key = self
                    .decrypt(wallet, api_key_ciphertext, "custody API key")
                    .await?;
                EoaAccount::RemoteCustody(RemoteCustodySigner::new(
                    self.http.clone(),
                    base_url,
                    wallet_id.clone(),
                    api_key,
                    wallet,
                ))
            }

            CustodyConfig::ContractAccount { .. } => {
                return Err(SignerResolverError::UnsupportedCustodyType {
                    custody_type: "contract-account as admin".to_string(),
                });
            }
        };

        if account.address() != wallet {
            return Err(SignerResolverError::AddressMismatch {
                expected: wallet,
                actual: account.address(),
            });
        }

        tracing::debug!(
            wallet = ?wallet,
            custody = account.custody_name(),
            chain_id,
            "Resolved account"
        );
        Ok(account)
    }

    async fn decrypt(
        &self,
        wallet: Address,
        ciphertext: &Option<String>,
        credential: &'static str,
    ) -> Result<Zeroizing<String>, SignerResolverError> {
        let ciphertext = ciphertext
            .as_deref()
            .ok_or(SignerResolverError::CredentialsMissing { wallet, credential })?;

        self.decryptor
            .decrypt(ciphertext)
            .await
            .map_err(|e| SignerResolverError::DecryptionFailed {
                wallet,
                message: e.root_cause_message(),
            })
    }

    fn custody_url(&self, configured: Option<&str>) -> Result<Url, SignerResolverError> {
        let url = match configured {
            Some(raw) => {
                // Url::join drops the last path segment unless it ends in a slash
                let raw = if raw.ends_with('/') {
                    raw.to_string()
                } else {
                    format!("{raw}/")
                };
                Url::parse(&raw).map_err(|e| SignerResolverError::Misconfigured {
                    message: format!("Invalid custody URL {raw}: {e}"),
                })?
            }
            None => self
                .default_custody_url
                .clone()
                .ok_or_else(|| SignerResolverError::Misconfigured {
                    message: "No custody service URL configured".to_string(),
                })?,
        };
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::address;

    use super::*;

    #[test]
    fn descriptor_serializes_custody_tag() {
        let descriptor = WalletDescriptor {
            address: address!("0x1111111111111111111111111111111111111111"),
            custody: CustodyConfig::RemoteCustody {
                wallet_id: "w-1".to_string(),
                api_key_ciphertext: Some("enc".to_string()),
                base_url: None,
            },
        };
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["custody"]["custodyType"], "remote-custody");
        assert_eq!(json["custody"]["walletId"], "w-1");

        let back: WalletDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(back, descriptor);
    }

    #[test]
    fn contract_account_cache_key_uses_admin() {
        let admin = WalletDescriptor {
            address: address!("0x1111111111111111111111111111111111111111"),
            custody: CustodyConfig::RemoteCustody {
                wallet_id: "w-1".to_string(),
                api_key_ciphertext: None,
                base_url: None,
            },
        };
        let account = address!("0x2222222222222222222222222222222222222222");
        let descriptor = WalletDescriptor {
            address: account,
            custody: CustodyConfig::ContractAccount {
                admin: Box::new(admin.clone()),
                account: SmartAccountConfig {
                    factory_address: address!("0x3333333333333333333333333333333333333333"),
                    implementation_address: None,
                    account_salt: Bytes::new(),
                    entrypoint_version: engine_aa_core::userop::EntrypointVersion::V0_7,
                    account_address: Some(account),
                },
            },
        };

        let key = AccountCacheKey::for_descriptor(&descriptor, 1);
        assert_eq!(key.wallet_address, admin.address);
        assert_eq!(key.account_address, Some(account));
        assert_eq!(descriptor.sender_address(), admin.address);
    }
}
