use alloy::primitives::ChainId;
use alloy_signer_aws::AwsSigner;
use alloy_signer_gcp::{GcpKeyRingRef, GcpSigner, KeySpecifier};
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_kms::config::{Credentials, ProvideCredentials};
use gcloud_sdk::{
    GoogleApi, TokenSourceType,
    google::cloud::kms::v1::key_management_service_client::KeyManagementServiceClient,
};
use zeroize::Zeroizing;

use crate::error::EngineError;

const GCP_KMS_ENDPOINT: &str = "https://cloudkms.googleapis.com";
const GCP_CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Turns stored credential ciphertext into plaintext on demand.
///
/// Secrets are only ever persisted in encrypted form; the resolver calls this
/// right before building a signer and drops the plaintext afterwards.
pub trait CredentialDecryptor: Send + Sync + 'static {
    fn decrypt(
        &self,
        ciphertext: &str,
    ) -> impl Future<Output = Result<Zeroizing<String>, EngineError>> + Send;
}

/// Decryptor for deployments that keep credential references unencrypted.
#[derive(Debug, Clone, Default)]
pub struct PlaintextDecryptor;

impl CredentialDecryptor for PlaintextDecryptor {
    async fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<String>, EngineError> {
        Ok(Zeroizing::new(ciphertext.to_string()))
    }
}

#[derive(Clone)]
pub struct AwsKmsCredential {
    pub access_key_id: Zeroizing<String>,
    pub secret_access_key: Zeroizing<String>,
    pub key_id: String,
    pub region: String,
}

impl std::fmt::Debug for AwsKmsCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsKmsCredential")
            .field("key_id", &self.key_id)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl ProvideCredentials for AwsKmsCredential {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        let credentials = Credentials::new(
            self.access_key_id.as_str(),
            self.secret_access_key.as_str(),
            None,
            None,
            "engine-core",
        );
        ProvideCredentialsFuture::ready(Ok(credentials))
    }
}

impl AwsKmsCredential {
    pub async fn get_signer(&self, chain_id: Option<ChainId>) -> Result<AwsSigner, EngineError> {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .credentials_provider(self.clone())
            .load()
            .await;
        let client = aws_sdk_kms::Client::new(&config);

        let signer = AwsSigner::new(client, self.key_id.clone(), chain_id).await?;
        Ok(signer)
    }
}

#[derive(Clone)]
pub struct GcpKmsCredential {
    pub project_id: String,
    pub location: String,
    pub key_ring: String,
    pub key_name: String,
    pub key_version: u64,
    pub service_account_json: Zeroizing<String>,
}

impl std::fmt::Debug for GcpKmsCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpKmsCredential")
            .field("project_id", &self.project_id)
            .field("location", &self.location)
            .field("key_ring", &self.key_ring)
            .field("key_name", &self.key_name)
            .field("key_version", &self.key_version)
            .finish_non_exhaustive()
    }
}

impl GcpKmsCredential {
    pub async fn get_signer(&self, chain_id: Option<ChainId>) -> Result<GcpSigner, EngineError> {
        let client = GoogleApi::from_function_with_token_source(
            KeyManagementServiceClient::new,
            GCP_KMS_ENDPOINT,
            None,
            vec![GCP_CLOUD_PLATFORM_SCOPE.to_string()],
            TokenSourceType::Json(self.service_account_json.to_string()),
        )
        .await
        .map_err(|e| EngineError::custody("gcp-kms", e.to_string()))?;

        let key_ring = GcpKeyRingRef::new(&self.project_id, &self.location, &self.key_ring);
        let specifier = KeySpecifier::new(key_ring, &self.key_name, self.key_version);

        let signer = GcpSigner::new(client, specifier, chain_id).await?;
        Ok(signer)
    }
}
