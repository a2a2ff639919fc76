use alloy::transports::{RpcError as AlloyRpcError, TransportErrorKind};
use alloy_signer_aws::AwsSignerError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::Chain;

#[derive(Debug, Error, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorKind {
    /// Server returned an error response.
    #[error("server returned an error response: {}", .0.as_display())]
    ErrorResp(RpcErrorResponse),

    /// Server returned a null response when a non-null response was expected.
    #[error("server returned a null response when a non-null response was expected")]
    NullResp,

    /// Rpc server returned an unsupported feature.
    #[error("unsupported feature: {message}")]
    UnsupportedFeature { message: String },

    /// A local pre-processing step failed.
    #[error("local usage error: {message}")]
    InternalError { message: String },

    #[error("serialization error: {message}")]
    SerError { message: String },

    #[error("deserialization error: {message}, text: {text}")]
    DeserError { message: String, text: String },

    #[error("HTTP error {status}")]
    TransportHttpError { status: u16, body: String },

    #[error("Other transport error: {message}")]
    OtherTransportError { message: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RpcErrorResponse {
    /// The error code.
    pub code: i64,
    /// The error message (if any).
    pub message: String,
    /// The error data (if any).
    pub data: Option<String>,
}

impl RpcErrorResponse {
    pub fn as_display(&self) -> String {
        format!(
            "code {}: {}{}",
            self.code,
            self.message,
            self.data
                .as_ref()
                .map(|data| format!(", data: {data}"))
                .unwrap_or_default()
        )
    }
}

#[derive(Error, Debug, Serialize, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "type")]
pub enum EngineError {
    /// Malformed request, rejected synchronously at enqueue.
    #[error("Validation error: {message}")]
    ValidationError { message: String },

    /// Unknown or misconfigured wallet.
    #[error("Wallet configuration error: {message}")]
    WalletConfigError { message: String },

    /// A custody backend (KMS, remote signer, local keystore) failed to sign.
    #[error("Custody error from {provider}: {message}")]
    CustodyError { provider: String, message: String },

    #[error("RPC error on chain {chain_id} at {rpc_url}: {message}")]
    RpcError {
        chain_id: u64,
        rpc_url: String,
        message: String,
        kind: RpcErrorKind,
    },

    #[error("Bad RPC configuration: {message}")]
    RpcConfigError { message: String },

    #[error("Persistence error: {message}")]
    PersistenceError { message: String },

    /// Lifecycle notification delivery failed. Never affects transaction status.
    #[error("Delivery error: {message}")]
    DeliveryError { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl EngineError {
    /// The provider or chain message that caused this error, without engine wrapping.
    pub fn root_cause_message(&self) -> String {
        match self {
            EngineError::RpcError { kind, message, .. } => match kind {
                RpcErrorKind::ErrorResp(resp) => resp.message.clone(),
                RpcErrorKind::TransportHttpError { body, .. } if !body.is_empty() => body.clone(),
                _ => message.clone(),
            },
            EngineError::CustodyError { message, .. }
            | EngineError::ValidationError { message }
            | EngineError::WalletConfigError { message }
            | EngineError::RpcConfigError { message }
            | EngineError::PersistenceError { message }
            | EngineError::DeliveryError { message }
            | EngineError::InternalError { message } => message.clone(),
        }
    }

    pub fn custody(provider: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::CustodyError {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

pub trait AlloyRpcErrorToEngineError {
    fn to_engine_error(&self, chain: &impl Chain) -> EngineError;
}

fn to_engine_rpc_error_kind(err: &AlloyRpcError<TransportErrorKind>) -> RpcErrorKind {
    match err {
        AlloyRpcError::ErrorResp(err) => RpcErrorKind::ErrorResp(RpcErrorResponse {
            code: err.code,
            message: err.message.to_string(),
            data: err.data.as_ref().map(|data| data.to_string()),
        }),
        AlloyRpcError::NullResp => RpcErrorKind::NullResp,
        AlloyRpcError::UnsupportedFeature(feature) => RpcErrorKind::UnsupportedFeature {
            message: feature.to_string(),
        },
        AlloyRpcError::LocalUsageError(err) => RpcErrorKind::InternalError {
            message: err.to_string(),
        },
        AlloyRpcError::SerError(err) => RpcErrorKind::SerError {
            message: err.to_string(),
        },
        AlloyRpcError::DeserError { err, text } => RpcErrorKind::DeserError {
            message: err.to_string(),
            text: text.to_string(),
        },
        AlloyRpcError::Transport(err) => match err {
            TransportErrorKind::HttpError(err) => RpcErrorKind::TransportHttpError {
                status: err.status,
                body: err.body.to_string(),
            },
            _ => RpcErrorKind::OtherTransportError {
                message: err.to_string(),
            },
        },
    }
}

impl AlloyRpcErrorToEngineError for AlloyRpcError<TransportErrorKind> {
    fn to_engine_error(&self, chain: &impl Chain) -> EngineError {
        EngineError::RpcError {
            chain_id: chain.chain_id(),
            rpc_url: chain.rpc_url().to_string(),
            message: self.to_string(),
            kind: to_engine_rpc_error_kind(self),
        }
    }
}

impl From<AwsSignerError> for EngineError {
    fn from(err: AwsSignerError) -> Self {
        EngineError::custody("aws-kms", err.to_string())
    }
}

impl From<alloy_signer_gcp::GcpSignerError> for EngineError {
    fn from(err: alloy_signer_gcp::GcpSignerError) -> Self {
        EngineError::custody("gcp-kms", err.to_string())
    }
}

impl From<alloy::signers::Error> for EngineError {
    fn from(err: alloy::signers::Error) -> Self {
        EngineError::custody("local", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_is_the_provider_message() {
        let error = EngineError::RpcError {
            chain_id: 1,
            rpc_url: "http://localhost:8545".to_string(),
            message: "server returned an error response: code -32000: insufficient funds"
                .to_string(),
            kind: RpcErrorKind::ErrorResp(RpcErrorResponse {
                code: -32000,
                message: "insufficient funds for gas * price + value".to_string(),
                data: None,
            }),
        };

        assert_eq!(
            error.root_cause_message(),
            "insufficient funds for gas * price + value"
        );
    }

    #[test]
    fn serializes_with_screaming_snake_tag() {
        let error = EngineError::WalletConfigError {
            message: "unknown wallet".to_string(),
        };
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["type"], "WALLET_CONFIG_ERROR");
        assert_eq!(json["message"], "unknown wallet");
    }
}
