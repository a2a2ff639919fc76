use engine_core::error::{EngineError, RpcErrorKind};

/// What a failed send or signing step means for the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    /// The wallet's counter is behind the chain
    NonceTooLow,

    /// The wallet's counter is ahead of the chain (a gap)
    NonceTooHigh,

    /// The node already holds this exact transaction
    AlreadyKnown,

    /// A replacement did not pay enough more than the transaction it replaces
    ReplacementUnderpriced,

    InsufficientFunds,

    /// Network or provider trouble; the same request may succeed later
    Transient,

    /// The request itself is rejected; retrying cannot help
    Fatal,
}

impl SendErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendErrorKind::Transient)
    }

    /// Errors that mean the local nonce counter disagrees with the chain.
    pub fn needs_resync(&self) -> bool {
        matches!(self, SendErrorKind::NonceTooLow | SendErrorKind::NonceTooHigh)
    }
}

/// Maps engine errors raised while preparing, signing or broadcasting a
/// transaction onto the actions the queue takes.
pub struct SendErrorClassifier;

impl SendErrorClassifier {
    pub fn classify(error: &EngineError) -> SendErrorKind {
        match error {
            EngineError::RpcError { kind, .. } => Self::classify_rpc(kind),
            // Custody providers are remote services with their own outages
            EngineError::CustodyError { .. } => SendErrorKind::Transient,
            EngineError::ValidationError { .. }
            | EngineError::WalletConfigError { .. }
            | EngineError::RpcConfigError { .. }
            | EngineError::DeliveryError { .. }
            | EngineError::InternalError { .. } => SendErrorKind::Fatal,
            // Callers abort the step on persistence errors instead of classifying them
            EngineError::PersistenceError { .. } => SendErrorKind::Transient,
        }
    }

    fn classify_rpc(kind: &RpcErrorKind) -> SendErrorKind {
        match kind {
            RpcErrorKind::ErrorResp(resp) => Self::classify_message(resp.code, &resp.message),
            RpcErrorKind::TransportHttpError { status, .. } => {
                if *status == 429 || *status >= 500 {
                    SendErrorKind::Transient
                } else if (400..500).contains(status) {
                    SendErrorKind::Fatal
                } else {
                    SendErrorKind::Transient
                }
            }
            RpcErrorKind::NullResp
            | RpcErrorKind::DeserError { .. }
            | RpcErrorKind::OtherTransportError { .. } => SendErrorKind::Transient,
            RpcErrorKind::UnsupportedFeature { .. }
            | RpcErrorKind::InternalError { .. }
            | RpcErrorKind::SerError { .. } => SendErrorKind::Fatal,
        }
    }

    fn classify_message(code: i64, message: &str) -> SendErrorKind {
        let msg = message.to_lowercase();

        if msg.contains("nonce too low") {
            SendErrorKind::NonceTooLow
        } else if msg.contains("nonce too high") {
            SendErrorKind::NonceTooHigh
        } else if msg.contains("already known")
            || msg.starts_with("known transaction")
            || msg.contains("already imported")
            || msg.contains("transaction already exists")
        {
            SendErrorKind::AlreadyKnown
        } else if msg.contains("replacement") && msg.contains("underpriced") {
            SendErrorKind::ReplacementUnderpriced
        } else if msg.contains("insufficient funds") {
            SendErrorKind::InsufficientFunds
        } else if msg.contains("revert")
            || msg.contains("invalid chain")
            || msg.contains("invalid opcode")
        {
            SendErrorKind::Fatal
        } else if code == -32000 {
            // Node-level rejection of the transaction itself
            SendErrorKind::Fatal
        } else {
            SendErrorKind::Transient
        }
    }
}
