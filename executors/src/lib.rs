pub mod confirm;
pub mod error_classifier;
pub mod events;
pub mod gas;
pub mod nonce_manager;
pub mod queue;
pub mod retry;
pub mod shutdown;
pub mod signer_resolver;
pub mod store;
