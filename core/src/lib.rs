pub mod chain;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod keystore;
pub mod signer;
pub mod transaction;
