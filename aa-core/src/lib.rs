pub mod account_factory;
pub mod signer;
pub mod userop;
