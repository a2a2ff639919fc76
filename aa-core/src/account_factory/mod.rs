use alloy::{
    primitives::{Address, Bytes},
    sol,
    sol_types::SolCall,
};
use engine_core::constants::{DEFAULT_FACTORY_ADDRESS_V0_6, DEFAULT_FACTORY_ADDRESS_V0_7};

mod default;
mod utils;

pub use default::*;

sol! {
    function createAccount(address admin, bytes salt) returns (address);
}

/// A factory whose deployed account addresses can be predicted offline.
pub trait AccountFactory {
    fn factory_address(&self) -> Address;

    /// Predicts the smart account address for a given admin signer
    fn predict_address(&self, signer: &Address, salt_data: &Bytes) -> Address;

    fn init_calldata(&self, signer: Address, salt_data: Bytes) -> Bytes {
        createAccountCall {
            admin: signer,
            salt: salt_data,
        }
        .abi_encode()
        .into()
    }
}

/// Resolves a factory that supports offline address prediction.
///
/// Returns `None` for custom factories without a known implementation; accounts
/// from those factories must be configured with an explicit address.
pub fn get_account_factory(
    factory_address: Address,
    implementation_address: Option<Address>,
) -> Option<DefaultAccountFactory> {
    if factory_address == DEFAULT_FACTORY_ADDRESS_V0_6 {
        Some(DefaultAccountFactory::v0_6())
    } else if factory_address == DEFAULT_FACTORY_ADDRESS_V0_7 {
        Some(DefaultAccountFactory::v0_7())
    } else {
        implementation_address.map(|implementation| {
            DefaultAccountFactory::with_addresses(factory_address, implementation)
        })
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::address;

    use super::*;

    #[test]
    fn custom_factory_needs_implementation() {
        let custom = address!("0x1111111111111111111111111111111111111111");
        assert!(get_account_factory(custom, None).is_none());

        let implementation = address!("0x2222222222222222222222222222222222222222");
        let factory = get_account_factory(custom, Some(implementation)).unwrap();
        assert_eq!(factory.factory_address(), custom);
        assert_eq!(factory.implementation_address, implementation);
    }

    #[test]
    fn init_calldata_starts_with_create_account_selector() {
        let factory = DefaultAccountFactory::v0_7();
        let calldata = factory.init_calldata(
            address!("0xbe2D2B388635D33b0C9C6d60dE9853716e4b51A3"),
            Bytes::new(),
        );
        assert_eq!(&calldata[..4], createAccountCall::SELECTOR.as_slice());
    }
}
