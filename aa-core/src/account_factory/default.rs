use alloy::primitives::{Address, Bytes};
use engine_core::constants::{
    DEFAULT_FACTORY_ADDRESS_V0_6, DEFAULT_FACTORY_ADDRESS_V0_7,
    DEFAULT_IMPLEMENTATION_ADDRESS_V0_6, DEFAULT_IMPLEMENTATION_ADDRESS_V0_7,
};

use super::{AccountFactory, utils};

/// Minimal-proxy account factory (CREATE2 clones of a fixed implementation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultAccountFactory {
    pub factory_address: Address,
    pub implementation_address: Address,
}

impl DefaultAccountFactory {
    pub fn v0_6() -> Self {
        Self {
            factory_address: DEFAULT_FACTORY_ADDRESS_V0_6,
            implementation_address: DEFAULT_IMPLEMENTATION_ADDRESS_V0_6,
        }
    }

    pub fn v0_7() -> Self {
        Self {
            factory_address: DEFAULT_FACTORY_ADDRESS_V0_7,
            implementation_address: DEFAULT_IMPLEMENTATION_ADDRESS_V0_7,
        }
    }

    pub fn with_addresses(factory_address: Address, implementation_address: Address) -> Self {
        Self {
            factory_address,
            implementation_address,
        }
    }
}

impl AccountFactory for DefaultAccountFactory {
    fn factory_address(&self) -> Address {
        self.factory_address
    }

    fn predict_address(&self, signer: &Address, salt_data: &Bytes) -> Address {
        let salt = utils::generate_salt(signer, salt_data);
        utils::predict_deterministic_address(self.implementation_address, salt, self.factory_address)
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::address;

    use super::*;

    #[test]
    fn test_v07_address_prediction() {
        let factory = DefaultAccountFactory::v0_7();
        let signer = address!("0xbe2D2B388635D33b0C9C6d60dE9853716e4b51A3");

        let predicted_address = factory.predict_address(&signer, &Bytes::new());

        assert_eq!(
            predicted_address,
            address!("0xDA15403AF9690C74f30eCC9cCa686fCAD2C897f8")
        );
    }

    #[test]
    fn test_v06_address_prediction() {
        let factory = DefaultAccountFactory::v0_6();
        let signer = address!("0xbe2D2B388635D33b0C9C6d60dE9853716e4b51A3");

        let predicted_address = factory.predict_address(&signer, &Bytes::new());

        assert_eq!(
            predicted_address,
            address!("0xB7E052ec0BC8B741Ce7cA7B7dFBaECb4B234ffBE")
        );
    }

    #[test]
    fn salt_changes_the_address() {
        let factory = DefaultAccountFactory::v0_7();
        let signer = address!("0xbe2D2B388635D33b0C9C6d60dE9853716e4b51A3");

        let unsalted = factory.predict_address(&signer, &Bytes::new());
        let salted = factory.predict_address(&signer, &Bytes::from_static(b"treasury"));
        assert_ne!(unsalted, salted);
    }
}
