use alloy::primitives::{Address, address};

pub const ENTRYPOINT_ADDRESS_V0_6: Address =
    address!("0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789");

pub const ENTRYPOINT_ADDRESS_V0_7: Address =
    address!("0x0000000071727De22E5E9d8BAf0edAc6f37da032");

pub const DEFAULT_FACTORY_ADDRESS_V0_7: Address =
    address!("0x4bE0ddfebcA9A5A4a617dee4DeCe99E7c862dceb");

pub const DEFAULT_IMPLEMENTATION_ADDRESS_V0_7: Address =
    address!("0x94eC38a5d2EDA5A543Ab4c08D998338D4082beb2");

pub const DEFAULT_FACTORY_ADDRESS_V0_6: Address =
    address!("0x85e23b94e7F5E9cC1fF78BCe78cfb15B81f0DF00");

pub const DEFAULT_IMPLEMENTATION_ADDRESS_V0_6: Address =
    address!("0xf22175c80c6e074C171811C59C6c0087e2a6a346");
