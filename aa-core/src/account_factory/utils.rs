use alloy::{
    primitives::{Address, B256, Bytes, bytes, keccak256},
    sol_types::SolValue,
};

pub fn generate_salt(admin: &Address, data: &Bytes) -> B256 {
    keccak256((admin, data).abi_encode_params())
}

/// CREATE2 address of an EIP-1167 minimal proxy pointing at `implementation`,
/// deployed by `deployer` with `salt`.
pub fn predict_deterministic_address(
    implementation: Address,
    salt: B256,
    deployer: Address,
) -> Address {
    let code_prefix = bytes!("0x3d602d80600a3d3981f3363d3d373d3d3d363d73");
    let code_suffix = bytes!("0x5af43d82803e903d91602b57fd5bf3");

    // 55 bytes: prefix, implementation, suffix
    let mut init_code = Vec::with_capacity(55);
    init_code.extend_from_slice(&code_prefix);
    init_code.extend_from_slice(implementation.as_slice());
    init_code.extend_from_slice(&code_suffix);

    deployer.create2(salt, keccak256(&init_code))
}
