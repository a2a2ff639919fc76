use engine_core::{chain::RpcChainService, error::EngineError};

use crate::config::ChainConfig;

/// Builds the chain service from configuration. Fails on duplicate chain ids
/// and unparsable RPC URLs.
pub fn build_chain_service(chains: &[ChainConfig]) -> Result<RpcChainService, EngineError> {
    let mut service = RpcChainService::new();
    let mut seen = std::collections::HashSet::new();

    for chain in chains {
        if !seen.insert(chain.chain_id) {
            return Err(EngineError::RpcConfigError {
                message: format!("Chain {} is configured twice", chain.chain_id),
            });
        }
        service.add_chain(chain.chain_id, &chain.rpc_url)?;
        tracing::info!(chain_id = chain.chain_id, "Configured chain");
    }

    Ok(service)
}

#[cfg(test)]
mod tests {
    use engine_core::chain::{Chain, ChainService};

    use super::*;

    fn chain(chain_id: u64, rpc_url: &str) -> ChainConfig {
        ChainConfig {
            chain_id,
            rpc_url: rpc_url.to_string(),
        }
    }

    #[test]
    fn builds_configured_chains() {
        let service = build_chain_service(&[
            chain(1, "https://eth.example/rpc"),
            chain(80002, "https://amoy.example/rpc"),
        ])
        .unwrap();

        assert_eq!(service.get_chain(80002).unwrap().chain_id(), 80002);
        assert!(matches!(
            service.get_chain(5),
            Err(EngineError::RpcConfigError { .. })
        ));
    }

    #[test]
    fn rejects_bad_configuration() {
        assert!(build_chain_service(&[chain(1, "not a url")]).is_err());
        assert!(
            build_chain_service(&[chain(1, "https://a.example"), chain(1, "https://b.example")])
                .is_err()
        );
    }
}
