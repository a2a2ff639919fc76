use alloy::primitives::U256;
use engine_core::{chain::Chain, error::EngineError, transaction::FeeParams};

use crate::store::FeeOverride;

/// Resends pay at least this share of the previous attempt, in percent.
pub const RESEND_BUMP_PERCENT: u64 = 110;

/// Resends pay at least this multiple of the current network suggestion.
pub const NETWORK_MULTIPLIER: u64 = 2;

fn saturate(value: U256) -> u128 {
    u128::try_from(value).unwrap_or(u128::MAX)
}

/// `ceil(previous * 110 / 100)`, and at least `previous + 1`. Rounds up so
/// that the result is never below 110% of `previous`, which replacement rules
/// compare against exactly; the `+ 1` floor keeps zero and tiny fees moving.
pub fn bump(previous: u128) -> u128 {
    let numerator = U256::from(previous) * U256::from(RESEND_BUMP_PERCENT);
    let scaled = saturate((numerator + U256::from(99u64)) / U256::from(100u64));
    scaled.max(previous.saturating_add(1))
}

/// Fee field for a resend: `max(2 × network, 110% of previous)`.
pub fn escalate(previous: u128, network: u128) -> u128 {
    let doubled = saturate(U256::from(network) * U256::from(NETWORK_MULTIPLIER));
    doubled.max(bump(previous))
}

/// A caller-requested fee, raised to the replacement floor when it is below it.
pub fn floor_override(requested: u128, previous: u128, network: u128) -> u128 {
    requested.max(bump(previous)).max(network)
}

fn field(previous: u128, network: u128, requested: Option<u128>) -> u128 {
    match requested {
        Some(requested) => floor_override(requested, previous, network),
        None => escalate(previous, network),
    }
}

/// Computes fee parameters for first sends and fee-bumped resends.
#[derive(Debug, Clone, Copy, Default)]
pub struct GasPricingStrategy;

impl GasPricingStrategy {
    pub fn new() -> Self {
        Self
    }

    /// Network-suggested fees in the chain's fee model.
    pub async fn initial_fees<C: Chain>(&self, chain: &C) -> Result<FeeParams, EngineError> {
        match chain.estimate_eip1559_fees().await? {
            Some(fees) => Ok(FeeParams::Eip1559 {
                max_fee_per_gas: fees.max_fee_per_gas.max(fees.max_priority_fee_per_gas),
                max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            }),
            None => {
                tracing::debug!(chain_id = chain.chain_id(), "Chain has no EIP-1559 support, using legacy fees");
                Ok(FeeParams::Legacy {
                    gas_price: chain.get_gas_price().await?,
                })
            }
        }
    }

    /// Fees for replacing `previous`. Keeps the fee model of `previous`; every
    /// field ends up at or above both 110% of its previous value and the
    /// current network suggestion.
    pub async fn retry_fees<C: Chain>(
        &self,
        previous: &FeeParams,
        chain: &C,
        manual_override: Option<&FeeOverride>,
    ) -> Result<FeeParams, EngineError> {
        let requested = manual_override.copied().unwrap_or_default();

        let fees = match *previous {
            FeeParams::Legacy { gas_price } => {
                let network = chain.get_gas_price().await?;
                FeeParams::Legacy {
                    gas_price: field(gas_price, network, requested.gas_price),
                }
            }
            FeeParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let (network_max, network_priority) = match chain.estimate_eip1559_fees().await? {
                    Some(fees) => (fees.max_fee_per_gas, fees.max_priority_fee_per_gas),
                    None => {
                        let gas_price = chain.get_gas_price().await?;
                        (gas_price, gas_price)
                    }
                };

                let priority = field(
                    max_priority_fee_per_gas,
                    network_priority,
                    requested.max_priority_fee_per_gas,
                );
                let max_fee = field(max_fee_per_gas, network_max, requested.max_fee_per_gas);

                FeeParams::Eip1559 {
                    max_fee_per_gas: max_fee.max(priority),
                    max_priority_fee_per_gas: priority,
                }
            }
        };

        tracing::debug!(?previous, next = ?fees, "Escalated fees");
        Ok(fees)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_rounds_up() {
        assert_eq!(bump(100), 110);
        assert_eq!(bump(1), 2);
        assert_eq!(bump(0), 1);
        assert_eq!(bump(5), 6);
        assert_eq!(bump(1_000_000_001), 1_100_000_002);
    }

    #[test]
    fn escalation_takes_the_larger_floor() {
        // network doubled dominates
        assert_eq!(escalate(100, 80), 160);
        // previous bump dominates
        assert_eq!(escalate(1_000, 100), 1_100);
    }

    #[test]
    fn zero_fees_still_increase() {
        assert_eq!(escalate(0, 0), 1);
        assert_eq!(floor_override(0, 0, 0), 1);

        let mut fee = 0;
        for _ in 0..5 {
            let next = escalate(fee, 0);
            assert!(next > fee);
            fee = next;
        }
    }

    #[test]
    fn escalation_never_overflows() {
        assert_eq!(escalate(u128::MAX, u128::MAX), u128::MAX);
        assert!(escalate(u128::MAX / 2, 0) >= u128::MAX / 2);
    }

    #[test]
    fn override_below_floor_is_clamped() {
        assert_eq!(floor_override(50, 100, 10), 110);
        assert_eq!(floor_override(50, 100, 200), 200);
        assert_eq!(floor_override(500, 100, 200), 500);
    }

    #[test]
    fn every_escalation_meets_replacement_rules() {
        let samples = [0u128, 1, 7, 99, 100, 101, 12_345, 30_000_000_000, u64::MAX as u128];
        for previous in samples {
            for network in samples {
                let next = escalate(previous, network);
                assert!(next * 100 >= previous * 110, "{previous} -> {next}");
                assert!(next >= network);
            }
        }
    }
}
