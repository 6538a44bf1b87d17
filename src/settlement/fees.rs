use serde::Serialize;

use crate::error::ReimbursementError;

pub const MAX_FEE_BPS: u16 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeSplit {
    pub protocol_fee: u64,
    pub service_fee: u64,
}

/// Floor of `gas_cost * bps / 10000`, computed in u128 so it cannot overflow.
pub fn bps_of(gas_cost: u64, bps: u16) -> u64 {
    (gas_cost as u128 * bps as u128 / MAX_FEE_BPS as u128) as u64
}

/// Splits the observed fee. The floor remainder stays with the treasury.
/// The two rates together may not exceed 100%, which keeps the sum within `gas_cost`.
pub fn compute_fee_split(
    gas_cost: u64,
    protocol_fee_bps: u16,
    service_fee_bps: u16,
) -> Result<FeeSplit, ReimbursementError> {
    if protocol_fee_bps as u32 + service_fee_bps as u32 > MAX_FEE_BPS as u32 {
        return Err(ReimbursementError::InvalidFeeConfig(format!(
            "protocol {} bps + service {} bps exceeds {}",
            protocol_fee_bps, service_fee_bps, MAX_FEE_BPS
        )));
    }

    Ok(FeeSplit {
        protocol_fee: bps_of(gas_cost, protocol_fee_bps),
        service_fee: bps_of(gas_cost, service_fee_bps),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_example() {
        let split = compute_fee_split(5_000, 250, 100).unwrap();
        assert_eq!(split.protocol_fee, 125);
        assert_eq!(split.service_fee, 50);
    }

    #[test]
    fn test_floor_division() {
        // 4_999 * 250 / 10000 = 124.975
        let split = compute_fee_split(4_999, 250, 1).unwrap();
        assert_eq!(split.protocol_fee, 124);
        assert_eq!(split.service_fee, 0);
    }

    #[test]
    fn test_sum_never_exceeds_gas_cost() {
        for gas_cost in [0u64, 1, 7, 5_000, 4_200_000, u64::MAX] {
            for (p, s) in [(0u16, 0u16), (250, 100), (5_000, 5_000), (9_999, 1), (10_000, 0)] {
                let split = compute_fee_split(gas_cost, p, s).unwrap();
                assert!(split.protocol_fee as u128 + split.service_fee as u128 <= gas_cost as u128);
            }
        }
    }

    #[test]
    fn test_rates_above_one_hundred_percent_rejected() {
        assert!(matches!(
            compute_fee_split(5_000, 6_000, 5_000),
            Err(ReimbursementError::InvalidFeeConfig(_))
        ));
    }
}
