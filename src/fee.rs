//! Fee and balance arithmetic
//!
//! Amounts are exact integers in hydro (10^-18 of the native token).
//! Exact values are kept as decimal strings; the f64 form is for display.

use alloy_primitives::U256;

/// Number of hydro per native token.
const HYDRO_PER_TOKEN: f64 = 1e18;

/// Calculate the total fee paid for a transaction.
///
/// Fee = gas_price * gas_used, saturating at U256::MAX.
pub fn calculate_fee(gas_price: U256, gas_used: U256) -> U256 {
    gas_price.saturating_mul(gas_used)
}

/// Fee of a transaction as an exact decimal string.
pub fn fee_string(gas_price: U256, gas_used: U256) -> String {
    calculate_fee(gas_price, gas_used).to_string()
}

/// Scale an amount in hydro to whole tokens.
///
/// Lossy: only meant for display and sorting.
pub fn hydro_to_float(amount: U256) -> f64 {
    // Parsing the decimal form keeps amounts beyond u128 finite.
    amount.to_string().parse::<f64>().unwrap_or(f64::MAX) / HYDRO_PER_TOKEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_of_two_gwei_units() {
        assert_eq!(fee_string(U256::from(2), U256::from(21000)), "42000");
    }

    #[test]
    fn test_fee_is_exact_beyond_f64_precision() {
        let price = U256::from(20_000_000_000u64); // 20 gwei
        let fee = fee_string(price, U256::from(21_000_001u64));
        assert_eq!(fee, "420000020000000000");
    }

    #[test]
    fn test_fee_saturates() {
        assert_eq!(calculate_fee(U256::MAX, U256::from(2)), U256::MAX);
    }

    #[test]
    fn test_hydro_to_float() {
        assert_eq!(hydro_to_float(U256::ZERO), 0.0);
        assert_eq!(hydro_to_float(U256::from(10u64.pow(18))), 1.0);
        assert_eq!(hydro_to_float(U256::from(5u64 * 10u64.pow(17))), 0.5);
    }
}
