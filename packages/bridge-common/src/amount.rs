//! Decimal amounts and cross-chain rescale
//!
//! Amounts are carried as arbitrary-precision decimals in the token's base units on each
//! chain. Moving an amount between chains whose token uses a different number of decimals
//! multiplies by `10^(target_decimals - source_decimals)` and rounds down to a whole target
//! base unit. The part lost to rounding is reported as `dust`, expressed in source units.

use bigdecimal::{BigDecimal, Zero};
use std::str::FromStr;
use thiserror::Error;

/// Largest decimals value accepted for a token
pub const MAX_DECIMALS: u8 = 36;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("invalid amount '{0}'")]
    Invalid(String),

    #[error("amount must not be negative: {0}")]
    Negative(String),

    #[error("decimals {0} exceeds maximum of {MAX_DECIMALS}")]
    DecimalsOutOfRange(u8),
}

/// Result of moving an amount to the target chain's precision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rescaled {
    /// Whole target base units
    pub target_amount: BigDecimal,
    /// Remainder dropped by rounding, in source base units
    pub dust: BigDecimal,
}

/// Parse a decimal amount string. Negative values are rejected.
pub fn parse_amount(s: &str) -> Result<BigDecimal, AmountError> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(AmountError::Invalid(s.to_string()));
    }
    let value = BigDecimal::from_str(trimmed).map_err(|_| AmountError::Invalid(s.to_string()))?;
    if value < BigDecimal::zero() {
        return Err(AmountError::Negative(s.to_string()));
    }
    Ok(value)
}

fn pow10(exp: i64) -> BigDecimal {
    // value = digits * 10^(-scale)
    BigDecimal::new(1.into(), -exp)
}

fn check_decimals(decimals: u8) -> Result<(), AmountError> {
    if decimals > MAX_DECIMALS {
        return Err(AmountError::DecimalsOutOfRange(decimals));
    }
    Ok(())
}

/// Rescale `amount` (source base units) to target base units
pub fn rescale(
    amount: &BigDecimal,
    source_decimals: u8,
    target_decimals: u8,
) -> Result<Rescaled, AmountError> {
    check_decimals(source_decimals)?;
    check_decimals(target_decimals)?;
    if *amount < BigDecimal::zero() {
        return Err(AmountError::Negative(amount.to_string()));
    }

    let diff = target_decimals as i64 - source_decimals as i64;
    let target_amount = (amount * pow10(diff)).with_scale(0);
    let back = &target_amount * pow10(-diff);
    let dust = (amount - back).normalized();

    Ok(Rescaled {
        target_amount,
        dust,
    })
}

/// Convert whole target base units back to source base units (exact)
pub fn unscale(
    target_amount: &BigDecimal,
    source_decimals: u8,
    target_decimals: u8,
) -> Result<BigDecimal, AmountError> {
    check_decimals(source_decimals)?;
    check_decimals(target_decimals)?;
    let diff = source_decimals as i64 - target_decimals as i64;
    Ok(target_amount * pow10(diff))
}
