//! Currency arithmetic
//!
//! Balances are fixed-point values with two decimal places. Every value that
//! enters the ledger goes through [`round_currency`] so cached and durable
//! balances never drift apart by sub-cent amounts.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::domain::result::Error;

/// Number of decimal places kept for balances and deltas
pub const CURRENCY_SCALE: u32 = 2;

/// Round a value to currency precision (banker's rounding, same as the durable store)
pub fn round_currency(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(CURRENCY_SCALE, RoundingStrategy::MidpointNearestEven);
    rounded.rescale(CURRENCY_SCALE);
    rounded
}

/// Largest balance the durable schema can hold (`DECIMAL(18, 2)`)
pub const MAX_BALANCE: Decimal = Decimal::from_parts(0xA763_FFFF, 0x0DE0_B6B3, 0, false, CURRENCY_SCALE);

/// Why a delta could not be applied to a balance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyRejection {
    /// The result would be negative
    Insufficient,
    /// The result would exceed [`MAX_BALANCE`]
    OutOfRange,
}

impl ApplyRejection {
    /// Error a balance store reports for this rejection
    pub fn into_error(self, balance: Decimal, delta: Decimal) -> Error {
        match self {
            Self::Insufficient => Error::InsufficientFunds { balance, delta },
            Self::OutOfRange => Error::validation(format!(
                "Balance {} plus {} exceeds the largest storable balance",
                balance, delta
            )),
        }
    }
}

/// Add a signed delta to a balance, returning the rounded result
pub fn checked_apply(balance: Decimal, delta: Decimal) -> Result<Decimal, ApplyRejection> {
    let next = round_currency(balance)
        .checked_add(round_currency(delta))
        .map(round_currency)
        .ok_or(ApplyRejection::OutOfRange)?;
    if next.is_zero() {
        // normalizes -0.00
        return Ok(round_currency(Decimal::ZERO));
    }
    if next.is_sign_negative() {
        Err(ApplyRejection::Insufficient)
    } else if next > MAX_BALANCE {
        Err(ApplyRejection::OutOfRange)
    } else {
        Ok(next)
    }
}
