//! Currency arithmetic in BRL.
//!
//! The database stores integer cents; everything above it works with
//! [`Decimal`] at two decimal places. Conversions refuse sub-cent input
//! instead of silently rounding it away.

use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};

use crate::errors::{LedgerError, Result};

/// Smallest withdrawal the platform will pay out (R$ 10.00).
pub const MIN_WITHDRAWAL_AMOUNT: Decimal = Decimal::from_parts(1000, 0, 0, false, 2);

/// Share of each withdrawal kept by the platform (10%).
pub const PLATFORM_FEE_RATE: Decimal = Decimal::from_parts(10, 0, 0, false, 2);

/// Donation bounds, in cents (R$ 2.00 – R$ 1,000.00).
pub const MIN_DONATION_CENTS: i64 = 200;
pub const MAX_DONATION_CENTS: i64 = 100_000;

/// Convert a currency amount to cents. Fails with [`LedgerError::InvalidAmount`]
/// for values with more than two decimal places or outside the `i64` range.
pub fn to_cents(amount: Decimal) -> Result<i64> {
    let normalized = amount.normalize();
    if normalized.scale() > 2 {
        return Err(LedgerError::InvalidAmount);
    }
    let cents = normalized
        .checked_mul(Decimal::ONE_HUNDRED)
        .ok_or(LedgerError::InvalidAmount)?;
    i64::try_from(cents).map_err(|_| LedgerError::InvalidAmount)
}

pub fn from_cents(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

/// Read a JSON number as an amount, keeping the digits as written
/// (`10.05` stays `10.05`, not the nearest binary fraction).
pub fn amount_from_f64(value: f64) -> Result<Decimal> {
    if !value.is_finite() {
        return Err(LedgerError::InvalidAmount);
    }
    Decimal::from_str(&value.to_string()).map_err(|_| LedgerError::InvalidAmount)
}

/// Read an amount sent as a JSON string, e.g. `"100.00"`.
pub fn amount_from_str(value: &str) -> Result<Decimal> {
    let value = value.trim();
    Decimal::from_str(value)
        .or_else(|_| Decimal::from_scientific(value))
        .map_err(|_| LedgerError::InvalidAmount)
}

/// Gross/fee/net breakdown of a withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplit {
    pub gross: Decimal,
    pub fee: Decimal,
    pub net: Decimal,
}

impl FeeSplit {
    /// Fee is rounded half-up to the cent; `net` absorbs the remainder so
    /// that `gross == fee + net` always holds exactly.
    pub fn from_gross(gross: Decimal) -> Self {
        let fee = (gross * PLATFORM_FEE_RATE)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        FeeSplit {
            gross,
            fee,
            net: gross - fee,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn constants() {
        assert_eq!(MIN_WITHDRAWAL_AMOUNT, dec!(10.00));
        assert_eq!(PLATFORM_FEE_RATE, dec!(0.10));
    }

    #[test]
    fn fee_on_round_amount() {
        let split = FeeSplit::from_gross(dec!(100.00));
        assert_eq!(split.fee, dec!(10.00));
        assert_eq!(split.net, dec!(90.00));
    }

    #[test]
    fn fee_rounds_half_up() {
        // 10.05 * 0.10 = 1.005 -> 1.01
        let split = FeeSplit::from_gross(dec!(10.05));
        assert_eq!(split.fee, dec!(1.01));
        assert_eq!(split.net, dec!(9.04));

        // 10.04 * 0.10 = 1.004 -> 1.00
        let split = FeeSplit::from_gross(dec!(10.04));
        assert_eq!(split.fee, dec!(1.00));
        assert_eq!(split.net, dec!(9.04));
    }

    #[test]
    fn gross_is_always_fee_plus_net() {
        for cents in [1000_i64, 1001, 1015, 2999, 12345, 99999] {
            let split = FeeSplit::from_gross(from_cents(cents));
            assert_eq!(split.fee + split.net, split.gross);
        }
    }

    #[test]
    fn cents_conversion() {
        assert_eq!(to_cents(dec!(10.00)).unwrap(), 1000);
        assert_eq!(to_cents(dec!(9.99)).unwrap(), 999);
        assert_eq!(to_cents(dec!(12.5)).unwrap(), 1250);
        assert_eq!(to_cents(dec!(7)).unwrap(), 700);
        assert_eq!(from_cents(1250), dec!(12.50));
    }

    #[test]
    fn json_numbers_keep_their_digits() {
        assert_eq!(amount_from_f64(10.05).unwrap(), dec!(10.05));
        assert_eq!(amount_from_f64(9.99).unwrap(), dec!(9.99));
        assert_eq!(amount_from_f64(100.0).unwrap(), dec!(100));
        assert!(amount_from_f64(f64::NAN).is_err());
    }

    #[test]
    fn string_amounts_are_parsed() {
        assert_eq!(amount_from_str("100.00").unwrap(), dec!(100.00));
        assert_eq!(amount_from_str(" 10.05 ").unwrap(), dec!(10.05));
        assert_eq!(amount_from_str("1e2").unwrap(), dec!(100));
        assert!(matches!(amount_from_str("cem reais"), Err(LedgerError::InvalidAmount)));
        assert!(matches!(amount_from_str(""), Err(LedgerError::InvalidAmount)));
    }

    #[test]
    fn huge_amounts_are_rejected() {
        let huge = amount_from_f64(1e27).unwrap();
        assert!(matches!(to_cents(huge), Err(LedgerError::InvalidAmount)));
        assert!(matches!(to_cents(Decimal::MAX), Err(LedgerError::InvalidAmount)));
        // fits in Decimal but not in i64 cents
        assert!(matches!(to_cents(Decimal::from(10_i64.pow(18))), Err(LedgerError::InvalidAmount)));
    }

    #[test]
    fn sub_cent_amounts_are_rejected() {
        assert!(matches!(to_cents(dec!(10.005)), Err(LedgerError::InvalidAmount)));
        // trailing zeros beyond the cent are fine
        assert_eq!(to_cents(dec!(10.1000)).unwrap(), 1010);
    }
}
