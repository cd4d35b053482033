//! Exact arbitrary-precision decimal arithmetic and currency-tagged amounts.
//!
//! No binary float ever touches the pipeline: `Decimal` wraps `BigDecimal`
//! end to end, and the only place a value is truncated is the smallest-unit
//! conversion at the persistence boundary.

use bigdecimal::{BigDecimal, ToPrimitive};
use num_bigint::BigInt;
use num_traits::Signed;
use std::str::FromStr;
use thiserror::Error;

/// Uppercase ticker, e.g. `"BTC"`, `"USD"`. Currencies are process-global and
/// keyed by this string (§3 Currency).
pub type CurrencyTicker = String;

/// Minimum significant digits retained by division before truncation at a
/// currency's `decimals` boundary (§4.1).
const DIVISION_PRECISION: i64 = 38;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MoneyError {
    #[error("invalid decimal literal: {0}")]
    InvalidDecimal(String),
    #[error("currency mismatch: {lhs} vs {rhs}")]
    CurrencyMismatch { lhs: CurrencyTicker, rhs: CurrencyTicker },
    #[error("division by zero")]
    DivisionByZero,
}

/// Arbitrary-precision decimal. A thin newtype so call sites read as money
/// arithmetic rather than bigdecimal plumbing.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct Decimal(BigDecimal);

impl Decimal {
    pub fn zero() -> Self {
        Decimal(BigDecimal::from(0))
    }

    pub fn from_str(s: &str) -> Result<Self, MoneyError> {
        decimal_from_str(s)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == BigDecimal::from(0)
    }

    pub fn is_negative(&self) -> bool {
        self.0.sign() == bigdecimal::num_bigint::Sign::Minus
    }

    pub fn abs(&self) -> Self {
        abs(self)
    }

    pub fn neg(&self) -> Self {
        neg(self)
    }

    /// Convert to a signed arbitrary-precision integer of smallest units,
    /// truncating any precision beyond `decimals`.
    pub fn to_smallest_unit(&self, decimals: u32) -> BigInt {
        to_smallest_unit(self, decimals)
    }

    pub fn from_smallest_unit(amount: &BigInt, decimals: u32) -> Self {
        from_smallest_unit(amount, decimals)
    }
}

impl std::fmt::Display for Decimal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn decimal_from_str(s: &str) -> Result<Decimal, MoneyError> {
    BigDecimal::from_str(s.trim())
        .map(Decimal)
        .map_err(|_| MoneyError::InvalidDecimal(s.to_string()))
}

pub fn add(a: &Decimal, b: &Decimal) -> Decimal {
    Decimal(&a.0 + &b.0)
}

pub fn sub(a: &Decimal, b: &Decimal) -> Decimal {
    Decimal(&a.0 - &b.0)
}

pub fn mul(a: &Decimal, b: &Decimal) -> Decimal {
    Decimal(&a.0 * &b.0)
}

pub fn div(a: &Decimal, b: &Decimal) -> Result<Decimal, MoneyError> {
    if b.is_zero() {
        return Err(MoneyError::DivisionByZero);
    }
    Ok(Decimal(a.0.with_scale(DIVISION_PRECISION) / &b.0))
}

pub fn abs(a: &Decimal) -> Decimal {
    Decimal(a.0.abs())
}

pub fn neg(a: &Decimal) -> Decimal {
    Decimal(-a.0.clone())
}

pub fn compare(a: &Decimal, b: &Decimal) -> std::cmp::Ordering {
    a.0.cmp(&b.0)
}

/// Converts a decimal quantity into a signed arbitrary-precision integer of
/// `decimals` smallest units, truncating (not rounding) any extra precision.
/// This is the only truncation point permitted in the pipeline (§4.1).
pub fn to_smallest_unit(value: &Decimal, decimals: u32) -> BigInt {
    let scaled = (&value.0 * BigDecimal::from(10u64.pow(decimals))).with_scale(0);
    scaled
        .to_bigint()
        .unwrap_or_else(|| BigInt::from(scaled.to_i128().unwrap_or(0)))
}

pub fn from_smallest_unit(amount: &BigInt, decimals: u32) -> Decimal {
    let big = BigDecimal::new(amount.clone(), decimals as i64);
    Decimal(big)
}

/// A decimal quantity tagged with the currency it is denominated in.
/// Arithmetic between mismatched currencies fails with `CurrencyMismatch`.
#[derive(Debug, Clone, PartialEq)]
pub struct Money {
    pub amount: Decimal,
    pub currency: CurrencyTicker,
}

pub fn create_money(amount: Decimal, currency: CurrencyTicker) -> Money {
    Money { amount, currency }
}

impl Money {
    pub fn zero(currency: impl Into<CurrencyTicker>) -> Self {
        Money { amount: Decimal::zero(), currency: currency.into() }
    }

    fn check_currency(&self, other: &Money) -> Result<(), MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                lhs: self.currency.clone(),
                rhs: other.currency.clone(),
            });
        }
        Ok(())
    }

    pub fn add(&self, other: &Money) -> Result<Money, MoneyError> {
        self.check_currency(other)?;
        Ok(Money { amount: add(&self.amount, &other.amount), currency: self.currency.clone() })
    }

    pub fn sub(&self, other: &Money) -> Result<Money, MoneyError> {
        self.check_currency(other)?;
        Ok(Money { amount: sub(&self.amount, &other.amount), currency: self.currency.clone() })
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    pub fn to_smallest_unit(&self, decimals: u32) -> BigInt {
        self.amount.to_smallest_unit(decimals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_smallest_unit_within_precision() {
        let d = decimal_from_str("0.5").unwrap();
        let smallest = d.to_smallest_unit(8);
        assert_eq!(smallest, BigInt::from(50_000_000u64));
        let back = Decimal::from_smallest_unit(&smallest, 8);
        assert_eq!(compare(&back, &d), std::cmp::Ordering::Equal);
    }

    #[test]
    fn round_trip_is_exact_for_every_fractional_precision_up_to_decimals() {
        for literal in ["0", "1", "0.1", "0.12345678", "123456.78", "-42.00000001"] {
            let d = decimal_from_str(literal).unwrap();
            let smallest = d.to_smallest_unit(8);
            let back = Decimal::from_smallest_unit(&smallest, 8);
            assert_eq!(compare(&back, &d), std::cmp::Ordering::Equal, "failed for {literal}");
        }
    }

    #[test]
    fn mismatched_currency_arithmetic_fails() {
        let btc = create_money(decimal_from_str("1").unwrap(), "BTC".to_string());
        let usd = create_money(decimal_from_str("1").unwrap(), "USD".to_string());
        assert_eq!(
            btc.add(&usd),
            Err(MoneyError::CurrencyMismatch { lhs: "BTC".into(), rhs: "USD".into() })
        );
    }

    #[test]
    fn division_rounds_then_truncates_at_persistence_boundary() {
        let one = decimal_from_str("1").unwrap();
        let three = decimal_from_str("3").unwrap();
        let result = div(&one, &three).unwrap();
        // 38 significant digits of precision before any truncation happens.
        let smallest = result.to_smallest_unit(8);
        assert_eq!(smallest, BigInt::from(33_333_333u64));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let one = decimal_from_str("1").unwrap();
        assert_eq!(div(&one, &Decimal::zero()), Err(MoneyError::DivisionByZero));
    }
}
