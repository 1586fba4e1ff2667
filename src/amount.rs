use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use thiserror::Error;

/// Errors produced when parsing an [`Amount`] from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("invalid amount '{0}'")]
    Invalid(String),

    #[error("amount has too many decimal places (max {max}, got {provided})", max = Amount::DECIMALS)]
    TooManyDecimals { provided: u32 },

    #[error("amount '{0}' is out of range")]
    Overflow(String),
}

/// Fixed-point decimal with 2 decimal places, stored as a scaled integer.
///
/// Balances are never negative; negative values only appear as deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(i64);

impl Amount {
    const SCALE: i64 = 100;
    pub const DECIMALS: u32 = 2;
    pub const ZERO: Amount = Amount(0);

    pub fn from_minor(value: i64) -> Self {
        Amount(value)
    }

    /// Build an amount from whole units, e.g. `Amount::from_units(1000)` is `1000.00`.
    pub fn from_units(value: i64) -> Self {
        Amount(value * Self::SCALE)
    }

    pub fn minor(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Amount)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / Self::SCALE as u64;
        let frac = abs % Self::SCALE as u64;
        write!(f, "{sign}{whole}.{frac:02}")
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let value = Decimal::from_str(s).map_err(|_| AmountError::Invalid(s.to_string()))?;

        // "1.500" is fine, "1.005" is not
        let scale = value.normalize().scale();
        if scale > Self::DECIMALS {
            return Err(AmountError::TooManyDecimals { provided: scale });
        }

        value
            .checked_mul(Decimal::from(Self::SCALE))
            .and_then(|scaled| scaled.to_i64())
            .map(Amount)
            .ok_or_else(|| AmountError::Overflow(s.to_string()))
    }
}

impl std::ops::Add for Amount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Amount(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Amount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Amount(self.0 - rhs.0)
    }
}

impl std::ops::Neg for Amount {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Amount(-self.0)
    }
}

impl std::ops::AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, |acc, amount| acc + amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<Amount, AmountError> {
        s.parse()
    }

    #[test]
    fn from_minor_preserves_value() {
        let amount = Amount::from_minor(123456);
        assert_eq!(amount, Amount(123456));
        assert_eq!(amount.minor(), 123456);
    }

    #[test]
    fn from_units_scales() {
        assert_eq!(Amount::from_units(1000), Amount::from_minor(100_000));
    }

    #[test]
    fn parse_converts_correctly() {
        assert_eq!(parse("250.00").unwrap(), Amount::from_minor(25_000));
        assert_eq!(parse("1.5").unwrap(), Amount::from_minor(150));
        assert_eq!(parse("0.01").unwrap(), Amount::from_minor(1));
        assert_eq!(parse("100").unwrap(), Amount::from_minor(10_000));
        assert_eq!(parse(" 7.25 ").unwrap(), Amount::from_minor(725));
    }

    #[test]
    fn parse_accepts_trailing_zeros() {
        assert_eq!(parse("1.500").unwrap(), Amount::from_minor(150));
    }

    #[test]
    fn parse_rejects_excess_precision() {
        assert_eq!(
            parse("1.005"),
            Err(AmountError::TooManyDecimals { provided: 3 })
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(parse("abc"), Err(AmountError::Invalid(_))));
        assert!(matches!(parse(""), Err(AmountError::Invalid(_))));
    }

    #[test]
    fn parse_rejects_out_of_range() {
        assert!(matches!(
            parse("999999999999999999999"),
            Err(AmountError::Overflow(_))
        ));
    }

    #[test]
    fn parse_handles_negative() {
        assert_eq!(parse("-50.25").unwrap(), Amount::from_minor(-5025));
    }

    #[test]
    fn decimal_sums_stay_exact() {
        let third: Amount = parse("0.33").unwrap();
        let total: Amount = [third, third, third].into_iter().sum();
        assert_eq!(total, parse("0.99").unwrap());
    }

    #[test]
    fn display_formats_positive() {
        assert_eq!(Amount::from_minor(100_000).to_string(), "1000.00");
        assert_eq!(Amount::from_minor(150).to_string(), "1.50");
        assert_eq!(Amount::from_minor(1).to_string(), "0.01");
        assert_eq!(Amount::from_minor(0).to_string(), "0.00");
    }

    #[test]
    fn display_formats_negative() {
        assert_eq!(Amount::from_minor(-5025).to_string(), "-50.25");
        assert_eq!(Amount::from_minor(-1).to_string(), "-0.01");
    }

    #[test]
    fn default_is_zero() {
        assert_eq!(Amount::default(), Amount::ZERO);
    }

    #[test]
    fn arithmetic() {
        let mut a = Amount::from_minor(100);
        a += Amount::from_minor(50);
        assert_eq!(a, Amount::from_minor(150));
        a -= Amount::from_minor(30);
        assert_eq!(a, Amount::from_minor(120));
        assert_eq!(-a, Amount::from_minor(-120));
        assert_eq!(a - Amount::from_minor(20), Amount::from_minor(100));
    }

    #[test]
    fn checked_arithmetic_detects_overflow() {
        let max = Amount::from_minor(i64::MAX);
        assert_eq!(max.checked_add(Amount::from_minor(1)), None);
        assert_eq!(
            Amount::from_minor(5).checked_sub(Amount::from_minor(7)),
            Some(Amount::from_minor(-2))
        );
    }

    #[test]
    fn sign_predicates() {
        assert!(Amount::from_minor(1).is_positive());
        assert!(!Amount::ZERO.is_positive());
        assert!(Amount::from_minor(-1).is_negative());
        assert!(!Amount::ZERO.is_negative());
    }
}
