//! Exact decimal numeric type backed by rust_decimal.
//!
//! All money and quantity math in the daemon goes through this wrapper;
//! threshold comparisons are exact to the decimal's precision. Formatting
//! never produces exponent notation.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal as RustDecimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::str::FromStr;

/// Exact decimal for collateral amounts, quantities, and prices.
///
/// Backed by rust_decimal to avoid floating-point drift. Serializes to a
/// JSON number.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Decimal(#[serde(with = "rust_decimal::serde::float")] RustDecimal);

impl Decimal {
    pub const ZERO: Decimal = Decimal(RustDecimal::ZERO);
    pub const ONE: Decimal = Decimal(RustDecimal::ONE);
    pub const ONE_HUNDRED: Decimal = Decimal(RustDecimal::ONE_HUNDRED);

    pub fn new(value: RustDecimal) -> Self {
        Decimal(value)
    }

    /// Parse from a decimal string.
    ///
    /// # Errors
    /// Returns an error if the string is not a valid decimal number.
    pub fn parse(s: &str) -> Result<Self, rust_decimal::Error> {
        RustDecimal::from_str(s).map(Decimal)
    }

    /// Convert from an f64 policy value (risk weights, config ratios).
    ///
    /// Values that cannot be represented (NaN, infinities) fall back to 1.
    pub fn from_f64_lossy(value: f64) -> Self {
        RustDecimal::from_f64(value).map(Decimal).unwrap_or(Decimal::ONE)
    }

    /// Format without exponent notation and without trailing zeros.
    pub fn to_canonical_string(&self) -> String {
        format!("{}", self.0.normalize())
    }

    pub fn inner(&self) -> RustDecimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        !self.is_zero() && self.0.is_sign_positive()
    }

    pub fn is_negative(&self) -> bool {
        !self.is_zero() && self.0.is_sign_negative()
    }

    pub fn abs(&self) -> Self {
        Decimal(self.0.abs())
    }

    pub fn min(self, other: Self) -> Self {
        Decimal(self.0.min(other.0))
    }

    pub fn max(self, other: Self) -> Self {
        Decimal(self.0.max(other.0))
    }

    /// Best-effort conversion to f64 for logging and policy math.
    pub fn to_f64_lossy(&self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.0.to_f64().unwrap_or(0.0)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

impl FromStr for Decimal {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<RustDecimal> for Decimal {
    fn from(value: RustDecimal) -> Self {
        Decimal(value)
    }
}

impl From<Decimal> for RustDecimal {
    fn from(value: Decimal) -> Self {
        value.0
    }
}

impl From<u32> for Decimal {
    fn from(value: u32) -> Self {
        Decimal(RustDecimal::from(value))
    }
}

impl std::ops::Add for Decimal {
    type Output = Decimal;

    fn add(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for Decimal {
    fn add_assign(&mut self, rhs: Decimal) {
        self.0 += rhs.0;
    }
}

impl std::ops::Sub for Decimal {
    type Output = Decimal;

    fn sub(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 - rhs.0)
    }
}

impl std::ops::SubAssign for Decimal {
    fn sub_assign(&mut self, rhs: Decimal) {
        self.0 -= rhs.0;
    }
}

impl std::ops::Mul for Decimal {
    type Output = Decimal;

    fn mul(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 * rhs.0)
    }
}

impl std::ops::Div for Decimal {
    type Output = Decimal;

    fn div(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 / rhs.0)
    }
}

impl std::ops::Neg for Decimal {
    type Output = Decimal;

    fn neg(self) -> Decimal {
        Decimal(-self.0)
    }
}

impl Sum for Decimal {
    fn sum<I: Iterator<Item = Decimal>>(iter: I) -> Decimal {
        iter.fold(Decimal::ZERO, |acc, d| acc + d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::parse(s).unwrap()
    }

    #[test]
    fn parse_and_format_roundtrip() {
        for s in ["123.456", "0.0001", "-72.13", "0", "50000"] {
            let d = dec(s);
            assert_eq!(Decimal::parse(&d.to_canonical_string()).unwrap(), d);
        }
    }

    #[test]
    fn canonical_format_has_no_exponent() {
        let d = dec("1000000");
        assert!(!d.to_canonical_string().contains('e'));
        assert_eq!(d.to_canonical_string(), "1000000");
    }

    #[test]
    fn arithmetic_is_exact() {
        assert_eq!(dec("400") - dec("327.87"), dec("72.13"));
        assert_eq!(dec("0.5") * dec("50000"), dec("25000"));
        assert_eq!(dec("5") / dec("2"), dec("2.5"));
        assert_eq!(-dec("72.13"), dec("-72.13"));
    }

    #[test]
    fn sign_predicates() {
        assert!(dec("0.01").is_positive());
        assert!(dec("-0.01").is_negative());
        assert!(Decimal::ZERO.is_zero());
        assert!(!Decimal::ZERO.is_positive());
        assert!(!Decimal::ZERO.is_negative());
    }

    #[test]
    fn sum_over_iterator() {
        let total: Decimal = [dec("1.1"), dec("2.2"), dec("3.3")].into_iter().sum();
        assert_eq!(total, dec("6.6"));
    }

    #[test]
    fn from_f64_lossy_handles_non_finite() {
        assert_eq!(Decimal::from_f64_lossy(1.5), dec("1.5"));
        assert_eq!(Decimal::from_f64_lossy(f64::NAN), Decimal::ONE);
    }

    #[test]
    fn min_max_clamp() {
        assert_eq!(dec("3").min(dec("2")), dec("2"));
        assert_eq!(dec("3").max(dec("2")), dec("3"));
    }

    #[test]
    fn serializes_as_json_number() {
        let json = serde_json::to_value(dec("123.456")).unwrap();
        assert!(json.is_number());
    }
}
