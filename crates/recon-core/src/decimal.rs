//! Exact decimal helpers for quantity arithmetic.
//!
//! Uses `rust_decimal` throughout, avoiding floating-point drift when
//! quantities are divided between positions.

use crate::error::{CoreError, CoreResult};
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

/// Round `value` down (toward negative infinity) to `precision` decimal places.
#[inline]
pub fn floor_to(value: Decimal, precision: u32) -> Decimal {
    value.round_dp_with_strategy(precision, RoundingStrategy::ToNegativeInfinity)
}

/// Split `amount` into `n` shares at `precision` decimal places.
///
/// Every share is `floor(amount / n, precision)`; whatever remains after
/// that is added to the first share, so the shares always sum to `amount`
/// exactly and every share after the first is equal.
///
/// Returns an empty vector when `n == 0`.
pub fn split(n: usize, amount: Decimal, precision: u32) -> Vec<Decimal> {
    if n == 0 {
        return Vec::new();
    }
    let count = Decimal::from(n as u64);
    let share = floor_to(amount / count, precision);
    let remainder = amount - share * count;

    let mut shares = vec![share; n];
    shares[0] += remainder;
    shares
}

/// Parse a decimal from a string field, naming the field on failure.
pub fn parse_decimal(field: &str, raw: &str) -> CoreResult<Decimal> {
    Decimal::from_str(raw.trim()).map_err(|e| CoreError::InvalidDecimal {
        field: field.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a decimal that may arrive as a JSON string or a JSON number.
pub fn decimal_from_json(field: &str, value: &serde_json::Value) -> CoreResult<Decimal> {
    match value {
        serde_json::Value::String(s) => parse_decimal(field, s),
        serde_json::Value::Number(n) => parse_decimal(field, &n.to_string()),
        other => Err(CoreError::InvalidDecimal {
            field: field.to_string(),
            value: other.to_string(),
            reason: "not a number".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_split_remainder_goes_to_first() {
        assert_eq!(
            split(3, dec!(10.00), 2),
            vec![dec!(3.34), dec!(3.33), dec!(3.33)]
        );
    }

    #[test]
    fn test_split_even() {
        assert_eq!(
            split(3, dec!(10.05), 2),
            vec![dec!(3.35), dec!(3.35), dec!(3.35)]
        );
    }

    #[test]
    fn test_split_sums_exactly() {
        let cases = [
            (7, dec!(1), 9),
            (4, dec!(0.000000003), 9),
            (3, dec!(100), 0),
            (6, dec!(17.123456789), 9),
        ];
        for (n, amount, precision) in cases {
            let shares = split(n, amount, precision);
            assert_eq!(shares.len(), n);
            assert_eq!(shares.iter().copied().sum::<Decimal>(), amount);
            assert!(shares[1..].iter().all(|s| *s == shares[1]));
        }
    }

    #[test]
    fn test_split_whole_units() {
        assert_eq!(split(3, dec!(10), 0), vec![dec!(4), dec!(3), dec!(3)]);
    }

    #[test]
    fn test_split_zero_parts() {
        assert!(split(0, dec!(5), 2).is_empty());
    }

    #[test]
    fn test_floor_to() {
        assert_eq!(floor_to(dec!(1.999), 2), dec!(1.99));
        assert_eq!(floor_to(dec!(-1.001), 2), dec!(-1.01));
    }

    #[test]
    fn test_decimal_from_json() {
        let v = serde_json::json!("0.015");
        assert_eq!(decimal_from_json("qty", &v).unwrap(), dec!(0.015));

        let v = serde_json::json!(12.5);
        assert_eq!(decimal_from_json("qty", &v).unwrap(), dec!(12.5));

        let v = serde_json::json!("abc");
        assert!(decimal_from_json("qty", &v).is_err());

        let v = serde_json::json!(null);
        assert!(decimal_from_json("qty", &v).is_err());
    }
}
