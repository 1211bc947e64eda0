//! Forecast Expressions
//!
//! Declarative estimates of how large a process output will be and how long
//! an execution will run, both expressed as a function of the input size.
//! Forecasts are persisted as configuration text, so the grammar below is
//! a compatibility contract.
//!
//! # Grammar
//!
//! Size forecasts:
//! - `*<number>` - output is `<number>` times the input size (`*0.5`, `*2`)
//! - `<number><unit>` - fixed output size (`2m`, `512k`, `1.5g`)
//!
//! Duration forecasts:
//! - `<number><time unit>` - fixed duration (`30s`, `2h`)
//! - `<number><time unit>/[<count>]<size unit>` - duration per `<count>` units
//!   of input, scaled linearly (`2s/k`, `10min/500m`)
//!
//! Size units are `b`, `k`, `m`, `g`; time units are `s`, `min`, `h`, `d`.
//! Units are case-insensitive and whitespace around an expression is ignored.
//!
//! # Units
//!
//! Byte units are binary: one kilobyte is 1024 bytes.

pub mod duration;
pub mod size;

pub use duration::DurationForecast;
pub use size::{Factor, SizeForecast};

use thiserror::Error;

/// Bytes in one kilobyte.
pub const KILOBYTE: u64 = 1024;

/// Bytes in one megabyte.
pub const MEGABYTE: u64 = 1024 * KILOBYTE;

/// Bytes in one gigabyte.
pub const GIGABYTE: u64 = 1024 * MEGABYTE;

/// Size units, largest first.
const SIZE_UNITS: &[(&str, u64)] = &[("g", GIGABYTE), ("m", MEGABYTE), ("k", KILOBYTE), ("b", 1)];

/// Error returned when a forecast expression cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid {kind} forecast expression: '{expression}'")]
pub struct ForecastParseError {
    pub kind: &'static str,
    pub expression: String,
}

/// Returns the byte multiplier for a size unit.
pub(crate) fn size_unit(unit: &str) -> Option<u64> {
    let unit = unit.to_ascii_lowercase();
    SIZE_UNITS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, bytes)| *bytes)
}

/// Splits a leading unsigned decimal number from the rest of the expression.
///
/// The number is returned as text with at most one decimal point and at
/// least one digit.
pub(crate) fn split_number(expr: &str) -> Option<(&str, &str)> {
    let end = expr
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(expr.len());
    let (number, rest) = expr.split_at(end);

    let digits = number.chars().filter(char::is_ascii_digit).count();
    if digits == 0 || number.len() - digits > 1 {
        return None;
    }
    Some((number, rest))
}

/// Multiplies a decimal number by a whole unit, rounding half up.
///
/// Computed in integers so that every `u64` result is exact. Fraction digits
/// past the twentieth are ignored.
pub(crate) fn scale_decimal(number: &str, unit: u64) -> Option<u64> {
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if fraction.contains('.') {
        return None;
    }

    let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let fraction = &fraction[..fraction.len().min(20)];
    let scaled_fraction = if fraction.is_empty() {
        0
    } else {
        let digits: u128 = fraction.parse().ok()?;
        let denominator = 10u128.pow(fraction.len() as u32);
        (digits * u128::from(unit) + denominator / 2) / denominator
    };

    whole
        .checked_mul(unit)?
        .checked_add(u64::try_from(scaled_fraction).ok()?)
}

/// Parses `<number><size unit>` into a whole number of bytes.
///
/// Fractional results are rounded to the nearest byte.
pub fn parse_byte_size(expr: &str) -> Option<u64> {
    let (number, unit) = split_number(expr.trim())?;
    scale_decimal(number, size_unit(unit)?)
}

/// Formats a byte count with the largest unit that divides it exactly.
pub fn format_byte_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0b".to_string();
    }

    SIZE_UNITS
        .iter()
        .find(|(_, unit)| bytes % unit == 0)
        .map(|(name, unit)| format!("{}{}", bytes / unit, name))
        .unwrap_or_else(|| format!("{}b", bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_constants_are_binary() {
        assert_eq!(KILOBYTE, 1024);
        assert_eq!(MEGABYTE, 1_048_576);
        assert_eq!(GIGABYTE, 1_073_741_824);
    }

    #[test]
    fn test_size_unit_case_insensitive() {
        assert_eq!(size_unit("k"), Some(KILOBYTE));
        assert_eq!(size_unit("K"), Some(KILOBYTE));
        assert_eq!(size_unit("G"), Some(GIGABYTE));
        assert_eq!(size_unit("t"), None);
        assert_eq!(size_unit(""), None);
    }

    #[test]
    fn test_split_number() {
        assert_eq!(split_number("12k"), Some(("12", "k")));
        assert_eq!(split_number("1.5min"), Some(("1.5", "min")));
        assert_eq!(split_number(".5k"), Some((".5", "k")));
        assert_eq!(split_number("k"), None);
        assert_eq!(split_number(".k"), None);
        assert_eq!(split_number("-3k"), None);
        assert_eq!(split_number("1.2.3k"), None);
    }

    #[test]
    fn test_scale_decimal_is_exact() {
        assert_eq!(scale_decimal("1.5", KILOBYTE), Some(1536));
        assert_eq!(scale_decimal("0.75", MEGABYTE), Some(786_432));
        assert_eq!(scale_decimal("0.0005", KILOBYTE), Some(1));
        assert_eq!(scale_decimal("9007199254740993", 1), Some(9_007_199_254_740_993));
        assert_eq!(scale_decimal("18446744073709551615", 1), Some(u64::MAX));
        assert_eq!(scale_decimal("18446744073709551616", 1), None);
        assert_eq!(scale_decimal("17179869184", GIGABYTE), None);
    }

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("10g"), Some(10 * GIGABYTE));
        assert_eq!(parse_byte_size(" 1.5k "), Some(1536));
        assert_eq!(parse_byte_size("7b"), Some(7));
        assert_eq!(parse_byte_size("10"), None);
        assert_eq!(parse_byte_size("10x"), None);
    }

    #[test]
    fn test_byte_size_above_float_precision_roundtrips() {
        let bytes = (1u64 << 53) + 1;
        assert_eq!(parse_byte_size(&format_byte_size(bytes)), Some(bytes));
        assert_eq!(parse_byte_size(&format_byte_size(u64::MAX)), Some(u64::MAX));
    }

    #[test]
    fn test_format_byte_size_picks_largest_exact_unit() {
        assert_eq!(format_byte_size(0), "0b");
        assert_eq!(format_byte_size(2 * MEGABYTE), "2m");
        assert_eq!(format_byte_size(1536), "1536b");
        assert_eq!(format_byte_size(3 * GIGABYTE), "3g");
        assert_eq!(format_byte_size(1025), "1025b");
    }
}
