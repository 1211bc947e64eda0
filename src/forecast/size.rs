//! Result Size Forecast
//!
//! Estimates the number of bytes an execution will produce.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{format_byte_size, parse_byte_size, split_number, ForecastParseError};

/// A finite, non-negative factor applied to an input size.
///
/// Only [`Factor::new`] builds one, so every factor formats to an
/// expression that parses back to the same value.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Factor(f64);

impl Factor {
    /// Returns `None` for negative, infinite or NaN values.
    pub fn new(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        // -0.0 would format as "-0"
        Some(Self(value + 0.0))
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

impl fmt::Display for Factor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Forecast of the output size of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SizeForecast {
    /// A fixed number of bytes, whatever the input.
    Absolute(u64),
    /// A factor applied to the input size.
    Multiplier(Factor),
}

impl SizeForecast {
    /// A multiplier forecast, or `None` if the factor is negative or not finite.
    pub fn multiplier(factor: f64) -> Option<Self> {
        Factor::new(factor).map(Self::Multiplier)
    }

    /// Parses a size forecast expression.
    ///
    /// Returns `None` for anything outside the grammar, never panics.
    ///
    /// # Example
    ///
    /// ```
    /// use procrunner::forecast::{SizeForecast, MEGABYTE};
    ///
    /// assert_eq!(SizeForecast::parse("2m"), Some(SizeForecast::Absolute(2 * MEGABYTE)));
    /// assert_eq!(SizeForecast::parse("*0.5"), SizeForecast::multiplier(0.5));
    /// assert_eq!(SizeForecast::parse("2 parsecs"), None);
    /// ```
    pub fn parse(expr: &str) -> Option<Self> {
        let expr = expr.trim();

        if let Some(factor) = expr.strip_prefix('*') {
            let (number, rest) = split_number(factor)?;
            if !rest.is_empty() {
                return None;
            }
            return Self::multiplier(number.parse().ok()?);
        }

        parse_byte_size(expr).map(Self::Absolute)
    }

    /// Returns the canonical expression for this forecast.
    pub fn format(&self) -> String {
        match self {
            Self::Absolute(bytes) => format_byte_size(*bytes),
            Self::Multiplier(factor) => format!("*{}", factor),
        }
    }

    /// Expected output size for the given input size.
    pub fn expected_bytes(&self, input_bytes: u64) -> u64 {
        match self {
            Self::Absolute(bytes) => *bytes,
            Self::Multiplier(factor) => (input_bytes as f64 * factor.get()).round() as u64,
        }
    }
}

impl fmt::Display for SizeForecast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

impl FromStr for SizeForecast {
    type Err = ForecastParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| ForecastParseError {
            kind: "size",
            expression: s.to_string(),
        })
    }
}

impl TryFrom<String> for SizeForecast {
    type Error = ForecastParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SizeForecast> for String {
    fn from(forecast: SizeForecast) -> Self {
        forecast.format()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::{GIGABYTE, KILOBYTE, MEGABYTE};

    #[test]
    fn test_parse_absolute() {
        assert_eq!(SizeForecast::parse("2m"), Some(SizeForecast::Absolute(2 * MEGABYTE)));
        assert_eq!(SizeForecast::parse("512K"), Some(SizeForecast::Absolute(512 * KILOBYTE)));
        assert_eq!(SizeForecast::parse("  3g\t"), Some(SizeForecast::Absolute(3 * GIGABYTE)));
        assert_eq!(SizeForecast::parse("100b"), Some(SizeForecast::Absolute(100)));
    }

    #[test]
    fn test_parse_multiplier() {
        assert_eq!(SizeForecast::parse("*0.5"), SizeForecast::multiplier(0.5));
        assert_eq!(SizeForecast::parse("*2"), SizeForecast::multiplier(2.0));
        assert_eq!(SizeForecast::parse(" *1.25 "), SizeForecast::multiplier(1.25));
    }

    #[test]
    fn test_only_finite_non_negative_factors_are_constructible() {
        assert_eq!(SizeForecast::multiplier(-1.0), None);
        assert_eq!(SizeForecast::multiplier(f64::NAN), None);
        assert_eq!(SizeForecast::multiplier(f64::INFINITY), None);
        assert_eq!(Factor::new(-0.0).map(|f| f.to_string()), Some("0".to_string()));
        assert_eq!(SizeForecast::parse("*.5"), SizeForecast::multiplier(0.5));
    }

    #[test]
    fn test_parse_malformed_returns_none() {
        for expr in ["", "*", "*x", "*2k", "m", "2", "2mb", "-2m", "2 m", "**2", "2m/k"] {
            assert_eq!(SizeForecast::parse(expr), None, "expression {:?}", expr);
        }
    }

    #[test]
    fn test_expected_bytes() {
        let absolute = SizeForecast::parse("2m").unwrap();
        assert_eq!(absolute.expected_bytes(10), 2 * MEGABYTE);

        let half = SizeForecast::parse("*0.5").unwrap();
        assert_eq!(half.expected_bytes(20 * GIGABYTE), 10 * GIGABYTE);
    }

    #[test]
    fn test_format_roundtrip() {
        let mut forecasts = vec![
            SizeForecast::Absolute(0),
            SizeForecast::Absolute(1),
            SizeForecast::Absolute(1536),
            SizeForecast::Absolute(7 * GIGABYTE),
            SizeForecast::Absolute((1 << 53) + 1),
            SizeForecast::Absolute(u64::MAX),
        ];
        for factor in [0.0, 0.1, 3.0, 123456.789, 1e-9, 1e300] {
            forecasts.push(SizeForecast::multiplier(factor).unwrap());
        }

        for forecast in forecasts {
            let text = forecast.format();
            assert_eq!(SizeForecast::parse(&text), Some(forecast), "text {:?}", text);
        }
    }

    #[test]
    fn test_reparse_of_parsed_expression_is_stable() {
        for expr in ["1.5k", "*0.33", "0.75m", "10G"] {
            let parsed = SizeForecast::parse(expr).unwrap();
            assert_eq!(SizeForecast::parse(&parsed.format()), Some(parsed));
        }
    }

    #[test]
    fn test_serde_uses_expression_text() {
        let forecast: SizeForecast = serde_json::from_str("\"*1.5\"").unwrap();
        assert_eq!(Some(forecast), SizeForecast::multiplier(1.5));
        assert_eq!(serde_json::to_string(&forecast).unwrap(), "\"*1.5\"");
        assert!(serde_json::from_str::<SizeForecast>("\"lots\"").is_err());
    }
}
