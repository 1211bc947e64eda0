//! Running Duration Forecast
//!
//! Estimates how long an execution will run, either as a fixed duration or
//! as a duration per amount of input data.

use std::fmt;
use std::num::NonZeroU64;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{format_byte_size, scale_decimal, size_unit, split_number, ForecastParseError};

/// Time units, largest first, in milliseconds.
const TIME_UNITS: &[(&str, u64)] = &[
    ("d", 86_400_000),
    ("h", 3_600_000),
    ("min", 60_000),
    ("s", 1_000),
];

/// Forecast of the running duration of an execution.
///
/// Durations are kept at millisecond precision so that every value
/// formats to an expression that parses back to the same forecast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DurationForecast {
    millis: u64,
    per_bytes: Option<NonZeroU64>,
}

impl DurationForecast {
    /// A duration independent of the input size.
    pub fn fixed(duration: Duration) -> Self {
        Self {
            millis: duration.as_millis().min(u64::MAX as u128) as u64,
            per_bytes: None,
        }
    }

    /// A duration for every `per_bytes` bytes of input.
    pub fn per_input(duration: Duration, per_bytes: NonZeroU64) -> Self {
        Self {
            per_bytes: Some(per_bytes),
            ..Self::fixed(duration)
        }
    }

    /// The base duration of this forecast.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.millis)
    }

    /// Amount of input the base duration applies to, if scaled.
    pub fn per_bytes(&self) -> Option<u64> {
        self.per_bytes.map(NonZeroU64::get)
    }

    /// Parses a duration forecast expression.
    ///
    /// Returns `None` for anything outside the grammar.
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use procrunner::forecast::{DurationForecast, KILOBYTE};
    ///
    /// let forecast = DurationForecast::parse("2s/k").unwrap();
    /// assert_eq!(forecast.expected_duration(10 * KILOBYTE), Duration::from_secs(20));
    /// ```
    pub fn parse(expr: &str) -> Option<Self> {
        let expr = expr.trim();
        let (time_part, size_part) = match expr.split_once('/') {
            Some((time, size)) => (time, Some(size)),
            None => (expr, None),
        };

        let (number, unit) = split_number(time_part)?;
        let millis = scale_decimal(number, time_unit(unit)?)?;

        let per_bytes = match size_part {
            Some(size) => Some(parse_per_size(size)?),
            None => None,
        };

        Some(Self {
            millis,
            per_bytes,
        })
    }

    /// Returns the canonical expression for this forecast.
    pub fn format(&self) -> String {
        let mut text = format_millis(self.millis);

        if let Some(per) = self.per_bytes {
            text.push('/');
            let size = format_byte_size(per.get());
            // A count of one is implied.
            match size.strip_prefix('1') {
                Some(unit) if unit.chars().all(|c| c.is_ascii_alphabetic()) => text.push_str(unit),
                _ => text.push_str(&size),
            }
        }

        text
    }

    /// Expected running duration for the given input size.
    pub fn expected_duration(&self, input_bytes: u64) -> Duration {
        let base = self.duration();
        match self.per_bytes {
            None => base,
            Some(per) => {
                let ratio = input_bytes as f64 / per.get() as f64;
                Duration::try_from_secs_f64(base.as_secs_f64() * ratio).unwrap_or(Duration::MAX)
            }
        }
    }
}

/// Returns the length of a time unit in milliseconds.
fn time_unit(unit: &str) -> Option<u64> {
    let unit = unit.to_ascii_lowercase();
    TIME_UNITS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, millis)| *millis)
}

/// Parses the `[<count>]<size unit>` divisor of a scaled forecast.
fn parse_per_size(expr: &str) -> Option<NonZeroU64> {
    let (count, unit) = if expr.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
        split_number(expr)?
    } else {
        ("1", expr)
    };

    NonZeroU64::new(scale_decimal(count, size_unit(unit)?)?)
}

/// Formats milliseconds with the largest time unit that divides them.
fn format_millis(millis: u64) -> String {
    if millis % 1_000 != 0 {
        let fraction = format!("{:03}", millis % 1_000);
        return format!("{}.{}s", millis / 1_000, fraction.trim_end_matches('0'));
    }

    if millis == 0 {
        return "0s".to_string();
    }

    TIME_UNITS
        .iter()
        .find(|(_, unit)| millis % unit == 0)
        .map(|(name, unit)| format!("{}{}", millis / unit, name))
        .unwrap_or_else(|| format!("{}s", millis / 1_000))
}

impl fmt::Display for DurationForecast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

impl FromStr for DurationForecast {
    type Err = ForecastParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| ForecastParseError {
            kind: "duration",
            expression: s.to_string(),
        })
    }
}

impl TryFrom<String> for DurationForecast {
    type Error = ForecastParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DurationForecast> for String {
    fn from(forecast: DurationForecast) -> Self {
        forecast.format()
    }
}
