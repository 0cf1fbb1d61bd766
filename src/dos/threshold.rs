//! Threshold expressions.
//!
//! A threshold is written as `<rate> r/<unit>, <period>`, for example
//! `"2 r/s, 5m"`: two requests per second are tolerated, and a client that
//! goes over is blocked for five minutes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ParseError;

/// The unit a request rate is measured in.
///
/// The unit also fixes the length of the rolling window used to count
/// requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateUnit {
    /// Requests per second (`r/s`)
    Second,
    /// Requests per minute (`r/m`)
    Minute,
    /// Requests per hour (`r/h`)
    Hour,
}

impl RateUnit {
    /// Get the duration of the window this unit is measured over.
    pub fn duration(&self) -> Duration {
        match self {
            RateUnit::Second => Duration::from_secs(1),
            RateUnit::Minute => Duration::from_secs(60),
            RateUnit::Hour => Duration::from_secs(3600),
        }
    }

    /// The suffix used after `r/` in threshold expressions.
    pub fn suffix(&self) -> char {
        match self {
            RateUnit::Second => 's',
            RateUnit::Minute => 'm',
            RateUnit::Hour => 'h',
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "s" => Some(RateUnit::Second),
            "m" => Some(RateUnit::Minute),
            "h" => Some(RateUnit::Hour),
            _ => None,
        }
    }
}

/// A request rate limit and the blocking period applied once it is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Threshold {
    request_rate: u32,
    unit: RateUnit,
    blocking_period: Duration,
}

impl Threshold {
    /// One request per second, fifteen minutes of blocking.
    pub const DEFAULT: Threshold = Threshold {
        request_rate: 1,
        unit: RateUnit::Second,
        blocking_period: Duration::from_secs(15 * 60),
    };

    /// Create a threshold, rejecting a zero rate or a zero blocking period.
    pub fn new(
        request_rate: u32,
        unit: RateUnit,
        blocking_period: Duration,
    ) -> Result<Self, ParseError> {
        if request_rate == 0 {
            return Err(ParseError::new("0", "request rate must be positive"));
        }
        if blocking_period.is_zero() {
            return Err(ParseError::new(
                format_duration(blocking_period),
                "blocking period must be positive",
            ));
        }
        Ok(Self {
            request_rate,
            unit,
            blocking_period,
        })
    }

    /// Requests tolerated per [`unit`](Self::unit).
    pub fn request_rate(&self) -> u32 {
        self.request_rate
    }

    /// The unit the rate is measured in.
    pub fn unit(&self) -> RateUnit {
        self.unit
    }

    /// The length of the window requests are counted over.
    pub fn window(&self) -> Duration {
        self.unit.duration()
    }

    /// How long a client stays blocked after crossing the threshold.
    pub fn blocking_period(&self) -> Duration {
        self.blocking_period
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} r/{}, {}",
            self.request_rate,
            self.unit.suffix(),
            format_duration(self.blocking_period)
        )
    }
}

impl FromStr for Threshold {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_threshold(s)
    }
}

impl TryFrom<String> for Threshold {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse_threshold(&value)
    }
}

impl From<Threshold> for String {
    fn from(threshold: Threshold) -> Self {
        threshold.to_string()
    }
}

/// Parse a threshold expression such as `"2 r/s, 5m"` or `"10r/s,1h"`.
pub fn parse_threshold(expression: &str) -> Result<Threshold, ParseError> {
    let normalized = expression.trim().to_ascii_lowercase();
    let (rate_part, period_part) = normalized.split_once(',').ok_or_else(|| {
        ParseError::new(
            expression.trim(),
            "expected '<rate> r/<unit>, <blocking period>'",
        )
    })?;

    let (request_rate, unit) = parse_rate(rate_part.trim())?;
    let blocking_period = parse_duration(period_part)?;
    Threshold::new(request_rate, unit, blocking_period)
}

fn parse_rate(token: &str) -> Result<(u32, RateUnit), ParseError> {
    let (value, suffix) = token
        .split_once("r/")
        .ok_or_else(|| ParseError::new(token, "expected a rate such as '2 r/s'"))?;

    let unit = RateUnit::from_suffix(suffix.trim())
        .ok_or_else(|| ParseError::new(suffix.trim(), "unknown rate unit, expected s, m or h"))?;

    let value = value.trim();
    let rate: u32 = value
        .parse()
        .map_err(|_| ParseError::new(value, "request rate is not a positive integer"))?;
    if rate == 0 {
        return Err(ParseError::new(value, "request rate must be positive"));
    }

    Ok((rate, unit))
}

/// Parse a duration such as `"30s"`, `"5m"` or `"1h"`.
pub fn parse_duration(token: &str) -> Result<Duration, ParseError> {
    let token = token.trim();
    let lower = token.to_ascii_lowercase();

    let Some(last) = lower.chars().last() else {
        return Err(ParseError::new(token, "missing duration"));
    };
    let multiplier = match last {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        c if c.is_ascii_digit() => {
            return Err(ParseError::new(token, "missing duration unit, expected s, m or h"))
        }
        _ => return Err(ParseError::new(token, "unknown duration unit, expected s, m or h")),
    };

    let value = lower[..lower.len() - 1].trim();
    let amount: u64 = value
        .parse()
        .map_err(|_| ParseError::new(token, "duration is not a positive integer"))?;
    if amount == 0 {
        return Err(ParseError::new(token, "duration must be positive"));
    }

    amount
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| ParseError::new(token, "duration is too large"))
}

/// Render a duration in the largest unit that represents it exactly.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs > 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}
