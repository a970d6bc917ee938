use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, time::Duration};

/// A duration in the format produced by Go's `time.Duration.String()`, as
/// used by feed pull periods (`"12h"`, `"90m"`, `"1h30m"`).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct K8sDuration {
    duration: Duration,
    is_negative: bool,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid unit {0:?}: {EXPECTED_UNITS}")]
    InvalidUnit(String),

    #[error("missing a unit: {EXPECTED_UNITS}")]
    NoUnit,

    #[error("empty duration")]
    Empty,

    #[error("invalid number: {0}")]
    NotANumber(#[from] std::num::ParseFloatError),

    #[error("invalid number {0:?}: only a leading sign is allowed")]
    InvalidNumber(String),

    #[error("duration is too large")]
    Overflow,
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

impl From<Duration> for K8sDuration {
    fn from(duration: Duration) -> Self {
        Self {
            duration,
            is_negative: false,
        }
    }
}

impl From<K8sDuration> for Duration {
    fn from(K8sDuration { duration, .. }: K8sDuration) -> Self {
        duration
    }
}

impl K8sDuration {
    #[inline]
    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.is_negative
    }

    /// Returns the duration if it is strictly positive.
    pub fn positive(&self) -> Option<Duration> {
        if self.is_negative || self.duration.is_zero() {
            return None;
        }
        Some(self.duration)
    }
}

/// Parses a pull period, returning `None` when the value is malformed,
/// negative, or zero.
pub fn parse_period(s: &str) -> Option<Duration> {
    s.parse::<K8sDuration>().ok()?.positive()
}

fn unit_base(unit: &str) -> Result<Duration, ParseError> {
    match unit {
        "ns" => Ok(Duration::from_nanos(1)),
        // U+00B5 is the micro sign; U+03BC is the Greek letter mu.
        "us" | "\u{00b5}s" | "\u{03bc}s" => Ok(Duration::from_micros(1)),
        "ms" => Ok(Duration::from_millis(1)),
        "s" => Ok(Duration::from_secs(1)),
        "m" => Ok(MINUTE),
        "h" => Ok(HOUR),
        _ => Err(ParseError::InvalidUnit(unit.to_string())),
    }
}

impl FromStr for K8sDuration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let is_negative = s.starts_with('-');
        let mut rest = s.trim_start_matches(['+', '-']);
        if rest.is_empty() {
            return Err(ParseError::Empty);
        }
        if rest == "0" {
            return Ok(K8sDuration {
                duration: Duration::ZERO,
                is_negative,
            });
        }

        let mut duration = Duration::ZERO;
        while !rest.is_empty() {
            let unit_start = rest
                .find(|c: char| c.is_alphabetic())
                .ok_or(ParseError::NoUnit)?;
            let (value, tail) = rest.split_at(unit_start);
            let unit_end = tail
                .find(|c: char| !c.is_alphabetic())
                .unwrap_or(tail.len());
            let (unit, tail) = tail.split_at(unit_end);
            if !value.chars().all(|c| c.is_ascii_digit() || c == '.') {
                return Err(ParseError::InvalidNumber(value.to_string()));
            }
            let base = unit_base(unit)?;
            let part = Duration::try_from_secs_f64(base.as_secs_f64() * value.parse::<f64>()?)
                .map_err(|_| ParseError::Overflow)?;
            duration = duration.checked_add(part).ok_or(ParseError::Overflow)?;
            rest = tail;
        }

        Ok(K8sDuration {
            duration,
            is_negative,
        })
    }
}

impl fmt::Display for K8sDuration {
    /// Formats the duration the way Go does, e.g. `12h0m0s`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_negative && !self.duration.is_zero() {
            f.write_str("-")?;
        }
        let total = self.duration.as_secs();
        let nanos = self.duration.subsec_nanos();
        if total == 0 {
            return match nanos {
                0 => f.write_str("0s"),
                n if n < 1_000 => write!(f, "{n}ns"),
                n if n < 1_000_000 => write!(f, "{}\u{00b5}s", trim_fraction(n, 1_000)),
                n => write!(f, "{}ms", trim_fraction(n, 1_000_000)),
            };
        }

        let (hours, minutes, seconds) = (total / 3600, (total / 60) % 60, total % 60);
        let seconds = if nanos == 0 {
            seconds.to_string()
        } else {
            format!("{seconds}.{}", format!("{nanos:09}").trim_end_matches('0'))
        };
        if hours > 0 {
            write!(f, "{hours}h{minutes}m{seconds}s")
        } else if minutes > 0 {
            write!(f, "{minutes}m{seconds}s")
        } else {
            write!(f, "{seconds}s")
        }
    }
}

fn trim_fraction(value: u32, scale: u32) -> String {
    let whole = value / scale;
    let frac = value % scale;
    if frac == 0 {
        return whole.to_string();
    }
    let width = scale.ilog10() as usize;
    format!("{whole}.{}", format!("{frac:0width$}").trim_end_matches('0'))
}

impl Serialize for K8sDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for K8sDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
