use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, time::Duration};

/// A duration in the format produced by Go's `time.Duration.String()`, as used
/// by `metav1.Duration` fields (e.g. `"90s"`, `"1h30m"`, `"-5m"`).
///
/// Rust durations are unsigned, so the sign is tracked separately.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct K8sDuration {
    duration: Duration,
    is_negative: bool,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("empty duration")]
    Empty,

    #[error("unknown unit {0:?}: expected one of 'ns', 'us', 'µs', 'ms', 's', 'm', or 'h'")]
    InvalidUnit(String),

    #[error("missing unit after {0:?}")]
    NoUnit(String),

    #[error("invalid number {0:?}")]
    NotANumber(String),

    #[error("duration {0:?} is too large")]
    Overflow(String),
}

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

// === impl K8sDuration ===

impl K8sDuration {
    #[inline]
    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.is_negative
    }

    /// Returns the unsigned duration, or `None` if the duration is negative.
    #[inline]
    pub fn to_std(self) -> Option<Duration> {
        if self.is_negative && !self.duration.is_zero() {
            return None;
        }
        Some(self.duration)
    }
}

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

impl FromStr for K8sDuration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn unit(name: &str) -> Result<Duration, ParseError> {
            Ok(match name {
                "ns" => Duration::from_nanos(1),
                // Both MICRO SIGN and GREEK SMALL LETTER MU are accepted.
                "us" | "\u{00b5}s" | "\u{03bc}s" => Duration::from_micros(1),
                "ms" => Duration::from_millis(1),
                "s" => Duration::from_secs(1),
                "m" => MINUTE,
                "h" => HOUR,
                _ => return Err(ParseError::InvalidUnit(name.to_string())),
            })
        }

        let is_negative = s.starts_with('-');
        let mut rest = s.strip_prefix(['-', '+']).unwrap_or(s);
        if rest.is_empty() {
            return Err(ParseError::Empty);
        }
        if rest == "0" {
            return Ok(Self {
                duration: Duration::ZERO,
                is_negative,
            });
        }

        let mut duration = Duration::ZERO;
        while !rest.is_empty() {
            let num_end = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .ok_or_else(|| ParseError::NoUnit(rest.to_string()))?;
            let (num, tail) = rest.split_at(num_end);
            if num.is_empty() || num == "." {
                return Err(ParseError::NotANumber(num.to_string()));
            }
            let value = num
                .parse::<f64>()
                .map_err(|_| ParseError::NotANumber(num.to_string()))?;

            let unit_end = tail
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(tail.len());
            let (name, tail) = tail.split_at(unit_end);
            duration = Duration::try_from_secs_f64(value * unit(name)?.as_secs_f64())
                .ok()
                .and_then(|term| duration.checked_add(term))
                .ok_or_else(|| ParseError::Overflow(s.to_string()))?;
            rest = tail;
        }

        Ok(Self {
            duration,
            is_negative,
        })
    }
}

impl fmt::Display for K8sDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.duration.is_zero() {
            return f.write_str("0s");
        }
        if self.is_negative {
            f.write_str("-")?;
        }

        let secs = self.duration.as_secs();
        let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
        if hours > 0 {
            write!(f, "{hours}h")?;
        }
        if hours > 0 || minutes > 0 {
            write!(f, "{minutes}m")?;
        }

        let nanos = self.duration.subsec_nanos();
        if nanos == 0 {
            write!(f, "{seconds}s")
        } else {
            let frac = format!("{nanos:09}");
            write!(f, "{seconds}.{}s", frac.trim_end_matches('0'))
        }
    }
}

impl fmt::Debug for K8sDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for K8sDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for K8sDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

impl schemars::JsonSchema for K8sDuration {
    fn schema_name() -> String {
        "K8sDuration".to_string()
    }

    fn is_referenceable() -> bool {
        false
    }

    fn json_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        // Not `format: duration`, which would imply ISO 8601.
        schemars::schema::SchemaObject {
            instance_type: Some(schemars::schema::InstanceType::String.into()),
            ..Default::default()
        }
        .into()
    }
}
