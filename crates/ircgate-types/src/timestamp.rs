use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A remote message timestamp (`"1700000000.123456"`), kept as whole
/// microseconds so it can be hashed and compared exactly.
///
/// The remote service uses these both as points in time and as message ids,
/// so equality must be exact: two events carry the same timestamp only when
/// they describe the same message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

const MICROS: i64 = 1_000_000;

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Saturates at the ends of the representable range.
    pub fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(MICROS))
    }

    pub fn checked_from_secs(secs: i64) -> Option<Self> {
        secs.checked_mul(MICROS).map(Self)
    }

    pub fn now() -> Self {
        Self(Utc::now().timestamp_micros())
    }

    pub fn as_micros(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Time elapsed from `self` until `later`, zero if `later` is earlier.
    pub fn elapsed_until(self, later: Timestamp) -> Duration {
        Duration::from_micros(later.0.saturating_sub(self.0).max(0) as u64)
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.0)
    }

    fn from_f64(value: f64) -> Self {
        Self((value * MICROS as f64).round() as i64)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:06}", sign, abs / MICROS as u64, abs % MICROS as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTimestampError(String);

impl fmt::Display for ParseTimestampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid timestamp: {:?}", self.0)
    }
}

impl std::error::Error for ParseTimestampError {}

impl FromStr for Timestamp {
    type Err = ParseTimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseTimestampError(s.to_string());
        let (secs, frac) = match s.split_once('.') {
            Some((secs, frac)) => (secs, frac),
            None => (s, ""),
        };
        if frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return err_or_float(s).ok_or_else(err);
        }
        let negative = secs.starts_with('-');
        let secs: i64 = secs.parse().map_err(|_| err())?;
        let mut micros: i64 = 0;
        for (i, digit) in frac.bytes().enumerate() {
            micros += i64::from(digit - b'0') * 10_i64.pow(5 - i as u32);
        }
        // The fraction carries the sign of the whole value, "-0.5" included.
        let micros = if negative { -micros } else { micros };
        secs.checked_mul(MICROS)
            .and_then(|whole| whole.checked_add(micros))
            .map(Self)
            .ok_or_else(err)
    }
}

// Anything with more than microsecond precision is rounded through f64.
fn err_or_float(s: &str) -> Option<Timestamp> {
    s.parse::<f64>().ok().filter(|v| v.is_finite()).map(Timestamp::from_f64)
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TimestampVisitor;

        impl Visitor<'_> for TimestampVisitor {
            type Value = Timestamp;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a timestamp as a decimal string or number")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Timestamp, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Timestamp, E> {
                Ok(Timestamp::from_f64(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Timestamp, E> {
                Timestamp::checked_from_secs(v)
                    .ok_or_else(|| E::custom(format!("timestamp out of range: {}", v)))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Timestamp, E> {
                i64::try_from(v)
                    .ok()
                    .and_then(Timestamp::checked_from_secs)
                    .ok_or_else(|| E::custom(format!("timestamp out of range: {}", v)))
            }
        }

        deserializer.deserialize_any(TimestampVisitor)
    }
}
