//! Retry delay policies.
//!
//! The delay before the next attempt is a configuration point. The default is
//! a fixed interval; exponential growth with a ceiling is available per system.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default interval between attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// How long to wait before the next attempt of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// Same delay after every failure.
    Fixed {
        #[serde(with = "duration_ms")]
        interval: Duration,
    },
    /// `initial * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        #[serde(with = "duration_ms")]
        initial: Duration,
        multiplier: f64,
        #[serde(with = "duration_ms")]
        max: Duration,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Fixed {
            interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl BackoffPolicy {
    /// Fixed interval policy.
    pub fn fixed(interval: Duration) -> Self {
        BackoffPolicy::Fixed { interval }
    }

    /// Exponential policy doubling from `initial` up to `max`.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        BackoffPolicy::Exponential {
            initial,
            multiplier: 2.0,
            max,
        }
    }

    /// Delay to apply after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed { interval } => interval,
            BackoffPolicy::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exponent = attempt.saturating_sub(1).min(32);
                let base_ms = initial.as_millis() as f64 * multiplier.max(1.0).powi(exponent as i32);
                let capped = base_ms.min(max.as_millis() as f64);
                Duration::from_millis(capped as u64)
            }
        }
    }

    /// Delay as a chrono duration, for timestamp arithmetic.
    pub fn chrono_delay(&self, attempt: u32) -> chrono::Duration {
        chrono::Duration::from_std(self.delay(attempt))
            .unwrap_or_else(|_| chrono::Duration::days(3650))
    }
}

/// Serialize durations as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
