//! Provisioning configuration.
//!
//! Global defaults come from the environment ([`ProvisioningConfig::from_env`])
//! or from any serde source; per-system overrides live in [`SystemSettings`].

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use idm_connector::SystemId;

use crate::backoff::{duration_ms, BackoffPolicy, DEFAULT_RETRY_INTERVAL};
use crate::operation::DEFAULT_MAX_ATTEMPTS;

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Required variable is not set.
    #[error("Missing configuration: {var}")]
    ConfigMissing { var: String },

    /// Variable is set but cannot be used.
    #[error("Invalid configuration for {var}: {reason}")]
    ConfigInvalid { var: String, reason: String },
}

/// Which backoff family `PROVISIONING_BACKOFF` selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            _ => Err(ConfigError::ConfigInvalid {
                var: "PROVISIONING_BACKOFF".to_string(),
                reason: format!("Unknown backoff: {s}"),
            }),
        }
    }
}

/// Ceiling used when exponential backoff is selected from the environment.
const EXPONENTIAL_BACKOFF_CAP: Duration = Duration::from_secs(3600);

/// Time a worker gets after its connector call returns to archive or
/// reschedule the record before the claim counts as stale.
const STALE_CLAIM_MARGIN: Duration = Duration::from_secs(30);

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_connector_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_sync_wait_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_stale_after() -> Duration {
    Duration::from_secs(300)
}

/// Overrides for one target system. Unset fields fall back to the globals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSettings {
    #[serde(default)]
    pub backoff: Option<BackoffPolicy>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default, with = "option_duration_ms")]
    pub debounce: Option<Duration>,
    #[serde(default, with = "option_duration_ms")]
    pub connector_timeout: Option<Duration>,
    /// Operations for this system are archived without being sent.
    #[serde(default)]
    pub read_only: bool,
}

impl SystemSettings {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }

    #[must_use]
    pub fn with_connector_timeout(mut self, timeout: Duration) -> Self {
        self.connector_timeout = Some(timeout);
        self
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Gate delay applied when a submission merges into a queued record.
    #[serde(default, with = "option_duration_ms")]
    pub debounce: Option<Duration>,
    #[serde(default = "default_connector_timeout", with = "duration_ms")]
    pub connector_timeout: Duration,
    /// How long a synchronous caller waits for a worker to release the account.
    #[serde(default = "default_sync_wait_timeout", with = "duration_ms")]
    pub sync_wait_timeout: Duration,
    /// Records held RUNNING longer than this are returned to the queue.
    #[serde(default = "default_stale_after", with = "duration_ms")]
    pub stale_after: Duration,
    #[serde(default)]
    pub systems: HashMap<SystemId, SystemSettings>,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffPolicy::default(),
            debounce: None,
            connector_timeout: default_connector_timeout(),
            sync_wait_timeout: default_sync_wait_timeout(),
            stale_after: default_stale_after(),
            systems: HashMap::new(),
        }
    }
}

impl ProvisioningConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional:
    /// - `PROVISIONING_MAX_ATTEMPTS`: attempts before archiving as failed (default: 5)
    /// - `PROVISIONING_CONNECTOR_TIMEOUT_SECS`: per-call connector timeout (default: 60)
    /// - `PROVISIONING_RETRY_INTERVAL_SECS`: base retry delay (default: 60)
    /// - `PROVISIONING_BACKOFF`: `fixed` (default) or `exponential`
    /// - `PROVISIONING_DEBOUNCE_MS`: merge debounce window (default: none)
    /// - `PROVISIONING_SYNC_WAIT_SECS`: sync caller wait for a busy account (default: 30)
    /// - `PROVISIONING_STALE_AFTER_SECS`: stale claim threshold, must exceed every
    ///   connector timeout (default: 300)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(max_attempts) = parse_var::<u32, _>(&lookup, "PROVISIONING_MAX_ATTEMPTS")? {
            if max_attempts == 0 {
                return Err(ConfigError::ConfigInvalid {
                    var: "PROVISIONING_MAX_ATTEMPTS".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            config.max_attempts = max_attempts;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "PROVISIONING_CONNECTOR_TIMEOUT_SECS")? {
            config.connector_timeout = Duration::from_secs(secs);
        }

        let interval = parse_var::<u64, _>(&lookup, "PROVISIONING_RETRY_INTERVAL_SECS")?
            .map_or(DEFAULT_RETRY_INTERVAL, Duration::from_secs);
        let kind = match lookup("PROVISIONING_BACKOFF") {
            Some(v) => BackoffKind::from_str(&v)?,
            None => BackoffKind::Fixed,
        };
        config.backoff = match kind {
            BackoffKind::Fixed => BackoffPolicy::fixed(interval),
            BackoffKind::Exponential => {
                BackoffPolicy::exponential(interval, EXPONENTIAL_BACKOFF_CAP.max(interval))
            }
        };

        config.debounce = parse_var::<u64, _>(&lookup, "PROVISIONING_DEBOUNCE_MS")?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        if let Some(secs) = parse_var::<u64, _>(&lookup, "PROVISIONING_SYNC_WAIT_SECS")? {
            config.sync_wait_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "PROVISIONING_STALE_AFTER_SECS")? {
            config.stale_after = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check settings that only make sense together.
    ///
    /// A claim must outlive the longest connector call it can cover, otherwise
    /// stale release hands an account to a second worker while the first is
    /// still talking to the target system.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let longest = self.max_connector_timeout();
        if self.stale_after <= longest {
            return Err(ConfigError::ConfigInvalid {
                var: "PROVISIONING_STALE_AFTER_SECS".to_string(),
                reason: format!(
                    "stale threshold {}s must exceed the longest connector timeout {}s",
                    self.stale_after.as_secs(),
                    longest.as_secs()
                ),
            });
        }
        Ok(())
    }

    /// Longest connector timeout across the defaults and every override.
    pub fn max_connector_timeout(&self) -> Duration {
        self.systems
            .values()
            .filter_map(|s| s.connector_timeout)
            .fold(self.connector_timeout, Duration::max)
    }

    /// Age after which a RUNNING claim is released.
    ///
    /// `stale_after`, raised when needed so it always covers the longest
    /// connector timeout plus a margin for the archive write.
    pub fn stale_threshold(&self) -> Duration {
        self.stale_after
            .max(self.max_connector_timeout() + STALE_CLAIM_MARGIN)
    }

    /// Register overrides for a system.
    #[must_use]
    pub fn with_system(mut self, system_id: SystemId, settings: SystemSettings) -> Self {
        self.systems.insert(system_id, settings);
        self
    }

    /// Effective settings for a system, with globals filled in.
    pub fn resolve(&self, system_id: SystemId) -> EffectiveSettings {
        let overrides = self.systems.get(&system_id);
        EffectiveSettings {
            backoff: overrides.and_then(|s| s.backoff).unwrap_or(self.backoff),
            max_attempts: overrides
                .and_then(|s| s.max_attempts)
                .unwrap_or(self.max_attempts),
            debounce: overrides.and_then(|s| s.debounce).or(self.debounce),
            connector_timeout: overrides
                .and_then(|s| s.connector_timeout)
                .unwrap_or(self.connector_timeout),
            read_only: overrides.is_some_and(|s| s.read_only),
        }
    }
}

/// Settings for one system after applying overrides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveSettings {
    pub backoff: BackoffPolicy,
    pub max_attempts: u32,
    pub debounce: Option<Duration>,
    pub connector_timeout: Duration,
    pub read_only: bool,
}

impl EffectiveSettings {
    /// Debounce window as a chrono duration.
    pub fn chrono_debounce(&self) -> Option<chrono::Duration> {
        self.debounce.and_then(|d| chrono::Duration::from_std(d).ok())
    }
}

fn parse_var<T, F>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::ConfigInvalid {
                var: var.to_string(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
