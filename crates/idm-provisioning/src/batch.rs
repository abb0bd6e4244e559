//! Batch gates.
//!
//! One gate exists per (system, remote uid) pair while an operation for that
//! account is queued. Its `next_attempt` decides when the account's single
//! active record may run next, which serializes everything aimed at one
//! remote account.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use idm_connector::SystemId;

/// Identity of a remote account: the key a gate is unique on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountKey {
    pub system_id: SystemId,
    pub remote_uid: String,
}

impl AccountKey {
    pub fn new(system_id: SystemId, remote_uid: impl Into<String>) -> Self {
        Self {
            system_id,
            remote_uid: remote_uid.into(),
        }
    }
}

impl std::fmt::Display for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.system_id, self.remote_uid)
    }
}

/// Per-account serialization record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchGate {
    pub id: Uuid,
    pub system_id: SystemId,
    pub remote_uid: String,
    /// The active record is not (re)executed before this instant.
    pub next_attempt: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl BatchGate {
    /// Open a gate that is due immediately.
    pub fn open(system_id: SystemId, remote_uid: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            system_id,
            remote_uid: remote_uid.into(),
            next_attempt: now,
            created_at: now,
        }
    }

    pub fn key(&self) -> AccountKey {
        AccountKey::new(self.system_id, self.remote_uid.clone())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt <= now
    }

    /// Move `next_attempt` forward. Never moves it backwards.
    ///
    /// Returns whether the gate changed.
    pub fn advance_to(&mut self, at: DateTime<Utc>) -> bool {
        if at > self.next_attempt {
            self.next_attempt = at;
            true
        } else {
            false
        }
    }

    /// Apply a debounce window after a merge.
    pub fn debounce(&mut self, now: DateTime<Utc>, window: Option<Duration>) -> bool {
        match window {
            Some(window) if window > Duration::zero() => self.advance_to(now + window),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_gate_is_due() {
        let now = Utc::now();
        let gate = BatchGate::open(SystemId::new(), "jdoe", now);
        assert!(gate.is_due(now));
        assert!(!gate.is_due(now - Duration::seconds(1)));
    }

    #[test]
    fn test_advance_is_monotonic() {
        let now = Utc::now();
        let mut gate = BatchGate::open(SystemId::new(), "jdoe", now);

        assert!(gate.advance_to(now + Duration::seconds(30)));
        assert!(!gate.advance_to(now + Duration::seconds(10)));
        assert_eq!(gate.next_attempt, now + Duration::seconds(30));
    }

    #[test]
    fn test_debounce_window() {
        let now = Utc::now();
        let mut gate = BatchGate::open(SystemId::new(), "jdoe", now);

        assert!(!gate.debounce(now, None));
        assert!(!gate.debounce(now, Some(Duration::zero())));
        assert!(gate.debounce(now, Some(Duration::milliseconds(500))));
        assert_eq!(gate.next_attempt, now + Duration::milliseconds(500));
    }

    #[test]
    fn test_account_key_display() {
        let system_id = SystemId::new();
        let key = AccountKey::new(system_id, "cn=jdoe");
        assert_eq!(key.to_string(), format!("{system_id}/cn=jdoe"));
    }
}
