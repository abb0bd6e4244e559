//! Connector traits
//!
//! The contract the provisioning engine consumes to talk to a target system.
//! Transport details (LDAP, SQL, REST) live entirely behind [`Connector`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ConnectorResult;
use crate::ids::SystemId;
use crate::types::OperationType;

/// A single call against a remote account.
#[derive(Debug, Clone)]
pub struct ConnectorRequest<'a> {
    /// The system the call is made against.
    pub system_id: SystemId,
    /// Demanded effect on the remote account.
    pub operation_type: OperationType,
    /// Stable key of the account on the remote system.
    pub remote_uid: &'a str,
    /// Attribute values computed by the mapping step.
    pub payload: &'a serde_json::Value,
    /// Time budget for the call. The engine also enforces it from outside.
    pub timeout: Duration,
}

/// Outcome of a successful connector call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorResponse {
    /// UID reported by the target system (may differ from the requested one
    /// for systems that assign their own identifiers on create).
    pub uid: Option<String>,
    /// Free-form diagnostic from the target system.
    pub diagnostic: Option<String>,
}

impl ConnectorResponse {
    /// Response carrying the resulting uid.
    pub fn with_uid(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
            diagnostic: None,
        }
    }
}

/// Base trait for all connectors.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Get the display name for this connector instance.
    fn display_name(&self) -> &str;

    /// Apply one operation to one remote account.
    ///
    /// Failures must be classified through [`crate::ConnectorError`] so the
    /// engine can decide between retry and permanent failure.
    async fn invoke(&self, request: ConnectorRequest<'_>) -> ConnectorResult<ConnectorResponse>;

    /// Check if the connector is currently healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Provider for connector instances, keyed by system.
#[async_trait]
pub trait ConnectorProvider: Send + Sync {
    /// Get the connector serving a system.
    async fn get_connector(&self, system_id: SystemId) -> Option<Arc<dyn Connector>>;
}
