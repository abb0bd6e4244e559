//! Event handlers for provisioning.
//!
//! Turns role assignment events into coordinator input. Roles are resolved
//! to the accounts they provision, with composite roles expanded by the
//! resolver.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::coordinator::{
    AccountMapping, AccountTarget, CoordinatorError, OrderingCoordinator, ReconcileReport,
    RoleChange,
};
use crate::operation::ProvisioningContext;

/// Event handler errors.
#[derive(Debug, Error)]
pub enum EventError {
    /// Coordinator error.
    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    /// Invalid event payload.
    #[error("Invalid event payload: {0}")]
    InvalidPayload(String),

    /// A role could not be resolved to accounts.
    #[error("Role {role_ref} could not be resolved: {reason}")]
    Resolution { role_ref: String, reason: String },
}

/// Result type for event handlers.
pub type EventResult<T> = Result<T, EventError>;

/// Roles granted to or taken from an identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAssignmentEvent {
    /// Identity ID.
    pub identity_id: Uuid,

    /// Roles granted.
    #[serde(default)]
    pub added: Vec<String>,

    /// Roles taken away.
    #[serde(default)]
    pub removed: Vec<String>,

    /// Execute inline and block until the target systems answer.
    #[serde(default)]
    pub synchronous: bool,

    /// Go through the motions without contacting target systems.
    #[serde(default)]
    pub dry_run: bool,

    /// Optional correlation ID for tracing.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl RoleAssignmentEvent {
    fn context(&self) -> ProvisioningContext {
        let context = if self.synchronous {
            ProvisioningContext::synchronous()
        } else {
            ProvisioningContext::asynchronous()
        };
        context.with_dry_run(self.dry_run)
    }
}

/// Trait for resolving which accounts a role provisions.
#[async_trait::async_trait]
pub trait RoleResolver: Send + Sync {
    /// Accounts the role provisions for the identity, including those of
    /// the roles it contains.
    async fn resolve(&self, identity_id: Uuid, role_ref: &str) -> EventResult<Vec<AccountTarget>>;
}

/// Event handler for provisioning operations.
pub struct ProvisioningEventHandler<R: RoleResolver, M: AccountMapping> {
    resolver: Arc<R>,
    coordinator: Arc<OrderingCoordinator<M>>,
}

impl<R: RoleResolver, M: AccountMapping> ProvisioningEventHandler<R, M> {
    /// Create a new event handler.
    pub fn new(resolver: Arc<R>, coordinator: Arc<OrderingCoordinator<M>>) -> Self {
        Self {
            resolver,
            coordinator,
        }
    }

    /// Handle a raw event payload.
    pub async fn handle_payload(&self, payload: serde_json::Value) -> EventResult<ReconcileReport> {
        let event: RoleAssignmentEvent = serde_json::from_value(payload)
            .map_err(|e| EventError::InvalidPayload(e.to_string()))?;
        self.handle_role_assignment(event).await
    }

    /// Handle a role assignment event.
    #[instrument(
        skip(self, event),
        fields(identity_id = %event.identity_id, correlation_id = ?event.correlation_id)
    )]
    pub async fn handle_role_assignment(
        &self,
        event: RoleAssignmentEvent,
    ) -> EventResult<ReconcileReport> {
        info!(
            added = event.added.len(),
            removed = event.removed.len(),
            "Handling RoleAssignment event"
        );

        let mut changes = Vec::new();
        for role_ref in &event.added {
            for target in self.resolver.resolve(event.identity_id, role_ref).await? {
                changes.push(RoleChange::add(role_ref.clone(), target));
            }
        }
        for role_ref in &event.removed {
            for target in self.resolver.resolve(event.identity_id, role_ref).await? {
                changes.push(RoleChange::remove(role_ref.clone(), target));
            }
        }

        if changes.is_empty() {
            debug!("No accounts affected, skipping provisioning");
            return Ok(ReconcileReport::default());
        }

        Ok(self
            .coordinator
            .reconcile_and_submit(&changes, &event.context())
            .await?)
    }
}
