//! Ordering coordinator.
//!
//! Turns a set of role changes into account operations. Changes are grouped
//! per remote account and collapsed to their net effect, so removing one role
//! and adding another on the same account becomes a single update instead of
//! a delete followed by a create. Operations derived from additions are
//! submitted before those derived from removals.
//!
//! Account state combines what the target system holds with the account's
//! queued record: a create still waiting in the queue counts as an existing
//! account, and revoking it before delivery withdraws the queued create.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use idm_connector::{AccountId, OperationId, OperationType, SystemId};

use crate::batch::AccountKey;
use crate::operation::{
    AnyOperation, ArchiveRecord, EntityType, NewOperation, ProvisioningContext,
};
use crate::queue::QueueError;
use crate::service::{ProvisioningError, ProvisioningService};

/// Cancellation reason for queued creates withdrawn by a revocation.
const WITHDRAWN_REASON: &str = "role revoked before the account was provisioned";

/// Result code for changes the mapping could not turn into a payload.
pub const MAPPING_FAILED_CODE: &str = "MAPPING_FAILED";

/// Direction of a role change. `Add` sorts before `Remove`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Add,
    Remove,
}

/// A remote account a role provisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountTarget {
    pub system_id: SystemId,
    pub account_id: AccountId,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub remote_uid: String,
}

impl AccountTarget {
    pub fn key(&self) -> AccountKey {
        AccountKey::new(self.system_id, self.remote_uid.clone())
    }
}

/// One role gained or lost, already resolved to the account it provisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleChange {
    pub effect: Effect,
    pub role_ref: String,
    pub target: AccountTarget,
}

impl RoleChange {
    pub fn add(role_ref: impl Into<String>, target: AccountTarget) -> Self {
        Self {
            effect: Effect::Add,
            role_ref: role_ref.into(),
            target,
        }
    }

    pub fn remove(role_ref: impl Into<String>, target: AccountTarget) -> Self {
        Self {
            effect: Effect::Remove,
            role_ref: role_ref.into(),
            target,
        }
    }
}

/// What the mapping service knows about an account after the changes apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccountState {
    /// The account exists on the target system.
    pub exists: bool,
    /// Assignments that still grant the account.
    pub retained_assignments: usize,
}

/// Mapping service errors. None of them are retried.
#[derive(Debug, Error)]
pub enum MappingError {
    /// The identity has no account on the system.
    #[error("Account not resolvable: {0}")]
    Unresolvable(String),

    /// Attribute mapping failed.
    #[error("Mapping failed: {0}")]
    Failed(String),
}

/// Result type for mapping calls.
pub type MappingResult<T> = Result<T, MappingError>;

/// Supplies account state and payloads for the coordinator.
#[async_trait]
pub trait AccountMapping: Send + Sync {
    /// Current state of the account.
    async fn account_state(&self, target: &AccountTarget) -> MappingResult<AccountState>;

    /// Attribute payload for an operation on the account.
    async fn compute_payload(
        &self,
        target: &AccountTarget,
        operation_type: OperationType,
    ) -> MappingResult<serde_json::Value>;
}

/// Coordinator errors.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Mapping error.
    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// Provisioning service error.
    #[error("Provisioning error: {0}")]
    Service(#[from] ProvisioningError),
}

/// Result type for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// A submission derived from the net effect on one account.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedOperation {
    pub effect: Effect,
    pub submission: NewOperation,
    /// Set when the payload could not be computed. The operation is archived
    /// instead of queued.
    pub rejection: Option<String>,
    /// Queued create this delete withdraws. The account was never delivered,
    /// so cancelling the create replaces the delete.
    pub withdraws: Option<OperationId>,
}

/// Ordered submissions for one reconcile call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub operations: Vec<PlannedOperation>,
    /// Accounts whose changes needed no operation.
    pub skipped: Vec<AccountKey>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// What applying a plan produced.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Queued records, or archive entries of successful inline executions.
    pub submitted: Vec<AnyOperation>,
    /// Terminal inline failures.
    pub failed: Vec<ArchiveRecord>,
    /// Changes archived without queueing because the mapping failed.
    pub rejected: Vec<ArchiveRecord>,
    /// Queued creates cancelled because their grant was revoked.
    pub withdrawn: Vec<ArchiveRecord>,
}

struct AccountChanges {
    target: AccountTarget,
    added: bool,
    removed: bool,
}

/// Orders and collapses role changes into submissions.
pub struct OrderingCoordinator<M: AccountMapping> {
    service: Arc<ProvisioningService>,
    mapping: Arc<M>,
}

impl<M: AccountMapping> OrderingCoordinator<M> {
    pub fn new(service: Arc<ProvisioningService>, mapping: Arc<M>) -> Self {
        Self { service, mapping }
    }

    pub fn service(&self) -> &Arc<ProvisioningService> {
        &self.service
    }

    /// Compute the ordered submissions for a set of changes.
    ///
    /// A failure to read account state aborts the whole call. A failure to
    /// compute one payload only rejects that account's operation.
    #[instrument(skip(self, changes, context), fields(changes = changes.len()))]
    pub async fn reconcile(
        &self,
        changes: &[RoleChange],
        context: &ProvisioningContext,
    ) -> CoordinatorResult<ReconcilePlan> {
        let mut plan = ReconcilePlan::default();

        for account in group_by_account(changes) {
            let state = self.mapping.account_state(&account.target).await?;
            let pending = self
                .service
                .queue()
                .find_active(&account.target.key())
                .await
                .map_err(ProvisioningError::from)?;
            let pending_type = pending.as_ref().map(|record| record.operation_type);
            let Some((effect, operation_type)) = net_effect(&account, state, pending_type) else {
                debug!(account = %account.target.key(), "No operation needed");
                plan.skipped.push(account.target.key());
                continue;
            };

            let (payload, rejection) = match self
                .mapping
                .compute_payload(&account.target, operation_type)
                .await
            {
                Ok(payload) => (payload, None),
                Err(e) => {
                    warn!(account = %account.target.key(), error = %e, "Payload mapping failed");
                    (serde_json::Value::Object(serde_json::Map::new()), Some(e.to_string()))
                }
            };

            let withdraws = pending
                .as_ref()
                .filter(|record| {
                    operation_type == OperationType::Delete
                        && !state.exists
                        && record.operation_type == OperationType::Create
                })
                .map(|record| record.id);

            let target = account.target;
            let submission = NewOperation::new(
                target.system_id,
                target.account_id,
                target.entity_type,
                target.entity_id,
                target.remote_uid,
                operation_type,
                payload,
            )
            .with_context(*context);

            plan.operations.push(PlannedOperation {
                effect,
                submission,
                rejection,
                withdraws,
            });
        }

        plan.operations.sort_by_key(|op| op.effect);
        Ok(plan)
    }

    /// Submit a plan in order.
    pub async fn apply(&self, plan: ReconcilePlan) -> CoordinatorResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for planned in plan.operations {
            if let Some(operation_id) = planned.withdraws {
                if !planned.submission.context.dry_run {
                    match self.service.cancel(operation_id, WITHDRAWN_REASON).await {
                        Ok(archive) => {
                            report.withdrawn.push(archive);
                            continue;
                        }
                        // Running or already delivered: queue the delete behind it.
                        Err(ProvisioningError::Queue(
                            QueueError::AccountBusy { .. } | QueueError::NotFound { .. },
                        )) => {
                            debug!(
                                operation_id = %operation_id,
                                "Queued create no longer cancellable, submitting delete"
                            );
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }

            if let Some(reason) = planned.rejection {
                let archive = self
                    .service
                    .reject(&planned.submission, MAPPING_FAILED_CODE, &reason)
                    .await?;
                report.rejected.push(archive);
                continue;
            }

            match self.service.submit(planned.submission).await {
                Ok(operation) => report.submitted.push(operation),
                Err(ProvisioningError::Failed { archive }) => report.failed.push(*archive),
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            submitted = report.submitted.len(),
            failed = report.failed.len(),
            rejected = report.rejected.len(),
            withdrawn = report.withdrawn.len(),
            "Role changes applied"
        );
        Ok(report)
    }

    /// Reconcile and submit in one step.
    pub async fn reconcile_and_submit(
        &self,
        changes: &[RoleChange],
        context: &ProvisioningContext,
    ) -> CoordinatorResult<ReconcileReport> {
        let plan = self.reconcile(changes, context).await?;
        self.apply(plan).await
    }
}

/// Group changes per account, keeping first-seen order.
fn group_by_account(changes: &[RoleChange]) -> Vec<AccountChanges> {
    let mut index: HashMap<AccountKey, usize> = HashMap::new();
    let mut grouped: Vec<AccountChanges> = Vec::new();

    for change in changes {
        let slot = *index.entry(change.target.key()).or_insert_with(|| {
            grouped.push(AccountChanges {
                target: change.target.clone(),
                added: false,
                removed: false,
            });
            grouped.len() - 1
        });
        match change.effect {
            Effect::Add => grouped[slot].added = true,
            Effect::Remove => grouped[slot].removed = true,
        }
    }

    grouped
}

/// The single operation an account needs, if any.
///
/// `pending` is the type of the account's queued record. Its type after a
/// merge is the type returned here, so an account that only exists through a
/// queued create keeps being created.
fn net_effect(
    account: &AccountChanges,
    state: AccountState,
    pending: Option<OperationType>,
) -> Option<(Effect, OperationType)> {
    let provisioned = match pending {
        Some(OperationType::Delete) => false,
        Some(_) => true,
        None => state.exists,
    };
    let upsert = if state.exists {
        OperationType::Update
    } else {
        OperationType::Create
    };

    if account.added {
        return Some((Effect::Add, upsert));
    }
    if !account.removed || !provisioned {
        return None;
    }
    if state.retained_assignments > 0 {
        Some((Effect::Remove, upsert))
    } else {
        Some((Effect::Remove, OperationType::Delete))
    }
}
