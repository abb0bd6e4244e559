//! Provisioning operation model.
//!
//! An [`OperationRecord`] is the active, mutable unit of work for one remote
//! account. Once it reaches a terminal outcome it is copied into an
//! [`ArchiveRecord`] and removed from the queue. Both implement the read-only
//! [`ProvisioningOperation`] view, and [`AnyOperation`] carries either one.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use idm_connector::{AccountId, OperationId, OperationType, SystemId};

/// Default number of execution attempts before an operation is archived as failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Result code used for dry-run executions.
pub const DRY_RUN_CODE: &str = "DRY_RUN";

/// State of an operation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    /// Queued, not yet executed.
    Created,
    /// Dispatched to the connector.
    Running,
    /// Applied on the target system.
    Executed,
    /// Failed; the diagnostic is kept on the result.
    Exception,
    /// Applied with a warning from the target system.
    Warning,
    /// Never sent to the target system.
    NotExecuted,
}

impl OperationState {
    /// Get the string representation used in the database.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Created => "CREATED",
            OperationState::Running => "RUNNING",
            OperationState::Executed => "EXECUTED",
            OperationState::Exception => "EXCEPTION",
            OperationState::Warning => "WARNING",
            OperationState::NotExecuted => "NOT_EXECUTED",
        }
    }

    /// Whether the state counts as a successful delivery.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, OperationState::Executed | OperationState::Warning)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OperationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CREATED" => Ok(OperationState::Created),
            "RUNNING" => Ok(OperationState::Running),
            "EXECUTED" => Ok(OperationState::Executed),
            "EXCEPTION" => Ok(OperationState::Exception),
            "WARNING" => Ok(OperationState::Warning),
            "NOT_EXECUTED" => Ok(OperationState::NotExecuted),
            _ => Err(format!("Unknown operation state: {s}")),
        }
    }
}

/// Kind of domain entity that triggered an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Identity,
    Role,
    Contract,
    Tree,
}

impl EntityType {
    /// Get the string representation used in the database.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Identity => "identity",
            EntityType::Role => "role",
            EntityType::Contract => "contract",
            EntityType::Tree => "tree",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "identity" => Ok(EntityType::Identity),
            "role" => Ok(EntityType::Role),
            "contract" => Ok(EntityType::Contract),
            "tree" => Ok(EntityType::Tree),
            _ => Err(format!("Unknown entity type: {s}")),
        }
    }
}

/// Outcome of an operation: state plus the diagnostic that explains it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub state: OperationState,
    /// Stable classification code (e.g. `CONNECTION_TIMEOUT`).
    pub code: Option<String>,
    /// Failure message, kept verbatim.
    pub cause: Option<String>,
}

impl OperationResult {
    fn new(state: OperationState) -> Self {
        Self {
            state,
            code: None,
            cause: None,
        }
    }

    /// Freshly queued.
    pub fn created() -> Self {
        Self::new(OperationState::Created)
    }

    /// Dispatched.
    pub fn running() -> Self {
        Self::new(OperationState::Running)
    }

    /// Applied on the target system.
    pub fn executed() -> Self {
        Self::new(OperationState::Executed)
    }

    /// Synthesized success for a dry run.
    pub fn dry_run() -> Self {
        Self {
            state: OperationState::Executed,
            code: Some(DRY_RUN_CODE.to_string()),
            cause: None,
        }
    }

    /// Applied, but the target system reported something worth keeping.
    pub fn warning(diagnostic: impl Into<String>) -> Self {
        Self {
            state: OperationState::Warning,
            code: None,
            cause: Some(diagnostic.into()),
        }
    }

    /// Failed execution.
    pub fn exception(code: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            state: OperationState::Exception,
            code: Some(code.into()),
            cause: Some(cause.into()),
        }
    }

    /// Rejected before reaching the target system.
    pub fn not_executed(code: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            state: OperationState::NotExecuted,
            code: Some(code.into()),
            cause: Some(cause.into()),
        }
    }
}

/// Per-call flags that travel with a submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningContext {
    /// Run the whole pipeline except the connector call.
    pub dry_run: bool,
    /// Execute inline, blocking the caller until the connector returns.
    pub synchronous: bool,
    /// Marks an out-of-band retry (operator triggered).
    pub manual_event_id: Option<Uuid>,
}

impl ProvisioningContext {
    /// Asynchronous, live context.
    pub fn asynchronous() -> Self {
        Self::default()
    }

    /// Synchronous, live context.
    pub fn synchronous() -> Self {
        Self {
            synchronous: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[must_use]
    pub fn with_manual_event(mut self, manual_event_id: Uuid) -> Self {
        self.manual_event_id = Some(manual_event_id);
        self
    }
}

/// A change to deliver, as handed to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOperation {
    pub system_id: SystemId,
    pub account_id: AccountId,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub remote_uid: String,
    pub operation_type: OperationType,
    pub payload: serde_json::Value,
    pub context: ProvisioningContext,
    /// Overrides the configured attempt limit for this operation.
    pub max_attempts: Option<u32>,
}

impl NewOperation {
    /// Create a submission with an asynchronous context.
    pub fn new(
        system_id: SystemId,
        account_id: AccountId,
        entity_type: EntityType,
        entity_id: Uuid,
        remote_uid: impl Into<String>,
        operation_type: OperationType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            system_id,
            account_id,
            entity_type,
            entity_id,
            remote_uid: remote_uid.into(),
            operation_type,
            payload,
            context: ProvisioningContext::default(),
            max_attempts: None,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: ProvisioningContext) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Contract checks performed before anything is queued.
    pub fn validate(&self) -> Result<(), String> {
        if self.remote_uid.trim().is_empty() {
            return Err(format!(
                "no resolvable remote account for {} {} on system {}",
                self.entity_type, self.entity_id, self.system_id
            ));
        }
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.operation_type != OperationType::Delete && !self.payload.is_object() {
            return Err(format!(
                "{} payload must be an attribute object",
                self.operation_type
            ));
        }
        Ok(())
    }
}

/// The active operation for one (system, remote uid) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: OperationId,
    /// Batch gate this record is queued behind.
    pub batch_id: Uuid,
    pub system_id: SystemId,
    pub account_id: AccountId,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub remote_uid: String,
    pub operation_type: OperationType,
    pub payload: serde_json::Value,
    pub current_attempt: u32,
    pub max_attempts: u32,
    pub result: OperationResult,
    pub context: ProvisioningContext,
    /// Bumped on every merge; used to detect submissions that arrived mid-flight.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set while a worker holds the record.
    pub claimed_at: Option<DateTime<Utc>>,
}

impl OperationRecord {
    /// Build the first record for a freshly created gate.
    pub fn from_submission(
        submission: &NewOperation,
        batch_id: Uuid,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OperationId::new(),
            batch_id,
            system_id: submission.system_id,
            account_id: submission.account_id,
            entity_type: submission.entity_type,
            entity_id: submission.entity_id,
            remote_uid: submission.remote_uid.clone(),
            operation_type: submission.operation_type,
            payload: submission.payload.clone(),
            current_attempt: 0,
            max_attempts,
            result: OperationResult::created(),
            context: submission.context,
            version: 0,
            created_at: now,
            updated_at: now,
            claimed_at: None,
        }
    }

    /// Replace payload and type with a newer submission (last writer wins).
    ///
    /// The attempt counter and the record's dry-run flag are left alone.
    pub fn merge(&mut self, submission: &NewOperation, now: DateTime<Utc>) {
        self.operation_type = submission.operation_type;
        self.payload = submission.payload.clone();
        self.account_id = submission.account_id;
        self.entity_type = submission.entity_type;
        self.entity_id = submission.entity_id;
        self.context = ProvisioningContext {
            dry_run: self.context.dry_run,
            ..submission.context
        };
        self.version += 1;
        self.updated_at = now;
    }

    /// Whether a worker currently holds this record.
    pub fn is_running(&self) -> bool {
        self.result.state == OperationState::Running
    }

    /// Whether the stored record still belongs to the execution that
    /// claimed it as `claimed`.
    ///
    /// A record released as stale and not yet claimed again still belongs to
    /// its last claimant.
    pub fn held_by(&self, claimed: &OperationRecord) -> bool {
        self.id == claimed.id && (!self.is_running() || self.claimed_at == claimed.claimed_at)
    }

    /// Whether another failed attempt would exhaust the attempt budget.
    pub fn attempts_exhausted(&self) -> bool {
        self.current_attempt >= self.max_attempts
    }
}

/// Immutable historical record of a terminal operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub id: Uuid,
    /// Id of the queued record this entry was produced from.
    pub operation_id: OperationId,
    pub system_id: SystemId,
    pub account_id: AccountId,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub remote_uid: String,
    pub operation_type: OperationType,
    pub payload: serde_json::Value,
    pub result: OperationResult,
    pub attempts: u32,
    pub dry_run: bool,
    pub synchronous: bool,
    pub manual_event_id: Option<Uuid>,
    /// When the original operation was first queued.
    pub queued_at: DateTime<Utc>,
    /// When this entry was written.
    pub created_at: DateTime<Utc>,
}

impl ArchiveRecord {
    /// Copy a terminal record into the archive.
    pub fn from_terminal(
        record: &OperationRecord,
        result: OperationResult,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_id: record.id,
            system_id: record.system_id,
            account_id: record.account_id,
            entity_type: record.entity_type,
            entity_id: record.entity_id,
            remote_uid: record.remote_uid.clone(),
            operation_type: record.operation_type,
            payload: record.payload.clone(),
            result,
            attempts: record.current_attempt,
            dry_run: record.context.dry_run,
            synchronous: record.context.synchronous,
            manual_event_id: record.context.manual_event_id,
            queued_at: record.created_at,
            created_at: now,
        }
    }

    /// Archive a submission that never made it into the queue.
    pub fn rejected(submission: &NewOperation, result: OperationResult, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_id: OperationId::new(),
            system_id: submission.system_id,
            account_id: submission.account_id,
            entity_type: submission.entity_type,
            entity_id: submission.entity_id,
            remote_uid: submission.remote_uid.clone(),
            operation_type: submission.operation_type,
            payload: submission.payload.clone(),
            result,
            attempts: 0,
            dry_run: submission.context.dry_run,
            synchronous: submission.context.synchronous,
            manual_event_id: submission.context.manual_event_id,
            queued_at: now,
            created_at: now,
        }
    }
}

/// Read-only view shared by queued and archived operations.
pub trait ProvisioningOperation {
    fn operation_id(&self) -> OperationId;
    fn system_id(&self) -> SystemId;
    fn account_id(&self) -> AccountId;
    fn entity_type(&self) -> EntityType;
    fn entity_id(&self) -> Uuid;
    fn remote_uid(&self) -> &str;
    fn operation_type(&self) -> OperationType;
    fn payload(&self) -> &serde_json::Value;
    fn result(&self) -> &OperationResult;
    fn is_dry_run(&self) -> bool;
}

impl ProvisioningOperation for OperationRecord {
    fn operation_id(&self) -> OperationId {
        self.id
    }
    fn system_id(&self) -> SystemId {
        self.system_id
    }
    fn account_id(&self) -> AccountId {
        self.account_id
    }
    fn entity_type(&self) -> EntityType {
        self.entity_type
    }
    fn entity_id(&self) -> Uuid {
        self.entity_id
    }
    fn remote_uid(&self) -> &str {
        &self.remote_uid
    }
    fn operation_type(&self) -> OperationType {
        self.operation_type
    }
    fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
    fn result(&self) -> &OperationResult {
        &self.result
    }
    fn is_dry_run(&self) -> bool {
        self.context.dry_run
    }
}

impl ProvisioningOperation for ArchiveRecord {
    fn operation_id(&self) -> OperationId {
        self.operation_id
    }
    fn system_id(&self) -> SystemId {
        self.system_id
    }
    fn account_id(&self) -> AccountId {
        self.account_id
    }
    fn entity_type(&self) -> EntityType {
        self.entity_type
    }
    fn entity_id(&self) -> Uuid {
        self.entity_id
    }
    fn remote_uid(&self) -> &str {
        &self.remote_uid
    }
    fn operation_type(&self) -> OperationType {
        self.operation_type
    }
    fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
    fn result(&self) -> &OperationResult {
        &self.result
    }
    fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

/// Either the live record or its archive entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AnyOperation {
    Queued(OperationRecord),
    Archived(ArchiveRecord),
}

impl AnyOperation {
    /// Whether the operation reached a terminal state.
    pub fn is_archived(&self) -> bool {
        matches!(self, AnyOperation::Archived(_))
    }

    /// The read-only view.
    pub fn view(&self) -> &dyn ProvisioningOperation {
        match self {
            AnyOperation::Queued(record) => record,
            AnyOperation::Archived(archive) => archive,
        }
    }

    pub fn as_queued(&self) -> Option<&OperationRecord> {
        match self {
            AnyOperation::Queued(record) => Some(record),
            AnyOperation::Archived(_) => None,
        }
    }

    pub fn as_archived(&self) -> Option<&ArchiveRecord> {
        match self {
            AnyOperation::Archived(archive) => Some(archive),
            AnyOperation::Queued(_) => None,
        }
    }
}
