//! Queue persistence.
//!
//! [`QueueStore`] owns the three tables of the engine: active operations,
//! batch gates and the archive (plus attempt history). Every method that
//! touches a gate is a single atomic step for that account, which is what
//! keeps one active record per (system, remote uid) under concurrent
//! submitters and workers.

mod memory;
mod postgres;

pub use memory::MemoryQueueStore;
pub use postgres::PgQueueStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use idm_connector::{AccountId, OperationId, OperationType, SystemId};

use crate::attempt::AttemptInfo;
use crate::batch::{AccountKey, BatchGate};
use crate::operation::{ArchiveRecord, NewOperation, OperationRecord, OperationResult, OperationState};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A persisted row could not be mapped back into the model.
    #[error("Invalid stored row: {0}")]
    InvalidRow(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The record was archived, or released and claimed again, while this
    /// claim was executing. Nothing was written.
    #[error("Claim on operation {operation_id} was lost")]
    ClaimLost { operation_id: OperationId },
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Parameters resolved by the queue before a submission reaches the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Attempt budget for a newly created record.
    pub max_attempts: u32,
    /// Window added to the gate when a submission merges into a queued record.
    pub debounce: Option<Duration>,
}

/// What a submission did to the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// A new gate and record were created.
    Created(OperationRecord),
    /// The submission replaced the payload of the active record.
    Merged(OperationRecord),
}

impl SubmitOutcome {
    pub fn record(&self) -> &OperationRecord {
        match self {
            SubmitOutcome::Created(record) | SubmitOutcome::Merged(record) => record,
        }
    }

    pub fn into_record(self) -> OperationRecord {
        match self {
            SubmitOutcome::Created(record) | SubmitOutcome::Merged(record) => record,
        }
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, SubmitOutcome::Merged(_))
    }
}

/// What archiving a claimed record did to the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveOutcome {
    pub archive: ArchiveRecord,
    /// A newer submission that merged while the archived attempt was in
    /// flight; it stays queued behind the same gate.
    pub requeued: Option<OperationRecord>,
    /// No active record is left for the archived record's system.
    pub system_drained: bool,
}

/// Archive query filter. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveFilter {
    pub entity_id: Option<uuid::Uuid>,
    pub system_id: Option<SystemId>,
    pub account_id: Option<AccountId>,
    pub operation_type: Option<OperationType>,
    pub state: Option<OperationState>,
    /// Archived on or after this instant.
    pub from: Option<DateTime<Utc>>,
    /// Archived on or before this instant.
    pub till: Option<DateTime<Utc>>,
}

impl ArchiveFilter {
    /// Whether an archive entry satisfies the filter.
    pub fn matches(&self, archive: &ArchiveRecord) -> bool {
        self.entity_id.map_or(true, |id| archive.entity_id == id)
            && self.system_id.map_or(true, |id| archive.system_id == id)
            && self.account_id.map_or(true, |id| archive.account_id == id)
            && self
                .operation_type
                .map_or(true, |t| archive.operation_type == t)
            && self.state.map_or(true, |s| archive.result.state == s)
            && self.from.map_or(true, |from| archive.created_at >= from)
            && self.till.map_or(true, |till| archive.created_at <= till)
    }
}

/// Offset pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: u64,
    pub limit: u64,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

impl PageRequest {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }
}

/// One page of results plus the total number of matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u64,
}

/// Snapshot of queue contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Active records.
    pub queued: u64,
    /// Active records currently held by a worker.
    pub running: u64,
    /// Active records whose gate is due.
    pub due: u64,
    pub archived_executed: u64,
    pub archived_failed: u64,
    pub archived_not_executed: u64,
}

/// Persistence for the operation queue, batch gates and archive.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Create a gate and record, or merge into the active record of the account.
    async fn submit(
        &self,
        submission: &NewOperation,
        options: SubmitOptions,
        now: DateTime<Utc>,
    ) -> StoreResult<SubmitOutcome>;

    /// Get an active record by id.
    async fn get(&self, id: OperationId) -> StoreResult<Option<OperationRecord>>;

    /// Get the active record of an account.
    async fn find_active(&self, key: &AccountKey) -> StoreResult<Option<OperationRecord>>;

    /// Get the gate of an account.
    async fn get_gate(&self, key: &AccountKey) -> StoreResult<Option<BatchGate>>;

    /// Gates whose `next_attempt` has passed, earliest first.
    async fn list_due_gates(&self, now: DateTime<Utc>, limit: u32) -> StoreResult<Vec<BatchGate>>;

    /// Mark one record RUNNING regardless of its gate.
    ///
    /// Returns `None` when the record is gone or already held by a worker.
    async fn claim(&self, id: OperationId, now: DateTime<Utc>)
        -> StoreResult<Option<OperationRecord>>;

    /// Mark up to `limit` records behind due gates RUNNING and return them.
    async fn claim_due(&self, now: DateTime<Utc>, limit: u32) -> StoreResult<Vec<OperationRecord>>;

    /// Return a claimed record to the queue after a retryable failure.
    ///
    /// Takes the attempt counter from `claimed`, keeps the stored payload
    /// (which may be newer) and advances the gate to `next_attempt`.
    /// Fails with [`StoreError::ClaimLost`] when `claimed` no longer holds
    /// the record.
    async fn reschedule(
        &self,
        claimed: &OperationRecord,
        result: OperationResult,
        next_attempt: DateTime<Utc>,
    ) -> StoreResult<OperationRecord>;

    /// Move a claimed record to the archive and clear its gate.
    ///
    /// If a submission merged while the record was in flight, the executed
    /// snapshot is archived and the newer payload stays queued. Fails with
    /// [`StoreError::ClaimLost`], writing nothing, when the record is gone or
    /// another claim holds it.
    async fn archive(
        &self,
        claimed: &OperationRecord,
        result: OperationResult,
        now: DateTime<Utc>,
    ) -> StoreResult<ArchiveOutcome>;

    /// Archive an operation that was never queued: a rejected submission or
    /// a dry-run preview.
    async fn archive_rejected(&self, archive: ArchiveRecord) -> StoreResult<()>;

    /// Archive a queued, not running record without executing it.
    async fn cancel(
        &self,
        id: OperationId,
        result: OperationResult,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ArchiveOutcome>>;

    /// Put records claimed before `claimed_before` back into the queue.
    async fn release_stale(&self, claimed_before: DateTime<Utc>) -> StoreResult<u64>;

    /// Query the archive.
    async fn find_archive(
        &self,
        filter: &ArchiveFilter,
        page: PageRequest,
    ) -> StoreResult<Page<ArchiveRecord>>;

    /// Latest archive entry produced from an operation.
    async fn find_archive_by_operation(
        &self,
        operation_id: OperationId,
    ) -> StoreResult<Option<ArchiveRecord>>;

    /// Append an attempt to the history.
    async fn record_attempt(&self, attempt: &AttemptInfo) -> StoreResult<()>;

    /// Attempt history of an operation, oldest first.
    async fn list_attempts(&self, operation_id: OperationId) -> StoreResult<Vec<AttemptInfo>>;

    /// Number of active records for a system.
    async fn count_active(&self, system_id: SystemId) -> StoreResult<u64>;

    /// Queue and archive counters.
    async fn stats(&self, now: DateTime<Utc>) -> StoreResult<QueueStats>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{EntityType, OperationResult};

    fn archive(system_id: SystemId, operation_type: OperationType) -> ArchiveRecord {
        let submission = NewOperation::new(
            system_id,
            AccountId::new(),
            EntityType::Identity,
            uuid::Uuid::new_v4(),
            "jdoe",
            operation_type,
            serde_json::json!({}),
        );
        ArchiveRecord::rejected(&submission, OperationResult::executed(), Utc::now())
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = ArchiveFilter::default();
        assert!(filter.matches(&archive(SystemId::new(), OperationType::Create)));
    }

    #[test]
    fn test_filter_by_system_and_type() {
        let system_id = SystemId::new();
        let filter = ArchiveFilter {
            system_id: Some(system_id),
            operation_type: Some(OperationType::Update),
            ..Default::default()
        };
        assert!(filter.matches(&archive(system_id, OperationType::Update)));
        assert!(!filter.matches(&archive(system_id, OperationType::Delete)));
        assert!(!filter.matches(&archive(SystemId::new(), OperationType::Update)));
    }

    #[test]
    fn test_filter_by_time_range() {
        let record = archive(SystemId::new(), OperationType::Create);
        let filter = ArchiveFilter {
            from: Some(record.created_at + Duration::seconds(1)),
            ..Default::default()
        };
        assert!(!filter.matches(&record));

        let filter = ArchiveFilter {
            from: Some(record.created_at - Duration::seconds(1)),
            till: Some(record.created_at),
            ..Default::default()
        };
        assert!(filter.matches(&record));
    }
}
