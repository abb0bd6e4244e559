//! Operation queue.
//!
//! The queue accepts submissions, enforces the submission contract and the
//! per-system settings, and is the only path by which records reach the
//! archive, so archive observers see every terminal outcome.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use idm_connector::{OperationId, SystemId};

use crate::attempt::AttemptInfo;
use crate::batch::{AccountKey, BatchGate};
use crate::config::{EffectiveSettings, ProvisioningConfig};
use crate::operation::{
    AnyOperation, ArchiveRecord, NewOperation, OperationRecord, OperationResult,
};
use crate::store::{
    ArchiveFilter, ArchiveOutcome, Page, PageRequest, QueueStats, QueueStore, StoreError,
    SubmitOptions, SubmitOutcome,
};

/// Result code for operations cancelled by an operator.
pub const CANCELLED_CODE: &str = "CANCELLED";

/// Queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The submission breaks the submission contract; nothing was queued.
    #[error("Invalid submission: {message}")]
    InvalidSubmission { message: String },

    /// No queued record with this id.
    #[error("Operation not found: {operation_id}")]
    NotFound { operation_id: OperationId },

    /// The account's record is held by another executor.
    #[error("Account {key} is busy")]
    AccountBusy { key: AccountKey },
}

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Notified of archive writes.
#[async_trait]
pub trait QueueObserver: Send + Sync {
    /// An operation reached a terminal state.
    async fn on_archived(&self, _archive: &ArchiveRecord) {}

    /// The last queued operation of a system was archived.
    ///
    /// Not fired when the archived operation was an operator retry.
    async fn on_queue_drained(&self, _system_id: SystemId) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

#[async_trait]
impl QueueObserver for NoopObserver {}

/// The provisioning operation queue.
pub struct OperationQueue {
    store: Arc<dyn QueueStore>,
    config: Arc<ProvisioningConfig>,
    observer: Arc<dyn QueueObserver>,
}

impl OperationQueue {
    /// Create a new queue.
    pub fn new(store: Arc<dyn QueueStore>, config: Arc<ProvisioningConfig>) -> Self {
        Self {
            store,
            config,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Set the archive observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn QueueObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &ProvisioningConfig {
        &self.config
    }

    /// Effective settings for a system.
    pub fn settings(&self, system_id: SystemId) -> EffectiveSettings {
        self.config.resolve(system_id)
    }

    /// Queue a submission, or merge it into the account's active record.
    ///
    /// Nothing is sent to the target system here. Dry runs are refused: they
    /// are previewed without a gate so they can never merge with a live
    /// change.
    pub async fn submit(&self, submission: &NewOperation) -> QueueResult<SubmitOutcome> {
        submission
            .validate()
            .map_err(|message| QueueError::InvalidSubmission { message })?;
        if submission.context.dry_run {
            return Err(QueueError::InvalidSubmission {
                message: "dry-run submissions are previewed, not queued".to_string(),
            });
        }

        let settings = self.settings(submission.system_id);
        let options = SubmitOptions {
            max_attempts: submission.max_attempts.unwrap_or(settings.max_attempts),
            debounce: settings.chrono_debounce(),
        };
        let outcome = self.store.submit(submission, options, Utc::now()).await?;

        let record = outcome.record();
        if outcome.is_merged() {
            debug!(
                operation_id = %record.id,
                system_id = %record.system_id,
                remote_uid = %record.remote_uid,
                operation_type = %record.operation_type,
                "Merged submission into queued operation"
            );
        } else {
            info!(
                operation_id = %record.id,
                system_id = %record.system_id,
                remote_uid = %record.remote_uid,
                operation_type = %record.operation_type,
                "Queued provisioning operation"
            );
        }
        Ok(outcome)
    }

    pub async fn get(&self, id: OperationId) -> QueueResult<Option<OperationRecord>> {
        Ok(self.store.get(id).await?)
    }

    pub async fn find_active(&self, key: &AccountKey) -> QueueResult<Option<OperationRecord>> {
        Ok(self.store.find_active(key).await?)
    }

    pub async fn gate(&self, key: &AccountKey) -> QueueResult<Option<BatchGate>> {
        Ok(self.store.get_gate(key).await?)
    }

    /// Gates that are due now.
    pub async fn list_due(&self, now: DateTime<Utc>, limit: u32) -> QueueResult<Vec<BatchGate>> {
        Ok(self.store.list_due_gates(now, limit).await?)
    }

    /// Claim one record for inline execution.
    pub async fn claim(
        &self,
        id: OperationId,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<OperationRecord>> {
        Ok(self.store.claim(id, now).await?)
    }

    /// Claim records behind due gates.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> QueueResult<Vec<OperationRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        Ok(self.store.claim_due(now, limit).await?)
    }

    /// Return a claimed record to the queue until `next_attempt`.
    pub async fn reschedule(
        &self,
        claimed: &OperationRecord,
        result: OperationResult,
        next_attempt: DateTime<Utc>,
    ) -> QueueResult<OperationRecord> {
        let record = self.store.reschedule(claimed, result, next_attempt).await?;
        debug!(
            operation_id = %record.id,
            attempt = record.current_attempt,
            next_attempt = %next_attempt,
            "Rescheduled operation"
        );
        Ok(record)
    }

    /// Archive a claimed record with its terminal result.
    pub async fn archive(
        &self,
        claimed: &OperationRecord,
        result: OperationResult,
    ) -> QueueResult<ArchiveOutcome> {
        let outcome = self.store.archive(claimed, result, Utc::now()).await?;
        if let Some(requeued) = &outcome.requeued {
            debug!(
                operation_id = %requeued.id,
                operation_type = %requeued.operation_type,
                "Newer submission stays queued after archive"
            );
        }
        self.notify(&outcome).await;
        Ok(outcome)
    }

    /// Archive a submission that never reached the queue.
    pub async fn archive_rejected(
        &self,
        submission: &NewOperation,
        result: OperationResult,
    ) -> QueueResult<ArchiveRecord> {
        let archive = ArchiveRecord::rejected(submission, result, Utc::now());
        self.store.archive_rejected(archive.clone()).await?;
        warn!(
            system_id = %archive.system_id,
            remote_uid = %archive.remote_uid,
            code = ?archive.result.code,
            "Archived rejected operation"
        );
        self.observer.on_archived(&archive).await;
        Ok(archive)
    }

    /// Archive a record that was executed without ever being queued.
    pub async fn archive_detached(
        &self,
        record: &OperationRecord,
        result: OperationResult,
    ) -> QueueResult<ArchiveRecord> {
        let archive = ArchiveRecord::from_terminal(record, result, Utc::now());
        self.store.archive_rejected(archive.clone()).await?;
        info!(
            operation_id = %archive.operation_id,
            system_id = %archive.system_id,
            remote_uid = %archive.remote_uid,
            state = %archive.result.state,
            dry_run = archive.dry_run,
            "Archived detached operation"
        );
        self.observer.on_archived(&archive).await;
        Ok(archive)
    }

    /// Archive a queued record without executing it.
    pub async fn cancel(&self, id: OperationId, reason: &str) -> QueueResult<ArchiveRecord> {
        let result = OperationResult::not_executed(CANCELLED_CODE, reason);
        match self.store.cancel(id, result, Utc::now()).await? {
            Some(outcome) => {
                info!(operation_id = %id, reason = %reason, "Cancelled operation");
                self.notify(&outcome).await;
                Ok(outcome.archive)
            }
            None => match self.store.get(id).await? {
                Some(record) => Err(QueueError::AccountBusy {
                    key: AccountKey::new(record.system_id, record.remote_uid),
                }),
                None => Err(QueueError::NotFound { operation_id: id }),
            },
        }
    }

    /// Return records held longer than the stale threshold to the queue.
    ///
    /// The threshold never undercuts a connector timeout, so a record whose
    /// call may still be in flight stays claimed.
    pub async fn release_stale(&self) -> QueueResult<u64> {
        let stale_after = chrono::Duration::from_std(self.config.stale_threshold())
            .unwrap_or_else(|_| chrono::Duration::days(1));
        Ok(self.store.release_stale(Utc::now() - stale_after).await?)
    }

    pub async fn record_attempt(&self, attempt: &AttemptInfo) -> QueueResult<()> {
        Ok(self.store.record_attempt(attempt).await?)
    }

    /// Attempt history, oldest first.
    pub async fn attempts(&self, operation_id: OperationId) -> QueueResult<Vec<AttemptInfo>> {
        Ok(self.store.list_attempts(operation_id).await?)
    }

    /// Query the archive.
    pub async fn find_archive(
        &self,
        filter: &ArchiveFilter,
        page: PageRequest,
    ) -> QueueResult<Page<ArchiveRecord>> {
        Ok(self.store.find_archive(filter, page).await?)
    }

    /// The queued record with this id, or else its latest archive entry.
    pub async fn find_operation(&self, id: OperationId) -> QueueResult<Option<AnyOperation>> {
        if let Some(record) = self.store.get(id).await? {
            return Ok(Some(AnyOperation::Queued(record)));
        }
        Ok(self
            .store
            .find_archive_by_operation(id)
            .await?
            .map(AnyOperation::Archived))
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        Ok(self.store.stats(Utc::now()).await?)
    }

    async fn notify(&self, outcome: &ArchiveOutcome) {
        let archive = &outcome.archive;
        info!(
            operation_id = %archive.operation_id,
            system_id = %archive.system_id,
            remote_uid = %archive.remote_uid,
            state = %archive.result.state,
            attempts = archive.attempts,
            "Archived operation"
        );
        self.observer.on_archived(archive).await;

        if outcome.system_drained && archive.manual_event_id.is_none() {
            debug!(system_id = %archive.system_id, "Provisioning queue drained");
            self.observer.on_queue_drained(archive.system_id).await;
        }
    }
}
