//! Provisioning service.
//!
//! Entry point for callers: routes synchronous submissions through inline
//! execution and asynchronous ones to the queue, and exposes the operator
//! actions (retry, cancel) and archive queries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use idm_connector::{ConnectorProvider, OperationId};

use crate::attempt::AttemptInfo;
use crate::batch::AccountKey;
use crate::config::ProvisioningConfig;
use crate::executor::{ExecutionOutcome, OperationExecutor, ProcessorError};
use crate::operation::{AnyOperation, ArchiveRecord, NewOperation, OperationRecord, OperationResult};
use crate::queue::{OperationQueue, QueueError};
use crate::store::{ArchiveFilter, Page, PageRequest, QueueStats, QueueStore};

/// How often a synchronous caller re-checks an account held by a worker.
const INLINE_CLAIM_POLL: Duration = Duration::from_millis(50);

/// Service errors.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// Queue error.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Execution error.
    #[error(transparent)]
    Processor(#[from] ProcessorError),

    /// An inline execution ended in a terminal failure. The archive entry
    /// carries the diagnostic.
    #[error("{}", failure_message(.archive))]
    Failed { archive: Box<ArchiveRecord> },
}

impl ProvisioningError {
    /// Archive entry of a failed inline execution.
    pub fn archive(&self) -> Option<&ArchiveRecord> {
        match self {
            ProvisioningError::Failed { archive } => Some(&**archive),
            _ => None,
        }
    }
}

/// Result type for service operations.
pub type ProvisioningResult<T> = Result<T, ProvisioningError>;

enum InlineClaim {
    Claimed(OperationRecord),
    /// Another executor archived the record first.
    Archived(ArchiveRecord),
}

/// The provisioning service.
pub struct ProvisioningService {
    queue: Arc<OperationQueue>,
    executor: Arc<OperationExecutor>,
}

impl ProvisioningService {
    /// Create a service over a store.
    pub fn new(
        store: Arc<dyn QueueStore>,
        connectors: Arc<dyn ConnectorProvider>,
        config: ProvisioningConfig,
    ) -> Self {
        let queue = Arc::new(OperationQueue::new(store, Arc::new(config)));
        Self::with_queue(queue, connectors)
    }

    /// Create a service over an already configured queue.
    pub fn with_queue(queue: Arc<OperationQueue>, connectors: Arc<dyn ConnectorProvider>) -> Self {
        let executor = Arc::new(OperationExecutor::new(queue.clone(), connectors));
        Self { queue, executor }
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn executor(&self) -> &Arc<OperationExecutor> {
        &self.executor
    }

    /// Submit a change.
    ///
    /// Asynchronous submissions return the queued record. Synchronous ones
    /// execute inline and return the archive entry, or the still-queued
    /// record after a retryable failure. A terminal inline failure is
    /// returned as [`ProvisioningError::Failed`].
    ///
    /// Dry runs are previewed at once whatever their synchronous flag, and
    /// leave any record queued for the account untouched.
    #[instrument(
        skip(self, submission),
        fields(
            system_id = %submission.system_id,
            remote_uid = %submission.remote_uid,
            operation_type = %submission.operation_type,
            synchronous = submission.context.synchronous
        )
    )]
    pub async fn submit(&self, submission: NewOperation) -> ProvisioningResult<AnyOperation> {
        if submission.context.dry_run {
            let archive = self.executor.preview(&submission).await?;
            return finish(archive);
        }
        let record = self.queue.submit(&submission).await?.into_record();
        if !submission.context.synchronous {
            return Ok(AnyOperation::Queued(record));
        }
        self.execute_inline(record.id).await
    }

    /// Execute a queued record now, outside its gate schedule.
    ///
    /// The execution carries `manual_event_id`, which keeps it from firing
    /// the queue-drained notification.
    #[instrument(skip(self))]
    pub async fn retry_now(
        &self,
        operation_id: OperationId,
        manual_event_id: Uuid,
    ) -> ProvisioningResult<AnyOperation> {
        let Some(mut claimed) = self.queue.claim(operation_id, Utc::now()).await? else {
            return Err(match self.queue.get(operation_id).await? {
                Some(record) => QueueError::AccountBusy {
                    key: AccountKey::new(record.system_id, record.remote_uid),
                },
                None => QueueError::NotFound { operation_id },
            }
            .into());
        };
        info!(%manual_event_id, "Manual retry");
        claimed.context.manual_event_id = Some(manual_event_id);
        self.run(claimed).await
    }

    /// Cancel a queued record that is not running.
    pub async fn cancel(
        &self,
        operation_id: OperationId,
        reason: &str,
    ) -> ProvisioningResult<ArchiveRecord> {
        Ok(self.queue.cancel(operation_id, reason).await?)
    }

    /// Archive a change that could not be turned into a submission.
    pub async fn reject(
        &self,
        submission: &NewOperation,
        code: &str,
        cause: &str,
    ) -> ProvisioningResult<ArchiveRecord> {
        Ok(self
            .queue
            .archive_rejected(submission, OperationResult::not_executed(code, cause))
            .await?)
    }

    pub async fn find_archive(
        &self,
        filter: &ArchiveFilter,
        page: PageRequest,
    ) -> ProvisioningResult<Page<ArchiveRecord>> {
        Ok(self.queue.find_archive(filter, page).await?)
    }

    pub async fn find_operation(
        &self,
        operation_id: OperationId,
    ) -> ProvisioningResult<Option<AnyOperation>> {
        Ok(self.queue.find_operation(operation_id).await?)
    }

    pub async fn attempts(&self, operation_id: OperationId) -> ProvisioningResult<Vec<AttemptInfo>> {
        Ok(self.queue.attempts(operation_id).await?)
    }

    pub async fn stats(&self) -> ProvisioningResult<QueueStats> {
        Ok(self.queue.stats().await?)
    }

    async fn execute_inline(&self, operation_id: OperationId) -> ProvisioningResult<AnyOperation> {
        match self.claim_inline(operation_id).await? {
            InlineClaim::Claimed(claimed) => self.run(claimed).await,
            InlineClaim::Archived(archive) => finish(archive),
        }
    }

    async fn run(&self, claimed: OperationRecord) -> ProvisioningResult<AnyOperation> {
        match self.executor.execute(claimed).await? {
            ExecutionOutcome::Archived { archive, .. } => finish(archive),
            rescheduled @ ExecutionOutcome::Rescheduled { .. } => Ok(rescheduled.into_operation()),
        }
    }

    /// Claim a record for inline execution, waiting while a worker holds it.
    async fn claim_inline(&self, operation_id: OperationId) -> ProvisioningResult<InlineClaim> {
        let deadline = Instant::now() + self.queue.config().sync_wait_timeout;
        loop {
            if let Some(claimed) = self.queue.claim(operation_id, Utc::now()).await? {
                return Ok(InlineClaim::Claimed(claimed));
            }
            let Some(record) = self.queue.get(operation_id).await? else {
                let archive = self
                    .queue
                    .find_operation(operation_id)
                    .await?
                    .and_then(|op| op.as_archived().cloned())
                    .ok_or(QueueError::NotFound { operation_id })?;
                return Ok(InlineClaim::Archived(archive));
            };
            if Instant::now() >= deadline {
                return Err(QueueError::AccountBusy {
                    key: AccountKey::new(record.system_id, record.remote_uid),
                }
                .into());
            }
            debug!(operation_id = %operation_id, "Account busy, waiting for worker");
            tokio::time::sleep(INLINE_CLAIM_POLL).await;
        }
    }
}

fn failure_message(archive: &ArchiveRecord) -> String {
    format!(
        "{} of {} failed ({}): {}",
        archive.operation_type,
        archive.remote_uid,
        archive.result.state,
        archive.result.cause.as_deref().unwrap_or("no diagnostic")
    )
}

fn finish(archive: ArchiveRecord) -> ProvisioningResult<AnyOperation> {
    if archive.result.state.is_success() {
        Ok(AnyOperation::Archived(archive))
    } else {
        Err(ProvisioningError::Failed {
            archive: Box::new(archive),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{EntityType, OperationState};
    use idm_connector::{AccountId, OperationType, SystemId};

    fn archive(result: OperationResult) -> ArchiveRecord {
        let submission = NewOperation::new(
            SystemId::new(),
            AccountId::new(),
            EntityType::Identity,
            Uuid::new_v4(),
            "jdoe",
            OperationType::Create,
            serde_json::json!({}),
        );
        ArchiveRecord::rejected(&submission, result, Utc::now())
    }

    #[test]
    fn test_finish_success_returns_archive() {
        let op = finish(archive(OperationResult::executed())).unwrap();
        assert_eq!(op.view().result().state, OperationState::Executed);
    }

    #[test]
    fn test_finish_failure_is_structured_error() {
        let err = finish(archive(OperationResult::exception(
            "CONSTRAINT_VIOLATION",
            "mail is mandatory",
        )))
        .unwrap_err();

        let archive = err.archive().unwrap();
        assert_eq!(archive.result.code.as_deref(), Some("CONSTRAINT_VIOLATION"));
        assert_eq!(
            err.to_string(),
            "create of jdoe failed (EXCEPTION): mail is mandatory"
        );
    }
}
