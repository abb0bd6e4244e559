//! Operation executor.
//!
//! Executes claimed records against their connector and turns the outcome
//! into a queue transition: archive on success or permanent failure,
//! reschedule behind the gate on a retryable failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use uuid::Uuid;

use idm_connector::{
    Connector, ConnectorError, ConnectorProvider, ConnectorRequest, ConnectorResponse,
    ConnectorResult, OperationId, SystemId,
};

use crate::attempt::{AttemptCompletion, AttemptInfo};
use crate::operation::{
    AnyOperation, ArchiveRecord, NewOperation, OperationRecord, OperationResult,
};
use crate::queue::{OperationQueue, QueueError};
use crate::store::StoreError;

/// Processor errors.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// Queue error.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Connector error.
    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    /// No connector serves the system.
    #[error("Connector not found for system {system_id}")]
    ConnectorNotFound { system_id: SystemId },

    /// The system accepts no writes.
    #[error("System {system_id} is read-only")]
    SystemReadOnly { system_id: SystemId },

    /// The record was released and claimed by another execution while this
    /// one ran. Its outcome was discarded.
    #[error("Claim on operation {operation_id} was lost")]
    ClaimLost { operation_id: OperationId },
}

impl ProcessorError {
    fn from_transition(error: QueueError) -> Self {
        match error {
            QueueError::Store(StoreError::ClaimLost { operation_id }) => {
                warn!(operation_id = %operation_id, "Claim lost, outcome discarded");
                ProcessorError::ClaimLost { operation_id }
            }
            other => ProcessorError::Queue(other),
        }
    }
}

/// Result type for processor operations.
pub type ProcessorResult<T> = Result<T, ProcessorError>;

/// Classify an error into a result code and whether it is worth retrying.
pub fn classify_error(error: &ProcessorError) -> (String, bool) {
    match error {
        ProcessorError::Connector(ce) => (ce.error_code().to_string(), ce.is_transient()),
        ProcessorError::ConnectorNotFound { .. } => ("CONNECTOR_NOT_FOUND".to_string(), false),
        ProcessorError::SystemReadOnly { .. } => ("SYSTEM_READ_ONLY".to_string(), false),
        ProcessorError::ClaimLost { .. } => ("CLAIM_LOST".to_string(), false),
        ProcessorError::Queue(_) => ("QUEUE_ERROR".to_string(), true),
    }
}

/// What one execution did to the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Terminal: the record moved to the archive.
    Archived {
        archive: ArchiveRecord,
        /// A submission that merged while this execution was in flight.
        requeued: Option<OperationRecord>,
    },
    /// Retryable failure; the record waits behind its gate.
    Rescheduled {
        record: OperationRecord,
        next_attempt: DateTime<Utc>,
    },
}

impl ExecutionOutcome {
    pub fn is_archived(&self) -> bool {
        matches!(self, ExecutionOutcome::Archived { .. })
    }

    pub fn result(&self) -> &OperationResult {
        match self {
            ExecutionOutcome::Archived { archive, .. } => &archive.result,
            ExecutionOutcome::Rescheduled { record, .. } => &record.result,
        }
    }

    /// The executed operation as seen by the caller.
    pub fn into_operation(self) -> AnyOperation {
        match self {
            ExecutionOutcome::Archived { archive, .. } => AnyOperation::Archived(archive),
            ExecutionOutcome::Rescheduled { record, .. } => AnyOperation::Queued(record),
        }
    }
}

/// Executes claimed operations. Lets the worker stay generic over execution.
#[async_trait]
pub trait OperationProcessor: Send + Sync {
    /// Execute one claimed record.
    async fn process(&self, claimed: OperationRecord) -> ProcessorResult<ExecutionOutcome>;
}

/// The default executor: connector call with timeout, retry and dry run.
pub struct OperationExecutor {
    queue: Arc<OperationQueue>,
    connectors: Arc<dyn ConnectorProvider>,
}

impl OperationExecutor {
    /// Create a new executor.
    pub fn new(queue: Arc<OperationQueue>, connectors: Arc<dyn ConnectorProvider>) -> Self {
        Self { queue, connectors }
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    /// Execute a claimed record.
    #[instrument(
        skip(self, claimed),
        fields(
            operation_id = %claimed.id,
            system_id = %claimed.system_id,
            remote_uid = %claimed.remote_uid,
            operation_type = %claimed.operation_type
        )
    )]
    pub async fn execute(&self, mut claimed: OperationRecord) -> ProcessorResult<ExecutionOutcome> {
        let settings = self.queue.settings(claimed.system_id);

        if settings.read_only {
            let error = ProcessorError::SystemReadOnly {
                system_id: claimed.system_id,
            };
            warn!("Target system is read-only, operation not executed");
            return self.reject(&claimed, &error).await;
        }

        if claimed.context.dry_run {
            claimed.current_attempt += 1;
            self.record_attempt(&claimed, Utc::now(), AttemptCompletion::success())
                .await;
            info!("Dry run, connector not called");
            return self.finish(&claimed, OperationResult::dry_run()).await;
        }

        let Some(connector) = self.connectors.get_connector(claimed.system_id).await else {
            let error = ProcessorError::ConnectorNotFound {
                system_id: claimed.system_id,
            };
            error!("No connector registered for system");
            return self.reject(&claimed, &error).await;
        };

        claimed.current_attempt += 1;
        let started_at = Utc::now();
        debug!(
            attempt = claimed.current_attempt,
            max_attempts = claimed.max_attempts,
            connector = connector.display_name(),
            "Invoking connector"
        );

        match invoke(connector.as_ref(), &claimed, settings.connector_timeout).await {
            Ok(response) => {
                self.record_attempt(&claimed, started_at, AttemptCompletion::success())
                    .await;
                if let Some(uid) = response.uid.as_deref().filter(|uid| *uid != claimed.remote_uid) {
                    debug!(reported_uid = %uid, "Target system reported a different uid");
                }
                let result = match response.diagnostic {
                    Some(diagnostic) => OperationResult::warning(diagnostic),
                    None => OperationResult::executed(),
                };
                info!(
                    attempt = claimed.current_attempt,
                    duration_ms = (Utc::now() - started_at).num_milliseconds(),
                    "Operation executed"
                );
                self.finish(&claimed, result).await
            }
            Err(connector_error) => {
                let message = connector_error.to_string();
                let (code, is_transient) =
                    classify_error(&ProcessorError::Connector(connector_error));
                self.record_attempt(
                    &claimed,
                    started_at,
                    AttemptCompletion::failure(&code, &message),
                )
                .await;
                let result = OperationResult::exception(&code, &message);

                if is_transient && !claimed.attempts_exhausted() {
                    let next_attempt =
                        Utc::now() + settings.backoff.chrono_delay(claimed.current_attempt);
                    warn!(
                        attempt = claimed.current_attempt,
                        max_attempts = claimed.max_attempts,
                        code = %code,
                        error = %message,
                        next_attempt = %next_attempt,
                        "Operation failed, retry scheduled"
                    );
                    let record = self
                        .queue
                        .reschedule(&claimed, result, next_attempt)
                        .await
                        .map_err(ProcessorError::from_transition)?;
                    return Ok(ExecutionOutcome::Rescheduled {
                        record,
                        next_attempt,
                    });
                }

                error!(
                    attempt = claimed.current_attempt,
                    code = %code,
                    error = %message,
                    transient = is_transient,
                    "Operation failed permanently"
                );
                self.finish(&claimed, result).await
            }
        }
    }

    /// Run a dry-run submission without queueing it.
    ///
    /// The preview never touches the account's gate, so a live record queued
    /// for the same account keeps its payload and schedule.
    #[instrument(
        skip(self, submission),
        fields(
            system_id = %submission.system_id,
            remote_uid = %submission.remote_uid,
            operation_type = %submission.operation_type
        )
    )]
    pub async fn preview(&self, submission: &NewOperation) -> ProcessorResult<ArchiveRecord> {
        submission
            .validate()
            .map_err(|message| QueueError::InvalidSubmission { message })?;
        let settings = self.queue.settings(submission.system_id);
        let mut record =
            OperationRecord::from_submission(submission, Uuid::new_v4(), 1, Utc::now());
        record.context.dry_run = true;

        let result = if settings.read_only {
            let error = ProcessorError::SystemReadOnly {
                system_id: record.system_id,
            };
            warn!("Target system is read-only, operation not executed");
            let (code, _) = classify_error(&error);
            OperationResult::not_executed(code, error.to_string())
        } else {
            record.current_attempt = 1;
            self.record_attempt(&record, Utc::now(), AttemptCompletion::success())
                .await;
            info!("Dry run, connector not called");
            OperationResult::dry_run()
        };

        Ok(self.queue.archive_detached(&record, result).await?)
    }

    /// Claim and execute records behind due gates, one after another.
    pub async fn process_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> ProcessorResult<Vec<ExecutionOutcome>> {
        let claimed = self.queue.claim_due(now, limit).await?;
        let mut outcomes = Vec::with_capacity(claimed.len());
        for record in claimed {
            let operation_id = record.id;
            match self.execute(record).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(operation_id = %operation_id, error = %e, "Execution failed"),
            }
        }
        Ok(outcomes)
    }

    /// Archive without contacting the target system.
    async fn reject(
        &self,
        claimed: &OperationRecord,
        error: &ProcessorError,
    ) -> ProcessorResult<ExecutionOutcome> {
        let (code, _) = classify_error(error);
        let result = OperationResult::not_executed(code, error.to_string());
        self.finish(claimed, result).await
    }

    async fn finish(
        &self,
        claimed: &OperationRecord,
        result: OperationResult,
    ) -> ProcessorResult<ExecutionOutcome> {
        let outcome = self
            .queue
            .archive(claimed, result)
            .await
            .map_err(ProcessorError::from_transition)?;
        Ok(ExecutionOutcome::Archived {
            archive: outcome.archive,
            requeued: outcome.requeued,
        })
    }

    async fn record_attempt(
        &self,
        claimed: &OperationRecord,
        started_at: DateTime<Utc>,
        completion: AttemptCompletion,
    ) {
        let attempt = AttemptInfo::finished(
            claimed.id,
            claimed.current_attempt,
            started_at,
            Utc::now(),
            completion,
            claimed.context.dry_run,
        );
        if let Err(e) = self.queue.record_attempt(&attempt).await {
            warn!(error = %e, "Failed to record attempt");
        }
    }
}

#[async_trait]
impl OperationProcessor for OperationExecutor {
    async fn process(&self, claimed: OperationRecord) -> ProcessorResult<ExecutionOutcome> {
        self.execute(claimed).await
    }
}

/// Call the connector, enforcing the timeout from outside.
async fn invoke(
    connector: &dyn Connector,
    record: &OperationRecord,
    timeout: Duration,
) -> ConnectorResult<ConnectorResponse> {
    if !connector.is_healthy() {
        return Err(ConnectorError::TargetUnavailable {
            message: format!("{} reports unhealthy", connector.display_name()),
        });
    }
    let request = ConnectorRequest {
        system_id: record.system_id,
        operation_type: record.operation_type,
        remote_uid: &record.remote_uid,
        payload: &record.payload,
        timeout,
    };
    match tokio::time::timeout(timeout, connector.invoke(request)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectorError::timeout(timeout)),
    }
}
