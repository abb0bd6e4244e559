//! Provisioning Worker
//!
//! Background worker that executes due operations. Accounts run
//! concurrently; one account never has two executions in flight because
//! only one record per account exists and claiming it is exclusive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use crate::executor::{ExecutionOutcome, OperationProcessor};
use crate::operation::OperationRecord;
use crate::queue::OperationQueue;

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Number of concurrent executions.
    pub concurrency: usize,

    /// How often to scan for due gates.
    pub poll_interval: Duration,

    /// How often to release stale claims.
    pub stale_release_interval: Duration,

    /// Maximum records claimed per scan.
    pub batch_size: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
            stale_release_interval: Duration::from_secs(300),
            batch_size: 10,
        }
    }
}

/// Worker that drains the operation queue.
pub struct ProvisioningWorker<P: OperationProcessor> {
    queue: Arc<OperationQueue>,
    processor: Arc<P>,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
}

impl<P: OperationProcessor + 'static> ProvisioningWorker<P> {
    /// Create a new worker.
    pub fn new(queue: Arc<OperationQueue>, processor: Arc<P>, config: WorkerConfig) -> Self {
        Self {
            queue,
            processor,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the worker.
    #[instrument(skip(self))]
    pub async fn run(&self) {
        info!(
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting provisioning worker"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut poll_interval = interval(self.config.poll_interval);
        let mut stale_interval = interval(self.config.stale_release_interval);

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        info!("Worker shutdown requested, stopping poll loop");
                        break;
                    }
                    self.poll_and_process(&semaphore).await;
                }
                _ = stale_interval.tick() => {
                    self.release_stale_operations().await;
                }
            }
        }

        // Wait for in-flight operations to complete
        info!("Waiting for in-flight operations to complete...");
        let permits = u32::try_from(self.config.concurrency).unwrap_or(u32::MAX);
        let _ = semaphore.acquire_many(permits).await;
        info!("Worker stopped");
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Check if shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Run one scan and wait for every execution it started.
    ///
    /// Returns the number of records executed.
    pub async fn run_once(&self) -> usize {
        let limit = self
            .config
            .batch_size
            .min(u32::try_from(self.config.concurrency).unwrap_or(u32::MAX));
        let operations = match self.queue.claim_due(Utc::now(), limit).await {
            Ok(ops) => ops,
            Err(e) => {
                error!(error = %e, "Failed to claim due operations");
                return 0;
            }
        };

        let count = operations.len();
        let mut tasks = JoinSet::new();
        for operation in operations {
            let processor = self.processor.clone();
            tasks.spawn(process_operation(processor, operation));
        }
        while tasks.join_next().await.is_some() {}
        count
    }

    /// Claim as many due records as there are free slots and run them.
    async fn poll_and_process(&self, semaphore: &Arc<Semaphore>) {
        let free = u32::try_from(semaphore.available_permits()).unwrap_or(u32::MAX);
        let limit = self.config.batch_size.min(free);
        if limit == 0 {
            debug!("All worker slots busy, skipping poll");
            return;
        }

        let operations = match self.queue.claim_due(Utc::now(), limit).await {
            Ok(ops) => ops,
            Err(e) => {
                error!(error = %e, "Failed to claim due operations");
                return;
            }
        };

        if operations.is_empty() {
            return;
        }

        debug!(count = operations.len(), "Claimed operations for processing");

        for operation in operations {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                warn!("Worker semaphore closed, leaving claimed operations for stale release");
                return;
            };
            let processor = self.processor.clone();

            tokio::spawn(async move {
                let _permit = permit; // Hold permit until task completes
                process_operation(processor, operation).await;
            });
        }
    }

    /// Release operations whose executor disappeared.
    async fn release_stale_operations(&self) {
        match self.queue.release_stale().await {
            Ok(count) if count > 0 => {
                warn!(count = count, "Released stale operations");
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Failed to release stale operations");
            }
        }
    }
}

/// Execute a single claimed operation.
#[instrument(skip(processor, operation), fields(operation_id = %operation.id))]
async fn process_operation<P: OperationProcessor>(processor: Arc<P>, operation: OperationRecord) {
    info!(
        operation_type = %operation.operation_type,
        system_id = %operation.system_id,
        remote_uid = %operation.remote_uid,
        "Processing operation"
    );

    let start = std::time::Instant::now();
    let result = processor.process(operation).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(ExecutionOutcome::Archived { archive, .. }) => {
            info!(
                duration_ms = duration_ms,
                state = %archive.result.state,
                "Operation archived"
            );
        }
        Ok(ExecutionOutcome::Rescheduled { record, next_attempt }) => {
            warn!(
                duration_ms = duration_ms,
                attempt = record.current_attempt,
                next_attempt = %next_attempt,
                "Operation rescheduled"
            );
        }
        Err(e) => {
            error!(duration_ms = duration_ms, error = %e, "Operation processing failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.batch_size, 10);
    }
}
