//! # Provisioning Engine
//!
//! Delivers identity changes to external target systems through a per-account
//! operation queue.
//!
//! This crate provides the infrastructure for:
//! - Submission with merge: one active operation per (system, remote uid)
//! - Batch gates that serialize execution per remote account
//! - Retry with pluggable backoff, dry run and synchronous execution
//! - An immutable archive of terminal operations with filtered queries
//! - Ordering of role changes (additions first, net-effect collapse)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────┐     ┌──────────────┐
//! │  Role events    │────►│ Coordinator  │────►│   Service    │
//! └─────────────────┘     └──────────────┘     └──────┬───────┘
//!                                                     │ submit / merge
//!                                                     ▼
//!                         ┌──────────────┐     ┌──────────────┐
//!                         │    Worker    │◄───►│ Queue + gate │
//!                         └──────┬───────┘     └──────┬───────┘
//!                                ▼                    │ terminal
//!                         ┌──────────────┐            ▼
//!                         │  Executor    │     ┌──────────────┐
//!                         │ (connector)  │     │   Archive    │
//!                         └──────────────┘     └──────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use idm_provisioning::{MemoryQueueStore, NewOperation, ProvisioningConfig, ProvisioningService};
//! use idm_connector::OperationType;
//!
//! let service = ProvisioningService::new(
//!     Arc::new(MemoryQueueStore::new()),
//!     connectors,
//!     ProvisioningConfig::from_env()?,
//! );
//!
//! let submission = NewOperation::new(
//!     system_id,
//!     account_id,
//!     EntityType::Identity,
//!     identity_id,
//!     "jdoe",
//!     OperationType::Create,
//!     serde_json::json!({ "mail": "john.doe@example.com" }),
//! );
//!
//! service.submit(submission).await?;
//! ```

pub mod attempt;
pub mod backoff;
pub mod batch;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod executor;
pub mod operation;
pub mod queue;
pub mod service;
pub mod store;
pub mod worker;

// Re-exports for convenience
pub use attempt::{AttemptCompletion, AttemptInfo};
pub use backoff::{BackoffPolicy, DEFAULT_RETRY_INTERVAL};
pub use batch::{AccountKey, BatchGate};
pub use config::{
    BackoffKind, ConfigError, EffectiveSettings, ProvisioningConfig, SystemSettings,
};
pub use coordinator::{
    AccountMapping, AccountState, AccountTarget, CoordinatorError, CoordinatorResult, Effect,
    MappingError, MappingResult, OrderingCoordinator, PlannedOperation, ReconcilePlan,
    ReconcileReport, RoleChange, MAPPING_FAILED_CODE,
};
pub use events::{
    EventError, EventResult, ProvisioningEventHandler, RoleAssignmentEvent, RoleResolver,
};
pub use executor::{
    classify_error, ExecutionOutcome, OperationExecutor, OperationProcessor, ProcessorError,
    ProcessorResult,
};
pub use operation::{
    AnyOperation, ArchiveRecord, EntityType, NewOperation, OperationRecord, OperationResult,
    OperationState, ProvisioningContext, ProvisioningOperation, DEFAULT_MAX_ATTEMPTS,
    DRY_RUN_CODE,
};
pub use queue::{
    NoopObserver, OperationQueue, QueueError, QueueObserver, QueueResult, CANCELLED_CODE,
};
pub use service::{ProvisioningError, ProvisioningResult, ProvisioningService};
pub use store::{
    ArchiveFilter, ArchiveOutcome, MemoryQueueStore, Page, PageRequest, PgQueueStore,
    QueueStats, QueueStore, StoreError, StoreResult, SubmitOptions, SubmitOutcome,
};
pub use worker::{ProvisioningWorker, WorkerConfig};
