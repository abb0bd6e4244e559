//! Attempt tracking for provisioning operations.
//!
//! Every dispatched execution of an operation is recorded, so retry history
//! survives the operation itself being archived.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use idm_connector::OperationId;

/// Details of an attempt completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptCompletion {
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Error code (if failed).
    pub error_code: Option<String>,
    /// Error message (if failed).
    pub error_message: Option<String>,
}

impl AttemptCompletion {
    /// Create a successful completion.
    pub fn success() -> Self {
        Self {
            success: true,
            error_code: None,
            error_message: None,
        }
    }

    /// Create a failed completion.
    pub fn failure(error_code: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_code: Some(error_code.into()),
            error_message: Some(error_message.into()),
        }
    }
}

/// One recorded execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptInfo {
    /// Attempt ID.
    pub id: Uuid,
    /// Operation the attempt belongs to.
    pub operation_id: OperationId,
    /// Attempt sequence number (1-based).
    pub attempt_number: u32,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt completed.
    pub completed_at: DateTime<Utc>,
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Error code (if failed).
    pub error_code: Option<String>,
    /// Error message (if failed).
    pub error_message: Option<String>,
    /// Duration in milliseconds.
    pub duration_ms: i64,
    /// Whether the connector was skipped (dry run).
    pub dry_run: bool,
}

impl AttemptInfo {
    /// Record a finished attempt.
    pub fn finished(
        operation_id: OperationId,
        attempt_number: u32,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        completion: AttemptCompletion,
        dry_run: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_id,
            attempt_number,
            started_at,
            completed_at,
            success: completion.success,
            error_code: completion.error_code,
            error_message: completion.error_message,
            duration_ms: (completed_at - started_at).num_milliseconds().max(0),
            dry_run,
        }
    }
}
