//! PostgreSQL queue store.
//!
//! Gate uniqueness is enforced by the `(system_id, remote_uid)` constraint on
//! `provisioning_batch`, and workers claim with `FOR UPDATE SKIP LOCKED`.
//!
//! Transactions that touch both tables lock the gate row first and the
//! operation row second. Deleting a gate cascades to its operation row, so
//! any other order deadlocks against a concurrent merge.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

use idm_connector::{AccountId, OperationId, SystemId};

use super::{
    ArchiveFilter, ArchiveOutcome, Page, PageRequest, QueueStats, QueueStore, StoreError,
    StoreResult, SubmitOptions, SubmitOutcome,
};
use crate::attempt::AttemptInfo;
use crate::batch::{AccountKey, BatchGate};
use crate::operation::{
    ArchiveRecord, NewOperation, OperationRecord, OperationResult, ProvisioningContext,
};

/// Times a submission retries when the gate it conflicted with vanished
/// before it could be locked.
const SUBMIT_RETRIES: usize = 3;

#[derive(Debug, FromRow)]
struct GateRow {
    id: Uuid,
    system_id: Uuid,
    remote_uid: String,
    next_attempt: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<GateRow> for BatchGate {
    fn from(row: GateRow) -> Self {
        BatchGate {
            id: row.id,
            system_id: SystemId::from_uuid(row.system_id),
            remote_uid: row.remote_uid,
            next_attempt: row.next_attempt,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct OperationRow {
    id: Uuid,
    batch_id: Uuid,
    system_id: Uuid,
    account_id: Uuid,
    entity_type: String,
    entity_id: Uuid,
    remote_uid: String,
    operation_type: String,
    payload: serde_json::Value,
    current_attempt: i32,
    max_attempts: i32,
    result_state: String,
    result_code: Option<String>,
    result_cause: Option<String>,
    is_dry_run: bool,
    is_synchronous: bool,
    manual_event_id: Option<Uuid>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
}

impl TryFrom<OperationRow> for OperationRecord {
    type Error = StoreError;

    fn try_from(row: OperationRow) -> Result<Self, Self::Error> {
        Ok(OperationRecord {
            id: OperationId::from_uuid(row.id),
            batch_id: row.batch_id,
            system_id: SystemId::from_uuid(row.system_id),
            account_id: AccountId::from_uuid(row.account_id),
            entity_type: row.entity_type.parse().map_err(StoreError::InvalidRow)?,
            entity_id: row.entity_id,
            remote_uid: row.remote_uid,
            operation_type: row
                .operation_type
                .parse()
                .map_err(|e| StoreError::InvalidRow(format!("{e}")))?,
            payload: row.payload,
            current_attempt: to_u32(row.current_attempt, "current_attempt")?,
            max_attempts: to_u32(row.max_attempts, "max_attempts")?,
            result: OperationResult {
                state: row.result_state.parse().map_err(StoreError::InvalidRow)?,
                code: row.result_code,
                cause: row.result_cause,
            },
            context: ProvisioningContext {
                dry_run: row.is_dry_run,
                synchronous: row.is_synchronous,
                manual_event_id: row.manual_event_id,
            },
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            claimed_at: row.claimed_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ArchiveRow {
    id: Uuid,
    operation_id: Uuid,
    system_id: Uuid,
    account_id: Uuid,
    entity_type: String,
    entity_id: Uuid,
    remote_uid: String,
    operation_type: String,
    payload: serde_json::Value,
    result_state: String,
    result_code: Option<String>,
    result_cause: Option<String>,
    attempts: i32,
    is_dry_run: bool,
    is_synchronous: bool,
    manual_event_id: Option<Uuid>,
    queued_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ArchiveRow> for ArchiveRecord {
    type Error = StoreError;

    fn try_from(row: ArchiveRow) -> Result<Self, Self::Error> {
        Ok(ArchiveRecord {
            id: row.id,
            operation_id: OperationId::from_uuid(row.operation_id),
            system_id: SystemId::from_uuid(row.system_id),
            account_id: AccountId::from_uuid(row.account_id),
            entity_type: row.entity_type.parse().map_err(StoreError::InvalidRow)?,
            entity_id: row.entity_id,
            remote_uid: row.remote_uid,
            operation_type: row
                .operation_type
                .parse()
                .map_err(|e| StoreError::InvalidRow(format!("{e}")))?,
            payload: row.payload,
            result: OperationResult {
                state: row.result_state.parse().map_err(StoreError::InvalidRow)?,
                code: row.result_code,
                cause: row.result_cause,
            },
            attempts: to_u32(row.attempts, "attempts")?,
            dry_run: row.is_dry_run,
            synchronous: row.is_synchronous,
            manual_event_id: row.manual_event_id,
            queued_at: row.queued_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AttemptRow {
    id: Uuid,
    operation_id: Uuid,
    attempt_number: i32,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    success: bool,
    error_code: Option<String>,
    error_message: Option<String>,
    duration_ms: i64,
    is_dry_run: bool,
}

impl TryFrom<AttemptRow> for AttemptInfo {
    type Error = StoreError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        Ok(AttemptInfo {
            id: row.id,
            operation_id: OperationId::from_uuid(row.operation_id),
            attempt_number: to_u32(row.attempt_number, "attempt_number")?,
            started_at: row.started_at,
            completed_at: row.completed_at,
            success: row.success,
            error_code: row.error_code,
            error_message: row.error_message,
            duration_ms: row.duration_ms,
            dry_run: row.is_dry_run,
        })
    }
}

fn to_u32(value: i32, column: &str) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::InvalidRow(format!("negative {column}: {value}")))
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

async fn insert_operation(conn: &mut PgConnection, record: &OperationRecord) -> StoreResult<()> {
    sqlx::query(
        r"
        INSERT INTO operation_queue (
            id, batch_id, system_id, account_id, entity_type, entity_id, remote_uid,
            operation_type, payload, current_attempt, max_attempts, result_state,
            result_code, result_cause, is_dry_run, is_synchronous, manual_event_id,
            version, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $19)
        ",
    )
    .bind(record.id.as_uuid())
    .bind(record.batch_id)
    .bind(record.system_id.as_uuid())
    .bind(record.account_id.as_uuid())
    .bind(record.entity_type.as_str())
    .bind(record.entity_id)
    .bind(&record.remote_uid)
    .bind(record.operation_type.as_str())
    .bind(&record.payload)
    .bind(to_i32(record.current_attempt))
    .bind(to_i32(record.max_attempts))
    .bind(record.result.state.as_str())
    .bind(record.result.code.as_deref())
    .bind(record.result.cause.as_deref())
    .bind(record.context.dry_run)
    .bind(record.context.synchronous)
    .bind(record.context.manual_event_id)
    .bind(record.version)
    .bind(record.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_archive(conn: &mut PgConnection, archive: &ArchiveRecord) -> StoreResult<()> {
    sqlx::query(
        r"
        INSERT INTO provisioning_archive (
            id, operation_id, system_id, account_id, entity_type, entity_id, remote_uid,
            operation_type, payload, result_state, result_code, result_cause, attempts,
            is_dry_run, is_synchronous, manual_event_id, queued_at, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        ",
    )
    .bind(archive.id)
    .bind(archive.operation_id.as_uuid())
    .bind(archive.system_id.as_uuid())
    .bind(archive.account_id.as_uuid())
    .bind(archive.entity_type.as_str())
    .bind(archive.entity_id)
    .bind(&archive.remote_uid)
    .bind(archive.operation_type.as_str())
    .bind(&archive.payload)
    .bind(archive.result.state.as_str())
    .bind(archive.result.code.as_deref())
    .bind(archive.result.cause.as_deref())
    .bind(to_i32(archive.attempts))
    .bind(archive.dry_run)
    .bind(archive.synchronous)
    .bind(archive.manual_event_id)
    .bind(archive.queued_at)
    .bind(archive.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Lock a gate row. `None` when the gate is gone.
async fn lock_gate(conn: &mut PgConnection, batch_id: Uuid) -> StoreResult<Option<Uuid>> {
    let id: Option<Uuid> =
        sqlx::query_scalar("SELECT id FROM provisioning_batch WHERE id = $1 FOR UPDATE")
            .bind(batch_id)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(id)
}

/// Lock the operation row of a claim, failing when the claim no longer holds it.
///
/// Call with the gate already locked.
async fn lock_claimed(
    conn: &mut PgConnection,
    claimed: &OperationRecord,
) -> StoreResult<OperationRecord> {
    let row: Option<OperationRow> =
        sqlx::query_as("SELECT * FROM operation_queue WHERE id = $1 FOR UPDATE")
            .bind(claimed.id.as_uuid())
            .fetch_optional(&mut *conn)
            .await?;
    let current = row.map(OperationRecord::try_from).transpose()?;
    match current {
        Some(current) if current.held_by(claimed) => Ok(current),
        _ => Err(StoreError::ClaimLost {
            operation_id: claimed.id,
        }),
    }
}

async fn system_has_active(conn: &mut PgConnection, system_id: SystemId) -> StoreResult<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM operation_queue WHERE system_id = $1)",
    )
    .bind(system_id.as_uuid())
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}

/// Append the filter's WHERE clauses, numbering placeholders from `param_count + 1`.
fn push_archive_filter(query: &mut String, filter: &ArchiveFilter, mut param_count: usize) -> usize {
    if filter.entity_id.is_some() {
        param_count += 1;
        query.push_str(&format!(" AND entity_id = ${param_count}"));
    }
    if filter.system_id.is_some() {
        param_count += 1;
        query.push_str(&format!(" AND system_id = ${param_count}"));
    }
    if filter.account_id.is_some() {
        param_count += 1;
        query.push_str(&format!(" AND account_id = ${param_count}"));
    }
    if filter.operation_type.is_some() {
        param_count += 1;
        query.push_str(&format!(" AND operation_type = ${param_count}"));
    }
    if filter.state.is_some() {
        param_count += 1;
        query.push_str(&format!(" AND result_state = ${param_count}"));
    }
    if filter.from.is_some() {
        param_count += 1;
        query.push_str(&format!(" AND created_at >= ${param_count}"));
    }
    if filter.till.is_some() {
        param_count += 1;
        query.push_str(&format!(" AND created_at <= ${param_count}"));
    }
    param_count
}

macro_rules! bind_archive_filter {
    ($q:expr, $filter:expr) => {{
        let mut q = $q;
        if let Some(entity_id) = $filter.entity_id {
            q = q.bind(entity_id);
        }
        if let Some(system_id) = $filter.system_id {
            q = q.bind(system_id.as_uuid());
        }
        if let Some(account_id) = $filter.account_id {
            q = q.bind(account_id.as_uuid());
        }
        if let Some(operation_type) = $filter.operation_type {
            q = q.bind(operation_type.as_str());
        }
        if let Some(state) = $filter.state {
            q = q.bind(state.as_str());
        }
        if let Some(from) = $filter.from {
            q = q.bind(from);
        }
        if let Some(till) = $filter.till {
            q = q.bind(till);
        }
        q
    }};
}

/// Queue store backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgQueueStore {
    pool: PgPool,
}

impl PgQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        tracing::info!("Running provisioning queue migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.into()))?;
        Ok(())
    }

    async fn try_submit(
        &self,
        submission: &NewOperation,
        options: SubmitOptions,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<SubmitOutcome>> {
        let mut tx = self.pool.begin().await?;

        let gate = BatchGate::open(submission.system_id, submission.remote_uid.clone(), now);
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r"
            INSERT INTO provisioning_batch (id, system_id, remote_uid, next_attempt, created_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (system_id, remote_uid) DO NOTHING
            RETURNING id
            ",
        )
        .bind(gate.id)
        .bind(submission.system_id.as_uuid())
        .bind(&submission.remote_uid)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        if inserted.is_some() {
            let record =
                OperationRecord::from_submission(submission, gate.id, options.max_attempts, now);
            insert_operation(&mut tx, &record).await?;
            tx.commit().await?;
            return Ok(Some(SubmitOutcome::Created(record)));
        }

        let existing: Option<GateRow> = sqlx::query_as(
            r"
            SELECT * FROM provisioning_batch
            WHERE system_id = $1 AND remote_uid = $2
            FOR UPDATE
            ",
        )
        .bind(submission.system_id.as_uuid())
        .bind(&submission.remote_uid)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(mut gate) = existing.map(BatchGate::from) else {
            tx.rollback().await?;
            return Ok(None);
        };

        if gate.debounce(now, options.debounce) {
            sqlx::query("UPDATE provisioning_batch SET next_attempt = $2 WHERE id = $1")
                .bind(gate.id)
                .bind(gate.next_attempt)
                .execute(&mut *tx)
                .await?;
        }

        let row: Option<OperationRow> =
            sqlx::query_as("SELECT * FROM operation_queue WHERE batch_id = $1 FOR UPDATE")
                .bind(gate.id)
                .fetch_optional(&mut *tx)
                .await?;
        let mut record = OperationRecord::try_from(
            row.ok_or_else(|| StoreError::InvalidRow(format!("gate {} has no record", gate.id)))?,
        )?;
        record.merge(submission, now);

        sqlx::query(
            r"
            UPDATE operation_queue
            SET operation_type = $2, payload = $3, account_id = $4, entity_type = $5,
                entity_id = $6, is_dry_run = $7, is_synchronous = $8, manual_event_id = $9,
                version = $10, updated_at = $11
            WHERE id = $1
            ",
        )
        .bind(record.id.as_uuid())
        .bind(record.operation_type.as_str())
        .bind(&record.payload)
        .bind(record.account_id.as_uuid())
        .bind(record.entity_type.as_str())
        .bind(record.entity_id)
        .bind(record.context.dry_run)
        .bind(record.context.synchronous)
        .bind(record.context.manual_event_id)
        .bind(record.version)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(SubmitOutcome::Merged(record)))
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn submit(
        &self,
        submission: &NewOperation,
        options: SubmitOptions,
        now: DateTime<Utc>,
    ) -> StoreResult<SubmitOutcome> {
        for _ in 0..SUBMIT_RETRIES {
            if let Some(outcome) = self.try_submit(submission, options, now).await? {
                return Ok(outcome);
            }
            tracing::debug!(
                system_id = %submission.system_id,
                remote_uid = %submission.remote_uid,
                "Gate archived during submission, retrying"
            );
        }
        Err(StoreError::InvalidRow(format!(
            "could not acquire gate for {}/{}",
            submission.system_id, submission.remote_uid
        )))
    }

    async fn get(&self, id: OperationId) -> StoreResult<Option<OperationRecord>> {
        let row: Option<OperationRow> = sqlx::query_as("SELECT * FROM operation_queue WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(OperationRecord::try_from).transpose()
    }

    async fn find_active(&self, key: &AccountKey) -> StoreResult<Option<OperationRecord>> {
        let row: Option<OperationRow> = sqlx::query_as(
            "SELECT * FROM operation_queue WHERE system_id = $1 AND remote_uid = $2",
        )
        .bind(key.system_id.as_uuid())
        .bind(&key.remote_uid)
        .fetch_optional(&self.pool)
        .await?;
        row.map(OperationRecord::try_from).transpose()
    }

    async fn get_gate(&self, key: &AccountKey) -> StoreResult<Option<BatchGate>> {
        let row: Option<GateRow> = sqlx::query_as(
            "SELECT * FROM provisioning_batch WHERE system_id = $1 AND remote_uid = $2",
        )
        .bind(key.system_id.as_uuid())
        .bind(&key.remote_uid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(BatchGate::from))
    }

    async fn list_due_gates(&self, now: DateTime<Utc>, limit: u32) -> StoreResult<Vec<BatchGate>> {
        let rows: Vec<GateRow> = sqlx::query_as(
            r"
            SELECT * FROM provisioning_batch
            WHERE next_attempt <= $1
            ORDER BY next_attempt ASC, created_at ASC
            LIMIT $2
            ",
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(BatchGate::from).collect())
    }

    async fn claim(
        &self,
        id: OperationId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<OperationRecord>> {
        let row: Option<OperationRow> = sqlx::query_as(
            r"
            UPDATE operation_queue
            SET result_state = 'RUNNING', result_code = NULL, result_cause = NULL,
                claimed_at = $2, updated_at = $2
            WHERE id = $1 AND result_state <> 'RUNNING'
            RETURNING *
            ",
        )
        .bind(id.as_uuid())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(OperationRecord::try_from).transpose()
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: u32) -> StoreResult<Vec<OperationRecord>> {
        let rows: Vec<OperationRow> = sqlx::query_as(
            r"
            UPDATE operation_queue
            SET result_state = 'RUNNING', result_code = NULL, result_cause = NULL,
                claimed_at = $1, updated_at = $1
            WHERE id IN (
                SELECT q.id FROM operation_queue q
                JOIN provisioning_batch b ON b.id = q.batch_id
                WHERE b.next_attempt <= $1 AND q.result_state <> 'RUNNING'
                ORDER BY b.next_attempt ASC, b.created_at ASC
                LIMIT $2
                FOR UPDATE OF q SKIP LOCKED
            )
            RETURNING *
            ",
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OperationRecord::try_from).collect()
    }

    async fn reschedule(
        &self,
        claimed: &OperationRecord,
        result: OperationResult,
        next_attempt: DateTime<Utc>,
    ) -> StoreResult<OperationRecord> {
        let mut tx = self.pool.begin().await?;

        if lock_gate(&mut tx, claimed.batch_id).await?.is_none() {
            tx.rollback().await?;
            return Err(StoreError::ClaimLost {
                operation_id: claimed.id,
            });
        }
        lock_claimed(&mut tx, claimed).await?;

        sqlx::query(
            "UPDATE provisioning_batch SET next_attempt = GREATEST(next_attempt, $2) WHERE id = $1",
        )
        .bind(claimed.batch_id)
        .bind(next_attempt)
        .execute(&mut *tx)
        .await?;

        let row: OperationRow = sqlx::query_as(
            r"
            UPDATE operation_queue
            SET current_attempt = $2, result_state = $3, result_code = $4, result_cause = $5,
                claimed_at = NULL, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(claimed.id.as_uuid())
        .bind(to_i32(claimed.current_attempt))
        .bind(result.state.as_str())
        .bind(result.code.as_deref())
        .bind(result.cause.as_deref())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        OperationRecord::try_from(row)
    }

    async fn archive(
        &self,
        claimed: &OperationRecord,
        result: OperationResult,
        now: DateTime<Utc>,
    ) -> StoreResult<ArchiveOutcome> {
        let mut tx = self.pool.begin().await?;

        if lock_gate(&mut tx, claimed.batch_id).await?.is_none() {
            tx.rollback().await?;
            return Err(StoreError::ClaimLost {
                operation_id: claimed.id,
            });
        }
        let current = lock_claimed(&mut tx, claimed).await?;

        let archive = ArchiveRecord::from_terminal(claimed, result, now);
        insert_archive(&mut tx, &archive).await?;

        let requeued = if current.version == claimed.version {
            sqlx::query("DELETE FROM provisioning_batch WHERE id = $1")
                .bind(claimed.batch_id)
                .execute(&mut *tx)
                .await?;
            None
        } else {
            sqlx::query(
                "UPDATE provisioning_batch SET next_attempt = GREATEST(next_attempt, $2) WHERE id = $1",
            )
            .bind(claimed.batch_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            let row: OperationRow = sqlx::query_as(
                r"
                UPDATE operation_queue
                SET current_attempt = 0, result_state = 'CREATED', result_code = NULL,
                    result_cause = NULL, claimed_at = NULL, updated_at = $2
                WHERE id = $1
                RETURNING *
                ",
            )
            .bind(claimed.id.as_uuid())
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
            Some(OperationRecord::try_from(row)?)
        };

        let system_drained = !system_has_active(&mut tx, claimed.system_id).await?;
        tx.commit().await?;

        Ok(ArchiveOutcome {
            archive,
            requeued,
            system_drained,
        })
    }

    async fn archive_rejected(&self, archive: ArchiveRecord) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_archive(&mut conn, &archive).await
    }

    async fn cancel(
        &self,
        id: OperationId,
        result: OperationResult,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ArchiveOutcome>> {
        let mut tx = self.pool.begin().await?;

        let batch_id: Option<Uuid> =
            sqlx::query_scalar("SELECT batch_id FROM operation_queue WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;
        let Some(batch_id) = batch_id else {
            tx.rollback().await?;
            return Ok(None);
        };
        if lock_gate(&mut tx, batch_id).await?.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        let row: Option<OperationRow> = sqlx::query_as(
            "SELECT * FROM operation_queue WHERE id = $1 AND result_state <> 'RUNNING' FOR UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let record = OperationRecord::try_from(row)?;

        let archive = ArchiveRecord::from_terminal(&record, result, now);
        insert_archive(&mut tx, &archive).await?;
        sqlx::query("DELETE FROM provisioning_batch WHERE id = $1")
            .bind(record.batch_id)
            .execute(&mut *tx)
            .await?;

        let system_drained = !system_has_active(&mut tx, record.system_id).await?;
        tx.commit().await?;

        Ok(Some(ArchiveOutcome {
            archive,
            requeued: None,
            system_drained,
        }))
    }

    async fn release_stale(&self, claimed_before: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r"
            UPDATE operation_queue
            SET result_state = 'CREATED', claimed_at = NULL, updated_at = NOW()
            WHERE result_state = 'RUNNING' AND claimed_at < $1
            ",
        )
        .bind(claimed_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find_archive(
        &self,
        filter: &ArchiveFilter,
        page: PageRequest,
    ) -> StoreResult<Page<ArchiveRecord>> {
        let mut count_query = String::from("SELECT COUNT(*) FROM provisioning_archive WHERE TRUE");
        push_archive_filter(&mut count_query, filter, 0);
        let total: i64 = bind_archive_filter!(sqlx::query_scalar::<_, i64>(&count_query), filter)
            .fetch_one(&self.pool)
            .await?;

        let mut query = String::from("SELECT * FROM provisioning_archive WHERE TRUE");
        let param_count = push_archive_filter(&mut query, filter, 0);
        query.push_str(&format!(
            " ORDER BY created_at DESC, seq DESC LIMIT ${} OFFSET ${}",
            param_count + 1,
            param_count + 2
        ));
        let rows: Vec<ArchiveRow> =
            bind_archive_filter!(sqlx::query_as::<_, ArchiveRow>(&query), filter)
                .bind(to_i64(page.limit))
                .bind(to_i64(page.offset))
                .fetch_all(&self.pool)
                .await?;

        Ok(Page {
            items: rows
                .into_iter()
                .map(ArchiveRecord::try_from)
                .collect::<StoreResult<_>>()?,
            total: to_u64(total),
            offset: page.offset,
        })
    }

    async fn find_archive_by_operation(
        &self,
        operation_id: OperationId,
    ) -> StoreResult<Option<ArchiveRecord>> {
        let row: Option<ArchiveRow> = sqlx::query_as(
            r"
            SELECT * FROM provisioning_archive
            WHERE operation_id = $1
            ORDER BY created_at DESC, seq DESC
            LIMIT 1
            ",
        )
        .bind(operation_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(ArchiveRecord::try_from).transpose()
    }

    async fn record_attempt(&self, attempt: &AttemptInfo) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO operation_attempts (
                id, operation_id, attempt_number, started_at, completed_at, success,
                error_code, error_message, duration_ms, is_dry_run
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ",
        )
        .bind(attempt.id)
        .bind(attempt.operation_id.as_uuid())
        .bind(to_i32(attempt.attempt_number))
        .bind(attempt.started_at)
        .bind(attempt.completed_at)
        .bind(attempt.success)
        .bind(attempt.error_code.as_deref())
        .bind(attempt.error_message.as_deref())
        .bind(attempt.duration_ms)
        .bind(attempt.dry_run)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_attempts(&self, operation_id: OperationId) -> StoreResult<Vec<AttemptInfo>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(
            r"
            SELECT * FROM operation_attempts
            WHERE operation_id = $1
            ORDER BY attempt_number ASC, started_at ASC
            ",
        )
        .bind(operation_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AttemptInfo::try_from).collect()
    }

    async fn count_active(&self, system_id: SystemId) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM operation_queue WHERE system_id = $1")
            .bind(system_id.as_uuid())
            .fetch_one(&self.pool)
            .await?;
        Ok(to_u64(count))
    }

    async fn stats(&self, now: DateTime<Utc>) -> StoreResult<QueueStats> {
        let (queued, running): (i64, i64) = sqlx::query_as(
            r"
            SELECT COUNT(*), COUNT(*) FILTER (WHERE result_state = 'RUNNING')
            FROM operation_queue
            ",
        )
        .fetch_one(&self.pool)
        .await?;

        let due: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM provisioning_batch WHERE next_attempt <= $1")
                .bind(now)
                .fetch_one(&self.pool)
                .await?;

        let (executed, not_executed, failed): (i64, i64, i64) = sqlx::query_as(
            r"
            SELECT
                COUNT(*) FILTER (WHERE result_state IN ('EXECUTED', 'WARNING')),
                COUNT(*) FILTER (WHERE result_state = 'NOT_EXECUTED'),
                COUNT(*) FILTER (WHERE result_state NOT IN ('EXECUTED', 'WARNING', 'NOT_EXECUTED'))
            FROM provisioning_archive
            ",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            queued: to_u64(queued),
            running: to_u64(running),
            due: to_u64(due),
            archived_executed: to_u64(executed),
            archived_failed: to_u64(failed),
            archived_not_executed: to_u64(not_executed),
        })
    }
}
