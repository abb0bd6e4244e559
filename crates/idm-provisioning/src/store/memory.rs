//! In-process queue store.
//!
//! All state lives behind one mutex, so each trait method is atomic with
//! respect to every other. Used by tests and single-node deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use idm_connector::{OperationId, SystemId};

use super::{
    ArchiveFilter, ArchiveOutcome, Page, PageRequest, QueueStats, QueueStore, StoreError,
    StoreResult, SubmitOptions, SubmitOutcome,
};
use crate::attempt::AttemptInfo;
use crate::batch::{AccountKey, BatchGate};
use crate::operation::{
    ArchiveRecord, NewOperation, OperationRecord, OperationResult, OperationState,
};

#[derive(Debug, Default)]
struct Inner {
    gates: HashMap<AccountKey, BatchGate>,
    records: HashMap<OperationId, OperationRecord>,
    by_account: HashMap<AccountKey, OperationId>,
    archive: Vec<ArchiveRecord>,
    attempts: Vec<AttemptInfo>,
}

impl Inner {
    fn has_active(&self, system_id: SystemId) -> bool {
        self.records.values().any(|r| r.system_id == system_id)
    }

    fn remove_active(&mut self, id: OperationId) -> Option<OperationRecord> {
        let record = self.records.remove(&id)?;
        let key = AccountKey::new(record.system_id, record.remote_uid.clone());
        self.by_account.remove(&key);
        self.gates.remove(&key);
        Some(record)
    }

    fn ensure_held(&self, claimed: &OperationRecord) -> StoreResult<()> {
        match self.records.get(&claimed.id) {
            Some(current) if current.held_by(claimed) => Ok(()),
            _ => Err(StoreError::ClaimLost {
                operation_id: claimed.id,
            }),
        }
    }

    fn claim(&mut self, id: OperationId, now: DateTime<Utc>) -> Option<OperationRecord> {
        let record = self.records.get_mut(&id)?;
        if record.is_running() {
            return None;
        }
        record.result = OperationResult::running();
        record.claimed_at = Some(now);
        record.updated_at = now;
        Some(record.clone())
    }
}

/// Queue store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    inner: Mutex<Inner>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn submit(
        &self,
        submission: &NewOperation,
        options: SubmitOptions,
        now: DateTime<Utc>,
    ) -> StoreResult<SubmitOutcome> {
        let mut inner = self.inner.lock().await;
        let key = AccountKey::new(submission.system_id, submission.remote_uid.clone());

        if let Some(id) = inner.by_account.get(&key).copied() {
            if let Some(gate) = inner.gates.get_mut(&key) {
                gate.debounce(now, options.debounce);
            }
            let record = inner
                .records
                .get_mut(&id)
                .ok_or_else(|| StoreError::InvalidRow(format!("gate {key} has no record")))?;
            record.merge(submission, now);
            return Ok(SubmitOutcome::Merged(record.clone()));
        }

        let gate = BatchGate::open(submission.system_id, submission.remote_uid.clone(), now);
        let record = OperationRecord::from_submission(submission, gate.id, options.max_attempts, now);
        inner.gates.insert(key.clone(), gate);
        inner.by_account.insert(key, record.id);
        inner.records.insert(record.id, record.clone());
        Ok(SubmitOutcome::Created(record))
    }

    async fn get(&self, id: OperationId) -> StoreResult<Option<OperationRecord>> {
        Ok(self.inner.lock().await.records.get(&id).cloned())
    }

    async fn find_active(&self, key: &AccountKey) -> StoreResult<Option<OperationRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .by_account
            .get(key)
            .and_then(|id| inner.records.get(id))
            .cloned())
    }

    async fn get_gate(&self, key: &AccountKey) -> StoreResult<Option<BatchGate>> {
        Ok(self.inner.lock().await.gates.get(key).cloned())
    }

    async fn list_due_gates(&self, now: DateTime<Utc>, limit: u32) -> StoreResult<Vec<BatchGate>> {
        let inner = self.inner.lock().await;
        let mut due: Vec<BatchGate> = inner
            .gates
            .values()
            .filter(|g| g.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|g| (g.next_attempt, g.created_at));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn claim(
        &self,
        id: OperationId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<OperationRecord>> {
        Ok(self.inner.lock().await.claim(id, now))
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: u32) -> StoreResult<Vec<OperationRecord>> {
        let mut inner = self.inner.lock().await;
        let mut due: Vec<&BatchGate> = inner.gates.values().filter(|g| g.is_due(now)).collect();
        due.sort_by_key(|g| (g.next_attempt, g.created_at));
        let candidates: Vec<OperationId> = due
            .into_iter()
            .filter_map(|g| inner.by_account.get(&g.key()).copied())
            .collect();

        let mut claimed = Vec::new();
        for id in candidates {
            if claimed.len() >= limit as usize {
                break;
            }
            if let Some(record) = inner.claim(id, now) {
                claimed.push(record);
            }
        }
        Ok(claimed)
    }

    async fn reschedule(
        &self,
        claimed: &OperationRecord,
        result: OperationResult,
        next_attempt: DateTime<Utc>,
    ) -> StoreResult<OperationRecord> {
        let mut inner = self.inner.lock().await;
        inner.ensure_held(claimed)?;
        let key = AccountKey::new(claimed.system_id, claimed.remote_uid.clone());
        if let Some(gate) = inner.gates.get_mut(&key) {
            gate.advance_to(next_attempt);
        }
        let record = inner.records.get_mut(&claimed.id).ok_or(StoreError::ClaimLost {
            operation_id: claimed.id,
        })?;
        record.current_attempt = claimed.current_attempt;
        record.result = result;
        record.claimed_at = None;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn archive(
        &self,
        claimed: &OperationRecord,
        result: OperationResult,
        now: DateTime<Utc>,
    ) -> StoreResult<ArchiveOutcome> {
        let mut inner = self.inner.lock().await;
        inner.ensure_held(claimed)?;
        let archive = ArchiveRecord::from_terminal(claimed, result, now);
        inner.archive.push(archive.clone());

        let merged_in_flight = inner
            .records
            .get(&claimed.id)
            .is_some_and(|current| current.version != claimed.version);

        let requeued = if merged_in_flight {
            let key = AccountKey::new(claimed.system_id, claimed.remote_uid.clone());
            if let Some(gate) = inner.gates.get_mut(&key) {
                gate.advance_to(now);
            }
            inner.records.get_mut(&claimed.id).map(|current| {
                current.current_attempt = 0;
                current.result = OperationResult::created();
                current.claimed_at = None;
                current.updated_at = now;
                current.clone()
            })
        } else {
            inner.remove_active(claimed.id);
            None
        };

        let system_drained = !inner.has_active(claimed.system_id);
        Ok(ArchiveOutcome {
            archive,
            requeued,
            system_drained,
        })
    }

    async fn archive_rejected(&self, archive: ArchiveRecord) -> StoreResult<()> {
        self.inner.lock().await.archive.push(archive);
        Ok(())
    }

    async fn cancel(
        &self,
        id: OperationId,
        result: OperationResult,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ArchiveOutcome>> {
        let mut inner = self.inner.lock().await;
        match inner.records.get(&id) {
            Some(record) if !record.is_running() => {}
            _ => return Ok(None),
        }
        let Some(record) = inner.remove_active(id) else {
            return Ok(None);
        };
        let archive = ArchiveRecord::from_terminal(&record, result, now);
        inner.archive.push(archive.clone());
        let system_drained = !inner.has_active(record.system_id);
        Ok(Some(ArchiveOutcome {
            archive,
            requeued: None,
            system_drained,
        }))
    }

    async fn release_stale(&self, claimed_before: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let mut released = 0;
        for record in inner.records.values_mut() {
            let stale = record.is_running() && record.claimed_at.is_some_and(|at| at < claimed_before);
            if stale {
                record.result = OperationResult::created();
                record.claimed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn find_archive(
        &self,
        filter: &ArchiveFilter,
        page: PageRequest,
    ) -> StoreResult<Page<ArchiveRecord>> {
        let inner = self.inner.lock().await;
        let mut matches: Vec<&ArchiveRecord> =
            inner.archive.iter().filter(|a| filter.matches(a)).collect();
        // Newest first; insertion order breaks ties.
        matches.reverse();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matches.len() as u64;
        let items = matches
            .into_iter()
            .skip(usize::try_from(page.offset).unwrap_or(usize::MAX))
            .take(usize::try_from(page.limit).unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(Page {
            items,
            total,
            offset: page.offset,
        })
    }

    async fn find_archive_by_operation(
        &self,
        operation_id: OperationId,
    ) -> StoreResult<Option<ArchiveRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .archive
            .iter()
            .rev()
            .find(|a| a.operation_id == operation_id)
            .cloned())
    }

    async fn record_attempt(&self, attempt: &AttemptInfo) -> StoreResult<()> {
        self.inner.lock().await.attempts.push(attempt.clone());
        Ok(())
    }

    async fn list_attempts(&self, operation_id: OperationId) -> StoreResult<Vec<AttemptInfo>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .attempts
            .iter()
            .filter(|a| a.operation_id == operation_id)
            .cloned()
            .collect())
    }

    async fn count_active(&self, system_id: SystemId) -> StoreResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .values()
            .filter(|r| r.system_id == system_id)
            .count() as u64)
    }

    async fn stats(&self, now: DateTime<Utc>) -> StoreResult<QueueStats> {
        let inner = self.inner.lock().await;
        let mut stats = QueueStats {
            queued: inner.records.len() as u64,
            running: inner.records.values().filter(|r| r.is_running()).count() as u64,
            due: inner.gates.values().filter(|g| g.is_due(now)).count() as u64,
            ..QueueStats::default()
        };
        for archive in &inner.archive {
            match archive.result.state {
                OperationState::Executed | OperationState::Warning => stats.archived_executed += 1,
                OperationState::NotExecuted => stats.archived_not_executed += 1,
                _ => stats.archived_failed += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::EntityType;
    use chrono::Duration;
    use idm_connector::{AccountId, OperationType};

    fn submission(system_id: SystemId, uid: &str, operation_type: OperationType) -> NewOperation {
        NewOperation::new(
            system_id,
            AccountId::new(),
            EntityType::Identity,
            uuid::Uuid::new_v4(),
            uid,
            operation_type,
            serde_json::json!({"cn": uid}),
        )
    }

    fn options() -> SubmitOptions {
        SubmitOptions {
            max_attempts: 3,
            debounce: None,
        }
    }

    #[tokio::test]
    async fn test_submit_creates_then_merges() {
        let store = MemoryQueueStore::new();
        let system_id = SystemId::new();
        let now = Utc::now();

        let first = store
            .submit(&submission(system_id, "jdoe", OperationType::Create), options(), now)
            .await
            .unwrap();
        assert!(!first.is_merged());

        let second = store
            .submit(&submission(system_id, "jdoe", OperationType::Update), options(), now)
            .await
            .unwrap();
        assert!(second.is_merged());
        assert_eq!(second.record().id, first.record().id);
        assert_eq!(second.record().operation_type, OperationType::Update);
        assert_eq!(store.count_active(system_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_merge_applies_debounce() {
        let store = MemoryQueueStore::new();
        let system_id = SystemId::new();
        let now = Utc::now();
        let debounced = SubmitOptions {
            max_attempts: 3,
            debounce: Some(Duration::seconds(5)),
        };

        store
            .submit(&submission(system_id, "jdoe", OperationType::Create), debounced, now)
            .await
            .unwrap();
        let key = AccountKey::new(system_id, "jdoe");
        assert_eq!(store.get_gate(&key).await.unwrap().unwrap().next_attempt, now);

        store
            .submit(&submission(system_id, "jdoe", OperationType::Update), debounced, now)
            .await
            .unwrap();
        assert_eq!(
            store.get_gate(&key).await.unwrap().unwrap().next_attempt,
            now + Duration::seconds(5)
        );
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = MemoryQueueStore::new();
        let now = Utc::now();
        let outcome = store
            .submit(&submission(SystemId::new(), "jdoe", OperationType::Create), options(), now)
            .await
            .unwrap();
        let id = outcome.record().id;

        assert!(store.claim(id, now).await.unwrap().is_some());
        assert!(store.claim(id, now).await.unwrap().is_none());
        assert!(store.claim_due(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_due_respects_gate() {
        let store = MemoryQueueStore::new();
        let now = Utc::now();
        let outcome = store
            .submit(&submission(SystemId::new(), "jdoe", OperationType::Create), options(), now)
            .await
            .unwrap();
        let mut claimed = store.claim(outcome.record().id, now).await.unwrap().unwrap();
        claimed.current_attempt = 1;

        let later = now + Duration::seconds(60);
        store
            .reschedule(&claimed, OperationResult::exception("NETWORK_ERROR", "reset"), later)
            .await
            .unwrap();

        assert!(store.claim_due(now, 10).await.unwrap().is_empty());
        let due = store.claim_due(later, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].current_attempt, 1);
    }

    #[tokio::test]
    async fn test_archive_removes_gate() {
        let store = MemoryQueueStore::new();
        let system_id = SystemId::new();
        let now = Utc::now();
        let outcome = store
            .submit(&submission(system_id, "jdoe", OperationType::Create), options(), now)
            .await
            .unwrap();
        let claimed = store.claim(outcome.record().id, now).await.unwrap().unwrap();

        let archived = store
            .archive(&claimed, OperationResult::executed(), now)
            .await
            .unwrap();

        assert!(archived.requeued.is_none());
        assert!(archived.system_drained);
        assert!(store.get(claimed.id).await.unwrap().is_none());
        assert!(store
            .get_gate(&AccountKey::new(system_id, "jdoe"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_archive_keeps_payload_merged_in_flight() {
        let store = MemoryQueueStore::new();
        let system_id = SystemId::new();
        let now = Utc::now();
        let outcome = store
            .submit(&submission(system_id, "jdoe", OperationType::Create), options(), now)
            .await
            .unwrap();
        let mut claimed = store.claim(outcome.record().id, now).await.unwrap().unwrap();
        claimed.current_attempt = 1;

        store
            .submit(&submission(system_id, "jdoe", OperationType::Update), options(), now)
            .await
            .unwrap();

        let archived = store
            .archive(&claimed, OperationResult::executed(), now)
            .await
            .unwrap();

        assert_eq!(archived.archive.operation_type, OperationType::Create);
        let requeued = archived.requeued.unwrap();
        assert_eq!(requeued.operation_type, OperationType::Update);
        assert_eq!(requeued.current_attempt, 0);
        assert!(!archived.system_drained);
    }

    #[tokio::test]
    async fn test_cancel_skips_running_record() {
        let store = MemoryQueueStore::new();
        let now = Utc::now();
        let outcome = store
            .submit(&submission(SystemId::new(), "jdoe", OperationType::Create), options(), now)
            .await
            .unwrap();
        let id = outcome.record().id;
        store.claim(id, now).await.unwrap();

        let result = OperationResult::not_executed("CANCELLED", "operator");
        assert!(store.cancel(id, result, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_stale() {
        let store = MemoryQueueStore::new();
        let now = Utc::now();
        let outcome = store
            .submit(&submission(SystemId::new(), "jdoe", OperationType::Create), options(), now)
            .await
            .unwrap();
        store.claim(outcome.record().id, now).await.unwrap();

        assert_eq!(store.release_stale(now).await.unwrap(), 0);
        assert_eq!(
            store.release_stale(now + Duration::seconds(1)).await.unwrap(),
            1
        );
        assert!(store.claim(outcome.record().id, now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_archive_after_reclaim_is_rejected() {
        let store = MemoryQueueStore::new();
        let system_id = SystemId::new();
        let now = Utc::now();
        let outcome = store
            .submit(&submission(system_id, "jdoe", OperationType::Create), options(), now)
            .await
            .unwrap();
        let first = store.claim(outcome.record().id, now).await.unwrap().unwrap();

        let later = now + Duration::seconds(10);
        assert_eq!(store.release_stale(later).await.unwrap(), 1);
        let second = store.claim(first.id, later).await.unwrap().unwrap();

        let err = store
            .archive(&first, OperationResult::exception("OBJECT_EXISTS", "jdoe"), later)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ClaimLost { operation_id } if operation_id == first.id));
        let err = store
            .reschedule(&first, OperationResult::exception("NETWORK_ERROR", "reset"), later)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ClaimLost { .. }));

        store
            .archive(&second, OperationResult::executed(), later)
            .await
            .unwrap();
        let page = store
            .find_archive(&ArchiveFilter::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].result.state, OperationState::Executed);
    }

    #[tokio::test]
    async fn test_released_claim_can_still_finish() {
        let store = MemoryQueueStore::new();
        let now = Utc::now();
        let outcome = store
            .submit(&submission(SystemId::new(), "jdoe", OperationType::Create), options(), now)
            .await
            .unwrap();
        let claimed = store.claim(outcome.record().id, now).await.unwrap().unwrap();
        store.release_stale(now + Duration::seconds(10)).await.unwrap();

        let archived = store
            .archive(&claimed, OperationResult::executed(), now)
            .await
            .unwrap();
        assert!(archived.requeued.is_none());
        assert!(store.get(claimed.id).await.unwrap().is_none());
        assert!(store
            .archive(&claimed, OperationResult::executed(), now)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_find_archive_pages_newest_first() {
        let store = MemoryQueueStore::new();
        let system_id = SystemId::new();
        let base = Utc::now();
        for i in 0..5 {
            let op = submission(system_id, &format!("user{i}"), OperationType::Create);
            let archive = ArchiveRecord::rejected(
                &op,
                OperationResult::executed(),
                base + Duration::seconds(i),
            );
            store.archive_rejected(archive).await.unwrap();
        }

        let page = store
            .find_archive(&ArchiveFilter::default(), PageRequest::new(1, 2))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].remote_uid, "user3");
        assert_eq!(page.items[1].remote_uid, "user2");
    }

    #[tokio::test]
    async fn test_find_archive_ties_put_latest_insert_first() {
        let store = MemoryQueueStore::new();
        let now = Utc::now();
        for uid in ["first", "second", "third"] {
            let op = submission(SystemId::new(), uid, OperationType::Create);
            store
                .archive_rejected(ArchiveRecord::rejected(&op, OperationResult::executed(), now))
                .await
                .unwrap();
        }

        let page = store
            .find_archive(&ArchiveFilter::default(), PageRequest::default())
            .await
            .unwrap();
        let uids: Vec<&str> = page.items.iter().map(|a| a.remote_uid.as_str()).collect();
        assert_eq!(uids, vec!["third", "second", "first"]);
    }
}
