//! Common test utilities for provisioning tests.
//!
//! Hand-written mocks for the connector, mapping service and role resolver.
//! Everything runs on the in-memory queue store.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use idm_connector::{
    AccountId, Connector, ConnectorError, ConnectorProvider, ConnectorRequest, ConnectorResponse,
    ConnectorResult, OperationType, SystemId,
};
use idm_provisioning::{
    AccountMapping, AccountState, AccountTarget, ArchiveRecord, BackoffPolicy, EntityType,
    EventResult, MappingError, MappingResult, MemoryQueueStore, NewOperation, OperationQueue,
    ProvisioningConfig, ProvisioningService, QueueObserver, RoleResolver,
};

static INIT: Once = Once::new();

/// Initialise test logging once, only when `RUST_LOG` is set.
pub fn init_test_logging() {
    INIT.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            let _ = tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init();
        }
    });
}

// =============================================================================
// Mock Connector
// =============================================================================

/// Failure a mock connector can be scripted to return.
#[derive(Debug, Clone)]
pub enum MockFailure {
    Unavailable,
    Constraint(String),
}

impl MockFailure {
    fn into_error(self) -> ConnectorError {
        match self {
            MockFailure::Unavailable => ConnectorError::TargetUnavailable {
                message: "maintenance window".to_string(),
            },
            MockFailure::Constraint(message) => ConnectorError::ConstraintViolation { message },
        }
    }
}

/// An account held by the mock target system.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAccount {
    pub uid: String,
    pub created_at: DateTime<Utc>,
    pub attributes: serde_json::Value,
}

/// Mock connector keeping its accounts in memory.
pub struct MockConnector {
    name: String,
    calls: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
    healthy: AtomicBool,
    delay: Mutex<Option<Duration>>,
    always_fail: Mutex<Option<MockFailure>>,
    scripted: Mutex<VecDeque<MockFailure>>,
    accounts: Mutex<HashMap<String, RemoteAccount>>,
    log: Mutex<Vec<(OperationType, String)>>,
}

impl MockConnector {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            delay: Mutex::new(None),
            always_fail: Mutex::new(None),
            scripted: Mutex::new(VecDeque::new()),
            accounts: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `count` calls.
    pub fn fail_next(&self, count: usize, failure: MockFailure) {
        let mut scripted = self.scripted.lock().unwrap();
        for _ in 0..count {
            scripted.push_back(failure.clone());
        }
    }

    /// Fail every call.
    pub fn fail_always(&self, failure: MockFailure) {
        *self.always_fail.lock().unwrap() = Some(failure);
    }

    /// Delay every call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Put an account on the target system.
    pub fn seed_account(&self, uid: &str, created_at: DateTime<Utc>) {
        self.accounts.lock().unwrap().insert(
            uid.to_string(),
            RemoteAccount {
                uid: uid.to_string(),
                created_at,
                attributes: json!({}),
            },
        );
    }

    pub fn account(&self, uid: &str) -> Option<RemoteAccount> {
        self.accounts.lock().unwrap().get(uid).cloned()
    }

    pub fn has_account(&self, uid: &str) -> bool {
        self.accounts.lock().unwrap().contains_key(uid)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Applied operations, in order.
    pub fn applied(&self) -> Vec<(OperationType, String)> {
        self.log.lock().unwrap().clone()
    }

    fn next_failure(&self) -> Option<MockFailure> {
        if let Some(failure) = self.scripted.lock().unwrap().pop_front() {
            return Some(failure);
        }
        self.always_fail.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn display_name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: ConnectorRequest<'_>) -> ConnectorResult<ConnectorResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(failure) = self.next_failure() {
            return Err(failure.into_error());
        }

        let uid = request.remote_uid.to_string();
        let mut accounts = self.accounts.lock().unwrap();
        match request.operation_type {
            OperationType::Create => {
                if accounts.contains_key(&uid) {
                    return Err(ConnectorError::ObjectAlreadyExists { identifier: uid });
                }
                accounts.insert(
                    uid.clone(),
                    RemoteAccount {
                        uid: uid.clone(),
                        created_at: Utc::now(),
                        attributes: request.payload.clone(),
                    },
                );
                self.creates.fetch_add(1, Ordering::SeqCst);
            }
            OperationType::Update => {
                let Some(account) = accounts.get_mut(&uid) else {
                    return Err(ConnectorError::ObjectNotFound { identifier: uid });
                };
                account.attributes = request.payload.clone();
                self.updates.fetch_add(1, Ordering::SeqCst);
            }
            OperationType::Delete => {
                if accounts.remove(&uid).is_none() {
                    return Err(ConnectorError::ObjectNotFound { identifier: uid });
                }
                self.deletes.fetch_add(1, Ordering::SeqCst);
            }
        }
        drop(accounts);

        self.log
            .lock()
            .unwrap()
            .push((request.operation_type, uid.clone()));
        Ok(ConnectorResponse::with_uid(uid))
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Serves registered mock connectors by system.
#[derive(Default)]
pub struct MockConnectorProvider {
    connectors: HashMap<SystemId, Arc<MockConnector>>,
}

impl MockConnectorProvider {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, system_id: SystemId, connector: Arc<MockConnector>) -> Self {
        self.connectors.insert(system_id, connector);
        self
    }
}

#[async_trait]
impl ConnectorProvider for MockConnectorProvider {
    async fn get_connector(&self, system_id: SystemId) -> Option<Arc<dyn Connector>> {
        self.connectors
            .get(&system_id)
            .map(|c| c.clone() as Arc<dyn Connector>)
    }
}

// =============================================================================
// Mock Mapping Service
// =============================================================================

/// Mapping service reading account existence from a mock connector.
pub struct MockMapping {
    connector: Arc<MockConnector>,
    retained: Mutex<HashMap<String, usize>>,
    broken: Mutex<Vec<String>>,
}

impl MockMapping {
    pub fn new(connector: Arc<MockConnector>) -> Self {
        Self {
            connector,
            retained: Mutex::new(HashMap::new()),
            broken: Mutex::new(Vec::new()),
        }
    }

    /// Assignments that still grant the account after the change.
    pub fn set_retained(&self, uid: &str, count: usize) {
        self.retained.lock().unwrap().insert(uid.to_string(), count);
    }

    /// Make payload computation fail for the account.
    pub fn break_payload(&self, uid: &str) {
        self.broken.lock().unwrap().push(uid.to_string());
    }
}

#[async_trait]
impl AccountMapping for MockMapping {
    async fn account_state(&self, target: &AccountTarget) -> MappingResult<AccountState> {
        Ok(AccountState {
            exists: self.connector.has_account(&target.remote_uid),
            retained_assignments: self
                .retained
                .lock()
                .unwrap()
                .get(&target.remote_uid)
                .copied()
                .unwrap_or(0),
        })
    }

    async fn compute_payload(
        &self,
        target: &AccountTarget,
        operation_type: OperationType,
    ) -> MappingResult<serde_json::Value> {
        if self.broken.lock().unwrap().contains(&target.remote_uid) {
            return Err(MappingError::Failed(format!(
                "no value for mandatory attribute mail of {}",
                target.remote_uid
            )));
        }
        Ok(json!({ "uid": target.remote_uid, "op": operation_type.as_str() }))
    }
}

// =============================================================================
// Mock Role Resolver
// =============================================================================

/// Resolves roles to accounts, expanding composite roles.
#[derive(Default)]
pub struct MockResolver {
    grants: HashMap<String, Vec<AccountTarget>>,
    composites: HashMap<String, Vec<String>>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn grant(mut self, role: &str, target: AccountTarget) -> Self {
        self.grants.entry(role.to_string()).or_default().push(target);
        self
    }

    #[must_use]
    pub fn composite(mut self, role: &str, children: &[&str]) -> Self {
        self.composites.insert(
            role.to_string(),
            children.iter().map(|c| (*c).to_string()).collect(),
        );
        self
    }

    fn expand(&self, role: &str, out: &mut Vec<AccountTarget>) {
        if let Some(targets) = self.grants.get(role) {
            out.extend(targets.iter().cloned());
        }
        if let Some(children) = self.composites.get(role) {
            for child in children {
                self.expand(child, out);
            }
        }
    }
}

#[async_trait]
impl RoleResolver for MockResolver {
    async fn resolve(&self, _identity_id: Uuid, role_ref: &str) -> EventResult<Vec<AccountTarget>> {
        let mut targets = Vec::new();
        self.expand(role_ref, &mut targets);
        Ok(targets)
    }
}

// =============================================================================
// Recording Observer
// =============================================================================

/// Observer counting archive writes and drain notifications.
#[derive(Default)]
pub struct RecordingObserver {
    pub archived: AtomicUsize,
    pub drained: Mutex<Vec<SystemId>>,
}

impl RecordingObserver {
    pub fn archived_count(&self) -> usize {
        self.archived.load(Ordering::SeqCst)
    }

    pub fn drained(&self) -> Vec<SystemId> {
        self.drained.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueObserver for RecordingObserver {
    async fn on_archived(&self, _archive: &ArchiveRecord) {
        self.archived.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_queue_drained(&self, system_id: SystemId) {
        self.drained.lock().unwrap().push(system_id);
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A service over the memory store with one mock target system.
pub struct TestHarness {
    pub system_id: SystemId,
    pub connector: Arc<MockConnector>,
    pub observer: Arc<RecordingObserver>,
    pub service: Arc<ProvisioningService>,
}

impl TestHarness {
    /// Retries become due immediately.
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ProvisioningConfig) -> Self {
        Self::build(SystemId::new(), config)
    }

    /// Build for a given system id, so per-system settings can be keyed on it.
    pub fn build(system_id: SystemId, config: ProvisioningConfig) -> Self {
        init_test_logging();
        let connector = Arc::new(MockConnector::new("mock-ldap"));
        let observer = Arc::new(RecordingObserver::default());
        let provider = MockConnectorProvider::new().with(system_id, connector.clone());
        let queue = OperationQueue::new(Arc::new(MemoryQueueStore::new()), Arc::new(config))
            .with_observer(observer.clone());
        let service = Arc::new(ProvisioningService::with_queue(
            Arc::new(queue),
            Arc::new(provider),
        ));
        Self {
            system_id,
            connector,
            observer,
            service,
        }
    }

    pub fn target(&self, uid: &str) -> AccountTarget {
        AccountTarget {
            system_id: self.system_id,
            account_id: AccountId::new(),
            entity_type: EntityType::Identity,
            entity_id: Uuid::new_v4(),
            remote_uid: uid.to_string(),
        }
    }

    pub fn submission(
        &self,
        uid: &str,
        operation_type: OperationType,
        payload: serde_json::Value,
    ) -> NewOperation {
        NewOperation::new(
            self.system_id,
            AccountId::new(),
            EntityType::Identity,
            Uuid::new_v4(),
            uid,
            operation_type,
            payload,
        )
    }
}

/// Default configuration with zero backoff.
pub fn test_config() -> ProvisioningConfig {
    ProvisioningConfig {
        backoff: BackoffPolicy::fixed(Duration::ZERO),
        sync_wait_timeout: Duration::from_secs(2),
        ..ProvisioningConfig::default()
    }
}

/// Retries wait an hour behind the gate.
pub fn slow_retry_config() -> ProvisioningConfig {
    ProvisioningConfig {
        backoff: BackoffPolicy::fixed(Duration::from_secs(3600)),
        ..test_config()
    }
}
