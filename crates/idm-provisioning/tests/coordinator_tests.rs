//! Ordering Coordinator Tests
//!
//! Role changes flowing through the event handler and coordinator:
//! - Composite role grant provisions one account once
//! - Role swap becomes a single update, never delete + create
//! - Additions are delivered before removals
//! - Mapping failures are archived, not queued
//! - Revoking a grant that is still queued withdraws it

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use idm_connector::OperationType;
use idm_provisioning::{
    AccountKey, ArchiveFilter, Effect, EventError, OperationState, OrderingCoordinator,
    PageRequest, ProvisioningContext, ProvisioningEventHandler, RoleAssignmentEvent, RoleChange,
    CANCELLED_CODE, MAPPING_FAILED_CODE,
};

use common::{MockFailure, MockMapping, MockResolver, TestHarness};

fn coordinator(h: &TestHarness) -> (Arc<MockMapping>, Arc<OrderingCoordinator<MockMapping>>) {
    let mapping = Arc::new(MockMapping::new(h.connector.clone()));
    let coordinator = Arc::new(OrderingCoordinator::new(h.service.clone(), mapping.clone()));
    (mapping, coordinator)
}

fn event(added: &[&str], removed: &[&str], synchronous: bool) -> RoleAssignmentEvent {
    RoleAssignmentEvent {
        identity_id: Uuid::new_v4(),
        added: added.iter().map(|r| (*r).to_string()).collect(),
        removed: removed.iter().map(|r| (*r).to_string()).collect(),
        synchronous,
        dry_run: false,
        correlation_id: Some("test-correlation".to_string()),
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_composite_role_creates_account_once() {
    let h = TestHarness::new();
    let (_, coordinator) = coordinator(&h);
    let jdoe = h.target("jdoe");
    let resolver = MockResolver::new()
        .composite("engineering", &["developer", "vpn-user"])
        .grant("developer", jdoe.clone())
        .grant("vpn-user", jdoe);
    let handler = ProvisioningEventHandler::new(Arc::new(resolver), coordinator);

    let report = handler
        .handle_role_assignment(event(&["engineering"], &[], true))
        .await
        .unwrap();

    assert_eq!(report.submitted.len(), 1);
    assert!(report.failed.is_empty());
    let archive = report.submitted[0].as_archived().unwrap();
    assert_eq!(archive.operation_type, OperationType::Create);
    assert_eq!(archive.result.state, OperationState::Executed);
    assert_eq!(h.connector.create_count(), 1);
    assert_eq!(h.connector.call_count(), 1);

    let filter = ArchiveFilter {
        system_id: Some(h.system_id),
        ..ArchiveFilter::default()
    };
    let page = h
        .service
        .find_archive(&filter, PageRequest::default())
        .await
        .unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn test_role_swap_is_single_update() {
    let h = TestHarness::new();
    let (mapping, coordinator) = coordinator(&h);
    let created_at = Utc::now() - Duration::days(30);
    h.connector.seed_account("jdoe", created_at);
    mapping.set_retained("jdoe", 1);

    let jdoe = h.target("jdoe");
    let resolver = MockResolver::new()
        .grant("developer", jdoe.clone())
        .grant("tester", jdoe);
    let handler = ProvisioningEventHandler::new(Arc::new(resolver), coordinator);

    let report = handler
        .handle_role_assignment(event(&["tester"], &["developer"], true))
        .await
        .unwrap();

    assert_eq!(report.submitted.len(), 1);
    assert_eq!(h.connector.update_count(), 1);
    assert_eq!(h.connector.delete_count(), 0);
    assert_eq!(h.connector.create_count(), 0);

    let account = h.connector.account("jdoe").unwrap();
    assert_eq!(account.uid, "jdoe");
    assert_eq!(account.created_at, created_at);

    let page = h
        .service
        .find_archive(&ArchiveFilter::default(), PageRequest::default())
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].operation_type, OperationType::Update);
    assert_eq!(page.items[0].remote_uid, "jdoe");
    assert_eq!(page.items[0].result.state, OperationState::Executed);
}

// =============================================================================
// Ordering and net effect
// =============================================================================

#[tokio::test]
async fn test_additions_are_submitted_before_removals() {
    let h = TestHarness::new();
    let (_, coordinator) = coordinator(&h);
    h.connector.seed_account("asmith", Utc::now());

    let changes = vec![
        RoleChange::remove("staff", h.target("asmith")),
        RoleChange::add("ops", h.target("jdoe")),
    ];
    let context = ProvisioningContext::synchronous();

    let plan = coordinator.reconcile(&changes, &context).await.unwrap();
    assert_eq!(plan.operations.len(), 2);
    assert_eq!(plan.operations[0].effect, Effect::Add);
    assert_eq!(
        plan.operations[0].submission.operation_type,
        OperationType::Create
    );
    assert_eq!(plan.operations[1].effect, Effect::Remove);
    assert_eq!(
        plan.operations[1].submission.operation_type,
        OperationType::Delete
    );

    coordinator.apply(plan).await.unwrap();
    assert_eq!(
        h.connector.applied(),
        vec![
            (OperationType::Create, "jdoe".to_string()),
            (OperationType::Delete, "asmith".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_remove_and_readd_never_deletes() {
    let h = TestHarness::new();
    let (_, coordinator) = coordinator(&h);
    h.connector.seed_account("jdoe", Utc::now());

    let changes = vec![
        RoleChange::remove("developer", h.target("jdoe")),
        RoleChange::add("developer", h.target("jdoe")),
    ];

    let report = coordinator
        .reconcile_and_submit(&changes, &ProvisioningContext::synchronous())
        .await
        .unwrap();

    assert_eq!(report.submitted.len(), 1);
    assert_eq!(h.connector.delete_count(), 0);
    assert_eq!(h.connector.update_count(), 1);
    assert!(h.connector.has_account("jdoe"));
}

#[tokio::test]
async fn test_remove_with_retained_assignment_updates() {
    let h = TestHarness::new();
    let (mapping, coordinator) = coordinator(&h);
    h.connector.seed_account("jdoe", Utc::now());
    mapping.set_retained("jdoe", 2);

    let changes = vec![RoleChange::remove("developer", h.target("jdoe"))];
    let plan = coordinator
        .reconcile(&changes, &ProvisioningContext::asynchronous())
        .await
        .unwrap();

    assert_eq!(plan.operations.len(), 1);
    assert_eq!(
        plan.operations[0].submission.operation_type,
        OperationType::Update
    );
}

#[tokio::test]
async fn test_remove_of_missing_account_is_skipped() {
    let h = TestHarness::new();
    let (_, coordinator) = coordinator(&h);

    let changes = vec![RoleChange::remove("developer", h.target("ghost"))];
    let plan = coordinator
        .reconcile(&changes, &ProvisioningContext::asynchronous())
        .await
        .unwrap();

    assert!(plan.is_empty());
    assert_eq!(plan.skipped.len(), 1);
    assert_eq!(plan.skipped[0].remote_uid, "ghost");
}

#[tokio::test]
async fn test_revoke_before_delivery_withdraws_queued_create() {
    let h = TestHarness::new();
    let (_, coordinator) = coordinator(&h);
    let context = ProvisioningContext::asynchronous();

    let granted = coordinator
        .reconcile_and_submit(&[RoleChange::add("developer", h.target("jdoe"))], &context)
        .await
        .unwrap();
    let create_id = granted.submitted[0].as_queued().unwrap().id;

    let plan = coordinator
        .reconcile(&[RoleChange::remove("developer", h.target("jdoe"))], &context)
        .await
        .unwrap();
    assert!(plan.skipped.is_empty());
    assert_eq!(plan.operations.len(), 1);
    assert_eq!(
        plan.operations[0].submission.operation_type,
        OperationType::Delete
    );
    assert_eq!(plan.operations[0].withdraws, Some(create_id));

    let report = coordinator.apply(plan).await.unwrap();
    assert!(report.submitted.is_empty());
    assert_eq!(report.withdrawn.len(), 1);
    assert_eq!(report.withdrawn[0].operation_id, create_id);
    assert_eq!(
        report.withdrawn[0].result.code.as_deref(),
        Some(CANCELLED_CODE)
    );

    let key = AccountKey::new(h.system_id, "jdoe");
    assert!(h.service.queue().find_active(&key).await.unwrap().is_none());
    h.service
        .executor()
        .process_due(Utc::now(), 10)
        .await
        .unwrap();
    assert_eq!(h.connector.call_count(), 0);
    assert!(!h.connector.has_account("jdoe"));
}

#[tokio::test]
async fn test_revoke_during_delivery_deletes_after_create() {
    let h = TestHarness::new();
    let (_, coordinator) = coordinator(&h);
    let context = ProvisioningContext::asynchronous();

    let granted = coordinator
        .reconcile_and_submit(&[RoleChange::add("developer", h.target("jdoe"))], &context)
        .await
        .unwrap();
    let create_id = granted.submitted[0].as_queued().unwrap().id;
    let in_flight = h
        .service
        .queue()
        .claim(create_id, Utc::now())
        .await
        .unwrap()
        .unwrap();

    let report = coordinator
        .reconcile_and_submit(&[RoleChange::remove("developer", h.target("jdoe"))], &context)
        .await
        .unwrap();
    assert!(report.withdrawn.is_empty());
    assert_eq!(report.submitted.len(), 1);

    h.service.executor().execute(in_flight).await.unwrap();
    assert!(h.connector.has_account("jdoe"));
    h.service
        .executor()
        .process_due(Utc::now(), 10)
        .await
        .unwrap();
    assert_eq!(
        h.connector.applied(),
        vec![
            (OperationType::Create, "jdoe".to_string()),
            (OperationType::Delete, "jdoe".to_string()),
        ]
    );
    assert!(!h.connector.has_account("jdoe"));
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_mapping_failure_is_archived_not_queued() {
    let h = TestHarness::new();
    let (mapping, coordinator) = coordinator(&h);
    mapping.break_payload("jdoe");

    let changes = vec![
        RoleChange::add("developer", h.target("jdoe")),
        RoleChange::add("developer", h.target("asmith")),
    ];
    let report = coordinator
        .reconcile_and_submit(&changes, &ProvisioningContext::asynchronous())
        .await
        .unwrap();

    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.submitted.len(), 1);
    let rejected = &report.rejected[0];
    assert_eq!(rejected.remote_uid, "jdoe");
    assert_eq!(rejected.result.state, OperationState::NotExecuted);
    assert_eq!(rejected.result.code.as_deref(), Some(MAPPING_FAILED_CODE));
    assert!(rejected
        .result
        .cause
        .as_deref()
        .unwrap()
        .contains("mandatory attribute mail"));

    let stats = h.service.stats().await.unwrap();
    assert_eq!(stats.queued, 1);
    assert_eq!(h.connector.call_count(), 0);
}

#[tokio::test]
async fn test_sync_failure_is_reported() {
    let h = TestHarness::new();
    let (_, coordinator) = coordinator(&h);
    h.connector
        .fail_next(1, MockFailure::Constraint("cn is mandatory".to_string()));

    let changes = vec![RoleChange::add("developer", h.target("jdoe"))];
    let report = coordinator
        .reconcile_and_submit(&changes, &ProvisioningContext::synchronous())
        .await
        .unwrap();

    assert!(report.submitted.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(
        report.failed[0].result.code.as_deref(),
        Some("CONSTRAINT_VIOLATION")
    );
}

// =============================================================================
// Event handler
// =============================================================================

#[tokio::test]
async fn test_async_event_queues_without_contacting_target() {
    let h = TestHarness::new();
    let (_, coordinator) = coordinator(&h);
    let resolver = MockResolver::new().grant("developer", h.target("jdoe"));
    let handler = ProvisioningEventHandler::new(Arc::new(resolver), coordinator);

    let report = handler
        .handle_role_assignment(event(&["developer"], &[], false))
        .await
        .unwrap();

    assert_eq!(report.submitted.len(), 1);
    assert!(!report.submitted[0].is_archived());
    assert_eq!(h.connector.call_count(), 0);

    h.service
        .executor()
        .process_due(Utc::now(), 10)
        .await
        .unwrap();
    assert!(h.connector.has_account("jdoe"));
}

#[tokio::test]
async fn test_event_without_accounts_does_nothing() {
    let h = TestHarness::new();
    let (_, coordinator) = coordinator(&h);
    let handler = ProvisioningEventHandler::new(Arc::new(MockResolver::new()), coordinator);

    let report = handler
        .handle_role_assignment(event(&["unmapped"], &[], true))
        .await
        .unwrap();

    assert!(report.submitted.is_empty());
    assert_eq!(h.service.stats().await.unwrap().queued, 0);
}

#[tokio::test]
async fn test_invalid_event_payload() {
    let h = TestHarness::new();
    let (_, coordinator) = coordinator(&h);
    let handler = ProvisioningEventHandler::new(Arc::new(MockResolver::new()), coordinator);

    let err = handler
        .handle_payload(json!({ "added": ["developer"] }))
        .await
        .unwrap_err();

    assert!(matches!(err, EventError::InvalidPayload(_)));
}
