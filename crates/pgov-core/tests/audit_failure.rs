//! Functional tests for audit availability.
//!
//! A decision that cannot be recorded is not allowed to take effect, so an
//! unavailable store always ends the task.

use pgov_audit::{ActionType, AuditLog, JsonlAuditStore};
use pgov_core::prelude::*;
use pgov_core::{Severity, ViolationType};
use pgov_test_utils::{FailingAuditStore, Stages};
use pretty_assertions::assert_eq;
use std::sync::Arc;

/// Tenet: a task whose submission cannot be audited never runs.
#[tokio::test]
async fn unavailable_store_terminates_before_first_stage() {
    let stages = Stages::echo();
    let store = FailingAuditStore::down();
    let orch = stages
        .builder()
        .audit(AuditLog::new(store.clone()))
        .build()
        .unwrap();

    let outcome = orch.run(TaskRequest::new("unlogged")).await.unwrap();

    assert!(store.is_tripped());
    assert_eq!(outcome.status, TaskStatus::Terminated);
    assert!(outcome.bundle.is_none());
    assert_eq!(
        outcome.violations[0].violation_type,
        ViolationType::AuditUnavailable
    );
    assert_eq!(outcome.violations[0].severity, Severity::Critical);
    for role in Role::ALL {
        assert_eq!(stages.get(role).calls(), 0);
    }
}

/// Tenet: losing the store mid-task stops the pipeline at the next write.
///
/// The Ideator ran, but its completion could not be recorded, so nothing
/// after it runs.
#[tokio::test]
async fn store_failure_mid_task_terminates() {
    let stages = Stages::echo();
    let store = FailingAuditStore::on(ActionType::StageEnd);
    let orch = stages
        .builder()
        .audit(AuditLog::new(store.clone()))
        .build()
        .unwrap();

    let outcome = orch.run(TaskRequest::new("half logged")).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Terminated);
    assert_eq!(stages.ideator.calls(), 1);
    assert_eq!(stages.drafter.calls(), 0);
    assert!(outcome
        .violations
        .iter()
        .any(|v| v.violation_type == ViolationType::AuditUnavailable));

    let recorded = orch.services().audit().query(outcome.task_id).unwrap();
    assert!(recorded
        .iter()
        .all(|e| e.action_type != ActionType::StageEnd));
}

/// Tenet: a file-backed trail survives a restart and still verifies.
#[tokio::test]
async fn jsonl_trail_verifies_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");

    let stages = Stages::echo();
    let store = Arc::new(JsonlAuditStore::open(&path).unwrap());
    let orch = stages
        .builder()
        .audit(AuditLog::new(store))
        .build()
        .unwrap();
    let outcome = orch.run(TaskRequest::new("persisted")).await.unwrap();
    assert!(outcome.is_completed());
    let written = orch.services().audit().query(outcome.task_id).unwrap();
    drop(orch);

    let reopened = AuditLog::new(Arc::new(JsonlAuditStore::open(&path).unwrap()));
    let replayed = reopened.query(outcome.task_id).unwrap();
    assert_eq!(replayed, written);
    reopened.verify_integrity(outcome.task_id).unwrap();
    assert_eq!(reopened.task_ids(), vec![outcome.task_id]);
}
