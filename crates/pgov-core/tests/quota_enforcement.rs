//! Functional tests for external-call quotas and the fallback transition.
//!
//! Quotas are checked against the live tracker through the governance
//! services, so every reservation, granted or not, leaves an audit entry.

use pgov_audit::{ActionType, AuditLog, Decision};
use pgov_core::prelude::*;
use pgov_core::{GovernanceError, GovernanceServices, Severity, ViolationType};
use pgov_policy::QuotaExceeded;
use pgov_test_utils::{ScriptedExecutor, Stages, Step};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::Arc;

fn services() -> GovernanceServices {
    GovernanceServices::new(GovernanceConfig::default(), AuditLog::in_memory()).unwrap()
}

fn denied_quota_checks(services: &GovernanceServices, task: TaskId) -> usize {
    services
        .audit()
        .query_action(task, ActionType::QuotaCheck)
        .unwrap()
        .iter()
        .filter(|e| e.decision == Decision::Denied)
        .count()
}

proptest! {
    /// Tenet: one reservation beyond a role's maximum is always refused, and
    /// exactly one audit entry records the refusal.
    #[test]
    fn one_past_the_maximum_is_refused(
        role_idx in 0usize..5,
        overridden in any::<bool>(),
        primary_failed in any::<bool>(),
    ) {
        let role = Role::ALL[role_idx];
        let s = services();
        let task = TaskId::new();
        if overridden {
            s.quota().grant_override(task);
        }
        if primary_failed {
            s.quota().signal_primary_failure(task);
        }

        let max = s.quota().effective_max(task, role);
        for i in 0..max {
            prop_assert_eq!(s.reserve_call(task, role).unwrap(), i);
        }
        let refused = s.reserve_call(task, role);
        let is_quota_exceeded = matches!(
            refused,
            Err(GovernanceError::QuotaExceeded(QuotaExceeded { current, .. })) if current == max
        );
        prop_assert!(is_quota_exceeded);
        prop_assert_eq!(denied_quota_checks(&s, task), 1);
        prop_assert_eq!(s.quota().usage(task, role), max);
    }
}

/// Tenet: a role with one call gets index 0, then QuotaExceeded(1, 1).
#[test]
fn single_call_role_refused_on_second_reservation() {
    let s = services();
    let task = TaskId::new();

    assert_eq!(s.reserve_call(task, Role::Critic).unwrap(), 0);
    match s.reserve_call(task, Role::Critic) {
        Err(GovernanceError::QuotaExceeded(e)) => {
            assert_eq!((e.current, e.max, e.attempted), (1, 1, 2));
        }
        other => panic!("expected QuotaExceeded, got {other:?}"),
    }
}

/// Tenet: the Summarizer has no calls without a governance override.
#[test]
fn summarizer_refused_without_override() {
    let s = services();
    let task = TaskId::new();
    s.quota().signal_primary_failure(task);

    match s.reserve_call(task, Role::Summarizer) {
        Err(GovernanceError::QuotaExceeded(e)) => {
            assert_eq!((e.current, e.max), (0, 0));
        }
        other => panic!("expected QuotaExceeded, got {other:?}"),
    }

    let other_task = TaskId::new();
    s.quota().grant_override(other_task);
    assert_eq!(s.reserve_call(other_task, Role::Summarizer).unwrap(), 0);
}

/// Tenet: concurrent reservations never exceed the maximum.
#[test]
fn concurrent_reservations_respect_maximum() {
    let s = Arc::new(services());
    let task = TaskId::new();

    let granted: usize = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let s = Arc::clone(&s);
                scope.spawn(move || usize::from(s.reserve_call(task, Role::Drafter).is_ok()))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    assert_eq!(granted, 2);
    assert_eq!(s.quota().usage(task, Role::Drafter), 2);
    assert_eq!(denied_quota_checks(&s, task), 30);
    let indices: Vec<_> = s
        .quota()
        .records(task, Role::Drafter)
        .iter()
        .map(|r| r.call_index)
        .collect();
    assert_eq!(indices, vec![0, 1]);
}

/// Tenet: an extra call beyond the stage's allowance rejects the task.
#[tokio::test]
async fn extra_call_over_quota_rejects_task() {
    let mut stages = Stages::echo();
    stages.critic = ScriptedExecutor::once(Step::ReserveCall);
    let orch = stages.orchestrator();

    let outcome = orch.run(TaskRequest::new("quota")).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Rejected);
    assert_eq!(
        outcome.violations[0].violation_type,
        ViolationType::QuotaExceeded
    );
    assert_eq!(outcome.violations[0].severity, Severity::High);
    assert_eq!(outcome.usage.calls_for(Role::Critic), 1);
    assert_eq!(stages.revisor.calls(), 0);
}

/// Tenet: the Drafter may use its second call.
#[tokio::test]
async fn extra_call_within_quota_is_granted() {
    let mut stages = Stages::echo();
    stages.drafter = ScriptedExecutor::once(Step::ReserveCall);
    let orch = stages.orchestrator();

    let outcome = orch.run(TaskRequest::new("quota")).await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(outcome.usage.calls_for(Role::Drafter), 2);
}

/// Tenet: a terminal stage may switch to the external service once.
///
/// The Revisor's deterministic service fails, the primary-failure signal
/// unlocks its single external call, and the task completes.
#[tokio::test]
async fn revisor_falls_back_to_external_once() {
    let mut stages = Stages::echo();
    stages.revisor = ScriptedExecutor::once(Step::Fail(ExternalCallFailure::Unavailable(
        "style service down".into(),
    )));
    let orch = stages.orchestrator();

    let outcome = orch.run(TaskRequest::new("fallback")).await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(stages.revisor.calls(), 1);
    assert_eq!(stages.revisor_external.calls(), 1);
    assert_eq!(
        stages.revisor_external.inputs()[0].mode,
        ExecutionMode::External
    );
    assert_eq!(outcome.usage.calls_for(Role::Revisor), 1);

    let transitions = orch
        .services()
        .audit()
        .query_action(outcome.task_id, ActionType::FallbackTransition)
        .unwrap();
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].role, Some(Role::Revisor));
}

/// Tenet: the fallback transition is spent once per task.
///
/// After the Revisor used it, a Summarizer failure is not retried even though
/// an override would give it an external call.
#[tokio::test]
async fn second_fallback_is_refused() {
    let mut stages = Stages::echo();
    stages.revisor = ScriptedExecutor::once(Step::Fail(ExternalCallFailure::Unavailable(
        "style service down".into(),
    )));
    stages.summarizer = ScriptedExecutor::once(Step::Fail(ExternalCallFailure::Failed(
        "compressor crashed".into(),
    )));
    let orch = stages.orchestrator();

    let outcome = orch
        .run(TaskRequest::new("fallback").with_override())
        .await
        .unwrap();

    assert_eq!(outcome.status, TaskStatus::Rejected);
    assert_eq!(stages.summarizer_external.calls(), 0);
    assert_eq!(
        outcome.violations[0].violation_type,
        ViolationType::ExternalCallFailure
    );
    assert!(outcome.final_output().is_none());
}

/// Tenet: without an override the Summarizer has nothing to fall back to.
#[tokio::test]
async fn summarizer_failure_without_override_rejects() {
    let mut stages = Stages::echo();
    stages.summarizer = ScriptedExecutor::once(Step::Fail(ExternalCallFailure::Unavailable(
        "compressor down".into(),
    )));
    let orch = stages.orchestrator();

    let outcome = orch.run(TaskRequest::new("no override")).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Rejected);
    assert_eq!(stages.summarizer_external.calls(), 0);
    assert_eq!(outcome.usage.calls_for(Role::Summarizer), 0);
}

/// Tenet: with an override the Summarizer falls back and completes.
#[tokio::test]
async fn summarizer_failure_with_override_falls_back() {
    let mut stages = Stages::echo();
    stages.summarizer = ScriptedExecutor::once(Step::Fail(ExternalCallFailure::Unavailable(
        "compressor down".into(),
    )));
    let orch = stages.orchestrator();

    let outcome = orch
        .run(TaskRequest::new("override").with_override())
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_eq!(stages.summarizer_external.calls(), 1);
    assert_eq!(outcome.usage.calls_for(Role::Summarizer), 1);
    assert_eq!(
        outcome.final_output(),
        Some("summarizer: revisor: critic: drafter: ideator: override")
    );
}

/// Tenet: stages without a fallback treat an executor failure as fatal to the
/// stage.
#[tokio::test]
async fn drafter_failure_rejects_without_retry() {
    let mut stages = Stages::echo();
    stages.drafter = ScriptedExecutor::once(Step::Fail(ExternalCallFailure::Unavailable(
        "reasoning service down".into(),
    )));
    let orch = stages.orchestrator();

    let outcome = orch.run(TaskRequest::new("no retry")).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Rejected);
    assert_eq!(stages.drafter.calls(), 1);
    assert_eq!(stages.critic.calls(), 0);
    assert_eq!(outcome.violations[0].severity, Severity::High);
}
