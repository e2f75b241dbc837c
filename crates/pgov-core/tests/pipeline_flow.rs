//! End-to-end tests for the governed stage sequence.
//!
//! Each scenario drives a full task through the orchestrator with scripted
//! executors and checks the three things a reviewer reads afterwards: the
//! task outcome, which executors ran, and what the audit trail says.

use pgov_audit::{ActionType, Decision};
use pgov_core::prelude::*;
use pgov_core::{Severity, ViolationType, GOVERNANCE_HEADER};
use pgov_test_utils::{fixed_time, ScriptedExecutor, Stages, Step};
use pretty_assertions::assert_eq;

fn notes_source_id(i: u32) -> String {
    format!("{}-{i}", DataSource::PersonalNotes)
}

/// Tenet: a clean task visits every stage once, in order, and completes.
///
/// Every executor receives the same governance header, and the Summarizer's
/// content becomes the final output.
#[tokio::test]
async fn clean_task_visits_every_stage_in_order() {
    let stages = Stages::echo();
    let orch = stages.orchestrator();

    let outcome = orch.run(TaskRequest::new("ownership in rust")).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(
        outcome.final_output(),
        Some("summarizer: revisor: critic: drafter: ideator: ownership in rust")
    );
    for role in Role::ALL {
        let exec = stages.get(role);
        assert_eq!(exec.calls(), 1, "{role} should run exactly once");
        assert!(std::ptr::eq(exec.inputs()[0].header, &GOVERNANCE_HEADER));
    }
    assert_eq!(stages.revisor_external.calls(), 0);
    assert_eq!(stages.summarizer_external.calls(), 0);
    assert!(outcome.violations.is_empty());
    assert!(outcome.warnings.is_empty());
}

/// Tenet: the audit trail of a task is ordered stage by stage.
///
/// The start of stage N+1 is strictly later than the end of stage N, and the
/// whole chain verifies.
#[tokio::test]
async fn stage_audit_entries_are_strictly_ordered() {
    let stages = Stages::echo();
    let orch = stages.orchestrator();
    let outcome = orch.run(TaskRequest::new("ordering")).await.unwrap();
    let audit = orch.services().audit();

    let starts = audit
        .query_action(outcome.task_id, ActionType::StageStart)
        .unwrap();
    let ends = audit
        .query_action(outcome.task_id, ActionType::StageEnd)
        .unwrap();
    assert_eq!(starts.len(), 5);
    assert_eq!(ends.len(), 5);
    for (i, end) in ends.iter().take(4).enumerate() {
        assert!(
            starts[i + 1].timestamp > end.timestamp,
            "stage {} started before stage {i} ended",
            i + 1
        );
    }

    let all = audit.query(outcome.task_id).unwrap();
    assert!(all.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert_eq!(all.first().unwrap().action_type, ActionType::TaskSubmitted);
    assert_eq!(all.last().unwrap().action_type, ActionType::TaskFinished);
    audit.verify_integrity(outcome.task_id).unwrap();
}

/// Tenet: attribution gathered early survives unchanged to the final bundle.
#[tokio::test]
async fn attribution_is_preserved_to_completion() {
    let mut stages = Stages::echo();
    stages.ideator = ScriptedExecutor::once(Step::QuerySource {
        source: DataSource::PersonalNotes,
        limit: 3,
        engagement_fields: true,
    });
    stages.drafter = ScriptedExecutor::once(Step::QuerySource {
        source: DataSource::PublishedArticles,
        limit: 2,
        engagement_fields: false,
    });
    let orch = stages.orchestrator();

    let outcome = orch.run(TaskRequest::new("attribution")).await.unwrap();
    assert!(outcome.is_completed());

    let bundle = outcome.bundle.unwrap();
    let ids: Vec<_> = bundle
        .attribution
        .iter()
        .map(|a| a.source_id.as_str())
        .collect();
    assert_eq!(
        ids,
        vec![
            "personal_notes-0",
            "personal_notes-1",
            "personal_notes-2",
            "published_articles-0",
            "published_articles-1",
        ]
    );
    let first = bundle.attribution_for(&notes_source_id(0)).unwrap();
    assert_eq!(first.retrieved_at, fixed_time());
    assert!(first.excerpt.starts_with("personal_notes snippet 0"));
    assert_eq!(
        bundle.input_sources,
        vec!["personal_notes".to_string(), "published_articles".to_string()]
    );
}

/// Tenet: a Critic critical content failure skips Revisor and Summarizer.
///
/// The task ends Rejected (High), the bundle is returned without final output,
/// and neither downstream executor is ever invoked.
#[tokio::test]
async fn critical_content_failure_skips_remaining_stages() {
    let mut critique = StageOutput::new("this draft cites a study that does not exist")
        .with_critical_flag("fabricated study")
        .critical_failure();
    critique.long_tail_keywords = vec!["critic-keyword".to_string()];
    critique.tone_flags.safety_flags = vec!["critic-safety".to_string()];
    let mut stages = Stages::echo();
    stages.critic = ScriptedExecutor::once(Step::Carry(critique));
    let orch = stages.orchestrator();

    let outcome = orch.run(TaskRequest::new("health claims")).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Rejected);
    assert_eq!(stages.revisor.calls(), 0);
    assert_eq!(stages.summarizer.calls(), 0);
    assert_eq!(stages.revisor_external.calls(), 0);
    assert_eq!(stages.summarizer_external.calls(), 0);
    assert_eq!(outcome.violations.len(), 1);
    assert_eq!(
        outcome.violations[0].violation_type,
        ViolationType::CriticalContentFailure
    );
    assert_eq!(outcome.highest_severity(), Some(Severity::High));
    assert_eq!(outcome.final_output(), None);

    // the rejected critique is withheld; earlier stages remain
    let bundle = outcome.bundle.unwrap();
    assert_eq!(bundle.role, Role::Drafter);
    assert!(bundle.long_tail_keywords.is_empty());
    assert!(bundle.tone_flags.safety_flags.is_empty());
}

/// Tenet: altering an existing attribution entry is a Critical violation.
///
/// The task is terminated and no partial content is returned.
#[tokio::test]
async fn altered_attribution_terminates_task() {
    let mut stages = Stages::echo();
    stages.ideator = ScriptedExecutor::once(Step::QuerySource {
        source: DataSource::PersonalNotes,
        limit: 2,
        engagement_fields: false,
    });
    stages.drafter = ScriptedExecutor::once(Step::Output(
        StageOutput::new("draft").with_attribution(vec![Attribution {
            source_id: notes_source_id(0),
            origin: "personal_notes".to_string(),
            excerpt: "a more convenient quote".to_string(),
            retrieved_at: fixed_time(),
        }]),
    ));
    let orch = stages.orchestrator();

    let outcome = orch.run(TaskRequest::new("quotes")).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Terminated);
    assert!(outcome.bundle.is_none());
    assert_eq!(
        outcome.violations[0].violation_type,
        ViolationType::ImmutableRecordMutation
    );
    assert_eq!(outcome.highest_severity(), Some(Severity::Critical));
    assert_eq!(stages.critic.calls(), 0);
}

/// Tenet: dropping attribution rejects the stage output.
#[tokio::test]
async fn dropped_attribution_rejects_task() {
    let mut stages = Stages::echo();
    stages.ideator = ScriptedExecutor::once(Step::QuerySource {
        source: DataSource::SocialPosts,
        limit: 2,
        engagement_fields: false,
    });
    stages.drafter =
        ScriptedExecutor::once(Step::Output(StageOutput::new("draft")));
    let orch = stages.orchestrator();

    let outcome = orch.run(TaskRequest::new("social")).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Rejected);
    assert_eq!(
        outcome.violations[0].violation_type,
        ViolationType::ValidationFailure
    );
    assert_eq!(stages.critic.calls(), 0);
}

/// Tenet: once the Critic flags content, later stages may only make claims
/// backed by validated attribution.
#[tokio::test]
async fn unvalidated_claims_after_critic_flag_are_rejected() {
    let mut stages = Stages::echo();
    stages.ideator = ScriptedExecutor::once(Step::QuerySource {
        source: DataSource::PersonalNotes,
        limit: 1,
        engagement_fields: false,
    });
    stages.critic = ScriptedExecutor::once(Step::Carry(
        StageOutput::new("reviewed").with_critical_flag("statistic needs a source"),
    ));
    stages.revisor = ScriptedExecutor::once(Step::Carry(
        StageOutput::new("revised").with_claims(vec![
            Claim::sourced("as noted earlier", notes_source_id(0)),
            Claim::unsourced("90% of developers agree"),
        ]),
    ));
    let orch = stages.orchestrator();

    let outcome = orch.run(TaskRequest::new("claims")).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Rejected);
    assert_eq!(
        outcome.violations[0].violation_type,
        ViolationType::ValidationFailure
    );
    assert!(outcome.violations[0].context.contains("score 0.50"));
    assert_eq!(stages.summarizer.calls(), 0);
}

/// Tenet: the same claims pass when every one is backed.
#[tokio::test]
async fn validated_claims_after_critic_flag_pass() {
    let mut stages = Stages::echo();
    stages.ideator = ScriptedExecutor::once(Step::QuerySource {
        source: DataSource::PersonalNotes,
        limit: 1,
        engagement_fields: false,
    });
    stages.critic = ScriptedExecutor::once(Step::Carry(
        StageOutput::new("reviewed").with_critical_flag("statistic needs a source"),
    ));
    stages.revisor = ScriptedExecutor::once(Step::Carry(
        StageOutput::new("revised")
            .with_claims(vec![Claim::sourced("as noted earlier", notes_source_id(0))]),
    ));
    let orch = stages.orchestrator();

    let outcome = orch.run(TaskRequest::new("claims")).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(
        stages.summarizer.inputs()[0].critic_flags,
        vec!["statistic needs a source".to_string()]
    );
}

/// Tenet: Medium findings surface as warnings beside normal output.
#[tokio::test]
async fn executor_warnings_do_not_stop_the_task() {
    let mut stages = Stages::echo();
    stages.drafter = ScriptedExecutor::once(Step::Carry(
        StageOutput::new("draft").with_warning("voice drifted in paragraph two"),
    ));
    let orch = stages.orchestrator();

    let outcome = orch.run(TaskRequest::new("warnings")).await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(
        outcome.warnings,
        vec!["input rejected: voice drifted in paragraph two".to_string()]
    );
    assert_eq!(outcome.highest_severity(), Some(Severity::Medium));

    let violations = orch
        .services()
        .audit()
        .query_action(outcome.task_id, ActionType::Violation)
        .unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].decision, Decision::Denied);
    assert!(violations[0].detail.contains("containment=warned"));
}

/// Tenet: many tasks run concurrently without interfering.
#[tokio::test]
async fn concurrent_tasks_complete_independently() {
    let stages = Stages::echo();
    let orch = stages.orchestrator();

    let requests = (0..24)
        .map(|i| TaskRequest::new(format!("post {i}")))
        .collect();
    let outcomes = orch.run_many(requests).await;

    assert_eq!(outcomes.len(), 24);
    for outcome in outcomes {
        let outcome = outcome.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.usage.total_calls(), 3);
        orch.services()
            .audit()
            .verify_integrity(outcome.task_id)
            .unwrap();
    }
    assert_eq!(stages.summarizer.calls(), 24);
}
