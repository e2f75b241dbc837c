//! Violation classification and containment
//!
//! Every governance finding becomes a [`Violation`] with a severity:
//!
//! | Severity | Containment |
//! |---|---|
//! | Critical | terminate the task and cancel its in-flight invocation |
//! | High | reject the stage output, task ends Rejected |
//! | Medium | record a warning, continue |
//!
//! Each violation is written to the audit log exactly once, including when
//! containment itself fails.

use crate::error::GovernanceError;
use crate::registry::TaskRegistry;
use crate::types::PipelineState;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use pgov_audit::{ActionType, AuditEvent, AuditLog};
use pgov_policy::{Role, SeverityPolicy, TaskId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use ulid::Ulid;

/// Unique violation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViolationId(pub Ulid);

impl ViolationId {
    /// Generate new violation ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ViolationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ViolationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What was violated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    /// Access validator denial
    UnauthorizedAccess,
    /// Call or query quota exhausted
    QuotaExceeded,
    /// Executor or external service failure
    ExternalCallFailure,
    /// Critic content verdict
    CriticalContentFailure,
    /// Post-stage check failed
    ValidationFailure,
    /// Attribution entry altered
    ImmutableRecordMutation,
    /// Audit store refused a write
    AuditUnavailable,
    /// Connector throttling
    RateLimited,
    /// Input dropped before merging
    InputValidation,
}

impl ViolationType {
    /// Stable name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationType::UnauthorizedAccess => "unauthorized_access",
            ViolationType::QuotaExceeded => "quota_exceeded",
            ViolationType::ExternalCallFailure => "external_call_failure",
            ViolationType::CriticalContentFailure => "critical_content_failure",
            ViolationType::ValidationFailure => "validation_failure",
            ViolationType::ImmutableRecordMutation => "immutable_record_mutation",
            ViolationType::AuditUnavailable => "audit_unavailable",
            ViolationType::RateLimited => "rate_limited",
            ViolationType::InputValidation => "input_validation",
        }
    }
}

impl std::fmt::Display for ViolationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Violation severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Log and continue
    Medium,
    /// Reject the stage output
    High,
    /// Terminate the task
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Medium => f.write_str("medium"),
            Severity::High => f.write_str("high"),
            Severity::Critical => f.write_str("critical"),
        }
    }
}

/// A classified governance finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Unique id, the idempotency key for handling
    pub id: ViolationId,
    /// What was violated
    pub violation_type: ViolationType,
    /// How severe it is
    pub severity: Severity,
    /// Owning task
    pub task_id: TaskId,
    /// Role involved, if any
    pub role: Option<Role>,
    /// Human-readable context
    pub context: String,
    /// Detection time
    pub detected_at: DateTime<Utc>,
}

/// Outcome of handling a violation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Containment {
    /// Task terminated
    Terminated,
    /// Stage output rejected, task ended Rejected
    Rejected,
    /// Warning recorded
    Warned,
    /// Containment could not be applied
    Failed { reason: String },
}

impl std::fmt::Display for Containment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Containment::Terminated => f.write_str("terminated"),
            Containment::Rejected => f.write_str("rejected"),
            Containment::Warned => f.write_str("warned"),
            Containment::Failed { reason } => write!(f, "failed ({reason})"),
        }
    }
}

/// Maps governance errors to violation types and severities
#[derive(Debug, Clone, Copy, Default)]
pub struct ViolationClassifier {
    policy: SeverityPolicy,
}

impl ViolationClassifier {
    /// Create classifier with severity thresholds
    #[must_use]
    pub fn new(policy: SeverityPolicy) -> Self {
        Self { policy }
    }

    /// Type and severity of an error
    #[must_use]
    pub fn classify(&self, error: &GovernanceError) -> (ViolationType, Severity) {
        match error {
            GovernanceError::UnauthorizedAccess(denial) => {
                let severity = if denial.reason.is_role_level() {
                    Severity::Critical
                } else {
                    Severity::High
                };
                (ViolationType::UnauthorizedAccess, severity)
            }
            GovernanceError::QuotaExceeded(exceeded) => {
                let severity = if self
                    .policy
                    .is_large_overage(exceeded.attempted, exceeded.max)
                {
                    Severity::Critical
                } else {
                    Severity::High
                };
                (ViolationType::QuotaExceeded, severity)
            }
            GovernanceError::ExternalCallFailure(_) => {
                (ViolationType::ExternalCallFailure, Severity::High)
            }
            GovernanceError::CriticalContentFailure { .. } => {
                (ViolationType::CriticalContentFailure, Severity::High)
            }
            GovernanceError::ValidationFailure(_) => {
                (ViolationType::ValidationFailure, Severity::High)
            }
            GovernanceError::ImmutableRecordMutation { .. } => {
                (ViolationType::ImmutableRecordMutation, Severity::Critical)
            }
            GovernanceError::AuditUnavailable(_) => {
                (ViolationType::AuditUnavailable, Severity::Critical)
            }
            GovernanceError::RateLimited { .. } => (ViolationType::RateLimited, Severity::Medium),
            GovernanceError::InputValidation(_) => {
                (ViolationType::InputValidation, Severity::Medium)
            }
        }
    }

    /// Build a violation for an error
    #[must_use]
    pub fn violation(
        &self,
        task_id: TaskId,
        role: Option<Role>,
        error: &GovernanceError,
    ) -> Violation {
        let (violation_type, severity) = self.classify(error);
        Violation {
            id: ViolationId::new(),
            violation_type,
            severity,
            task_id,
            role,
            context: error.to_string(),
            detected_at: Utc::now(),
        }
    }
}

/// Applies containment and records violations
#[derive(Debug)]
pub struct ViolationHandler {
    classifier: ViolationClassifier,
    registry: Arc<TaskRegistry>,
    audit: AuditLog,
    handled: DashMap<ViolationId, Arc<OnceCell<Containment>>>,
    by_task: DashMap<TaskId, Vec<Violation>>,
}

impl ViolationHandler {
    /// Create handler
    #[must_use]
    pub fn new(classifier: ViolationClassifier, registry: Arc<TaskRegistry>, audit: AuditLog) -> Self {
        Self {
            classifier,
            registry,
            audit,
            handled: DashMap::new(),
            by_task: DashMap::new(),
        }
    }

    /// Classifier in use
    #[must_use]
    pub fn classifier(&self) -> &ViolationClassifier {
        &self.classifier
    }

    /// Classify an error and handle the resulting violation
    pub fn raise(&self, task_id: TaskId, role: Option<Role>, error: &GovernanceError) -> Containment {
        let violation = self.classifier.violation(task_id, role, error);
        self.handle(violation)
    }

    /// Contain and record a violation
    ///
    /// Handling the same violation id again returns the first outcome without
    /// side effects. Only callers racing on the same id wait for each other.
    pub fn handle(&self, violation: Violation) -> Containment {
        let slot = Arc::clone(self.handled.entry(violation.id).or_default().value());
        slot.get_or_init(|| self.contain(violation)).clone()
    }

    fn contain(&self, violation: Violation) -> Containment {
        let reason = format!("{}: {}", violation.violation_type, violation.context);
        let applied = match violation.severity {
            Severity::Critical => self
                .registry
                .terminate(violation.task_id, reason.clone())
                .map(|_| Containment::Terminated),
            Severity::High => self
                .registry
                .reject(violation.task_id, reason.clone())
                .map(|_| Containment::Rejected),
            Severity::Medium => Ok(Containment::Warned),
        };
        let mut containment = applied.unwrap_or_else(|e| Containment::Failed {
            reason: e.to_string(),
        });

        let mut event = AuditEvent::new(violation.task_id, ActionType::Violation)
            .resource(violation.violation_type.as_str())
            .denied()
            .detail(format!(
                "id={} severity={} containment={} context={}",
                violation.id, violation.severity, containment, violation.context
            ));
        if let Some(role) = violation.role {
            event = event.role(role);
        }
        if let Err(err) = self.audit.append(event) {
            // an unrecorded violation cannot be left to continue
            tracing::error!(task_id = %violation.task_id, error = %err, "violation could not be audited");
            if containment == Containment::Warned {
                let escalated = self
                    .registry
                    .terminate(violation.task_id, format!("audit unavailable: {err}"));
                if let Ok(PipelineState::Terminated) = escalated {
                    containment = Containment::Terminated;
                }
            }
        }

        match violation.severity {
            Severity::Critical => tracing::error!(
                task_id = %violation.task_id,
                violation = %violation.violation_type,
                %containment,
                context = %violation.context,
                "critical violation"
            ),
            Severity::High => tracing::warn!(
                task_id = %violation.task_id,
                violation = %violation.violation_type,
                %containment,
                context = %violation.context,
                "stage output rejected"
            ),
            Severity::Medium => tracing::warn!(
                task_id = %violation.task_id,
                violation = %violation.violation_type,
                context = %violation.context,
                "governance warning"
            ),
        }

        self.by_task
            .entry(violation.task_id)
            .or_default()
            .push(violation);
        containment
    }

    /// Violations recorded for a task, in handling order
    #[must_use]
    pub fn violations(&self, task_id: TaskId) -> Vec<Violation> {
        self.by_task
            .get(&task_id)
            .map(|v| v.value().clone())
            .unwrap_or_default()
    }

    /// Containment applied to a violation
    #[must_use]
    pub fn containment(&self, id: ViolationId) -> Option<Containment> {
        self.handled.get(&id).and_then(|c| c.value().get().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExternalCallFailure;
    use crate::types::Task;
    use pgov_audit::{AuditEntry, AuditError, AuditStore};
    use pgov_policy::{AccessDenial, DenialReason, QuotaExceeded, QuotaKind, ResourceKind};
    use std::sync::mpsc;
    use std::time::Duration;

    fn setup() -> (Arc<TaskRegistry>, AuditLog, ViolationHandler, TaskId) {
        let registry = Arc::new(TaskRegistry::new());
        let audit = AuditLog::in_memory();
        let task = Task::new(TaskId::new(), "p".into(), "general".into());
        let id = task.task_id;
        registry.register(task).unwrap();
        let handler = ViolationHandler::new(
            ViolationClassifier::default(),
            Arc::clone(&registry),
            audit.clone(),
        );
        (registry, audit, handler, id)
    }

    fn quota(attempted: u32, max: u32) -> GovernanceError {
        GovernanceError::QuotaExceeded(QuotaExceeded {
            task_id: TaskId::new(),
            role: Role::Drafter,
            kind: QuotaKind::ExternalCall,
            current: max,
            max,
            attempted,
        })
    }

    #[test]
    fn severity_table() {
        let c = ViolationClassifier::default();
        let role_level = GovernanceError::UnauthorizedAccess(AccessDenial {
            role: Role::Drafter,
            kind: ResourceKind::DataSource,
            resource: "personal_notes?limit=1".into(),
            reason: DenialReason::RoleNotPermitted {
                data_source: pgov_policy::DataSource::PersonalNotes,
            },
        });
        let sub_rule = GovernanceError::UnauthorizedAccess(AccessDenial {
            role: Role::Drafter,
            kind: ResourceKind::DataSource,
            resource: "social_posts?limit=9".into(),
            reason: DenialReason::SnippetCapExceeded {
                requested: 9,
                cap: 5,
            },
        });
        assert_eq!(c.classify(&role_level).1, Severity::Critical);
        assert_eq!(c.classify(&sub_rule).1, Severity::High);
        assert_eq!(c.classify(&quota(3, 2)).1, Severity::High);
        assert_eq!(c.classify(&quota(5, 2)).1, Severity::Critical);
        assert_eq!(
            c.classify(&GovernanceError::ExternalCallFailure(
                ExternalCallFailure::Timeout(Duration::from_secs(1))
            )),
            (ViolationType::ExternalCallFailure, Severity::High)
        );
        assert_eq!(
            c.classify(&GovernanceError::RateLimited {
                resource: "social_posts".into()
            })
            .1,
            Severity::Medium
        );
    }

    #[test]
    fn ratio_is_configurable() {
        let strict = ViolationClassifier::new(SeverityPolicy {
            critical_overage_ratio: 0.0,
        });
        assert_eq!(strict.classify(&quota(3, 2)).1, Severity::Critical);
    }

    #[test]
    fn critical_terminates_and_audits_once() {
        let (registry, audit, handler, id) = setup();
        let violation = handler.classifier().violation(
            id,
            Some(Role::Drafter),
            &GovernanceError::ImmutableRecordMutation {
                source_id: "a1".into(),
            },
        );

        assert_eq!(handler.handle(violation.clone()), Containment::Terminated);
        assert_eq!(handler.handle(violation), Containment::Terminated);

        assert_eq!(registry.state(id), Some(PipelineState::Terminated));
        assert_eq!(
            audit.query_action(id, ActionType::Violation).unwrap().len(),
            1
        );
        assert_eq!(handler.violations(id).len(), 1);
    }

    #[test]
    fn high_rejects_medium_warns() {
        let (registry, _audit, handler, id) = setup();
        let warn = handler.raise(id, None, &GovernanceError::InputValidation("x".into()));
        assert_eq!(warn, Containment::Warned);
        assert_eq!(registry.state(id), Some(PipelineState::Ideator));

        let reject = handler.raise(
            id,
            Some(Role::Ideator),
            &GovernanceError::ValidationFailure("empty output".into()),
        );
        assert_eq!(reject, Containment::Rejected);
        assert_eq!(registry.state(id), Some(PipelineState::Rejected));
    }

    #[test]
    fn unknown_task_still_audited() {
        let (_registry, audit, handler, _id) = setup();
        let stranger = TaskId::new();
        let out = handler.raise(
            stranger,
            None,
            &GovernanceError::ValidationFailure("orphan".into()),
        );
        assert!(matches!(out, Containment::Failed { .. }));
        let entries = audit.query(stranger).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].detail.contains("containment=failed"));
    }

    #[derive(Debug)]
    struct DownStore;

    impl AuditStore for DownStore {
        fn append(&self, _event: AuditEvent) -> Result<AuditEntry, AuditError> {
            Err(AuditError::unavailable("down"))
        }
        fn query(&self, _task_id: TaskId) -> Result<Vec<AuditEntry>, AuditError> {
            Ok(Vec::new())
        }
        fn task_ids(&self) -> Vec<TaskId> {
            Vec::new()
        }
        fn name(&self) -> &'static str {
            "down"
        }
    }

    #[test]
    fn unaudited_warning_escalates_to_termination() {
        let registry = Arc::new(TaskRegistry::new());
        let task = Task::new(TaskId::new(), "p".into(), "general".into());
        let id = task.task_id;
        registry.register(task).unwrap();
        let handler = ViolationHandler::new(
            ViolationClassifier::default(),
            Arc::clone(&registry),
            AuditLog::new(Arc::new(DownStore)),
        );

        let out = handler.raise(id, None, &GovernanceError::InputValidation("x".into()));
        assert_eq!(out, Containment::Terminated);
        assert_eq!(registry.state(id), Some(PipelineState::Terminated));
    }

    /// Store that holds appends for one task until released
    #[derive(Debug)]
    struct GatedStore {
        inner: pgov_audit::MemoryAuditStore,
        gated: TaskId,
        entered: parking_lot::Mutex<mpsc::Sender<()>>,
        release: parking_lot::Mutex<mpsc::Receiver<()>>,
    }

    impl AuditStore for GatedStore {
        fn append(&self, event: AuditEvent) -> Result<AuditEntry, AuditError> {
            if event.task_id == self.gated {
                let _ = self.entered.lock().send(());
                let _ = self.release.lock().recv();
            }
            self.inner.append(event)
        }
        fn query(&self, task_id: TaskId) -> Result<Vec<AuditEntry>, AuditError> {
            self.inner.query(task_id)
        }
        fn task_ids(&self) -> Vec<TaskId> {
            self.inner.task_ids()
        }
        fn name(&self) -> &'static str {
            "gated"
        }
    }

    #[test]
    fn slow_audit_does_not_block_other_tasks() {
        let registry = Arc::new(TaskRegistry::new());
        let slow = TaskId::new();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let handler = Arc::new(ViolationHandler::new(
            ViolationClassifier::default(),
            Arc::clone(&registry),
            AuditLog::new(Arc::new(GatedStore {
                inner: pgov_audit::MemoryAuditStore::new(),
                gated: slow,
                entered: parking_lot::Mutex::new(entered_tx),
                release: parking_lot::Mutex::new(release_rx),
            })),
        ));

        let blocked = {
            let handler = Arc::clone(&handler);
            std::thread::spawn(move || {
                handler.raise(slow, None, &GovernanceError::InputValidation("slow".into()))
            })
        };
        entered_rx.recv().unwrap();

        // enough ids to share a shard with the one being handled
        let others: Vec<TaskId> = (0..256).map(|_| TaskId::new()).collect();
        for &task in &others {
            let out = handler.raise(task, None, &GovernanceError::InputValidation("x".into()));
            assert_eq!(out, Containment::Warned);
        }

        release_tx.send(()).unwrap();
        assert_eq!(blocked.join().unwrap(), Containment::Warned);
        assert_eq!(handler.violations(slow).len(), 1);
        assert!(others.iter().all(|t| handler.violations(*t).len() == 1));
    }
}
