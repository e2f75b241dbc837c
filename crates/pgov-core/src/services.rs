//! Governance services
//!
//! The enforcement objects shared by the orchestrator, the middleware chain
//! and every stage context. Built once from a [`GovernanceConfig`] and passed
//! around behind an `Arc`; there is no global state.

use crate::connector::{DataSourceConnector, RagConnector};
use crate::error::GovernanceError;
use crate::registry::TaskRegistry;
use crate::violation::{Containment, ViolationClassifier, ViolationHandler};
use pgov_audit::{ActionType, AuditEvent, AuditLog, Decision};
use pgov_policy::{
    AccessGrant, AccessValidator, ConfigError, GovernanceConfig, PermissionMatrix, QuotaKind,
    QuotaTracker, ResourceRequest, Role, TaskId,
};
use std::sync::Arc;

/// Shared enforcement services
#[derive(Debug)]
pub struct GovernanceServices {
    config: GovernanceConfig,
    matrix: Arc<PermissionMatrix>,
    validator: AccessValidator,
    quota: Arc<QuotaTracker>,
    audit: AuditLog,
    registry: Arc<TaskRegistry>,
    violations: Arc<ViolationHandler>,
    data_sources: Option<Arc<dyn DataSourceConnector>>,
    retrieval: Option<Arc<dyn RagConnector>>,
}

impl GovernanceServices {
    /// Build services from a configuration and an audit log
    ///
    /// # Errors
    /// `ConfigError` if the configuration does not validate.
    pub fn new(config: GovernanceConfig, audit: AuditLog) -> Result<Self, ConfigError> {
        config.validate()?;
        let matrix = Arc::new(config.matrix()?);
        let registry = Arc::new(TaskRegistry::new());
        let violations = Arc::new(ViolationHandler::new(
            ViolationClassifier::new(config.severity),
            Arc::clone(&registry),
            audit.clone(),
        ));
        Ok(Self {
            validator: AccessValidator::new(Arc::clone(&matrix)),
            quota: Arc::new(QuotaTracker::new(Arc::clone(&matrix))),
            matrix,
            audit,
            registry,
            violations,
            config,
            data_sources: None,
            retrieval: None,
        })
    }

    /// Attach the data-source connector
    #[must_use]
    pub fn with_data_sources(mut self, connector: Arc<dyn DataSourceConnector>) -> Self {
        self.data_sources = Some(connector);
        self
    }

    /// Attach the retrieval connector
    #[must_use]
    pub fn with_retrieval(mut self, connector: Arc<dyn RagConnector>) -> Self {
        self.retrieval = Some(connector);
        self
    }

    /// Loaded configuration
    #[must_use]
    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    /// Permission matrix
    #[must_use]
    pub fn matrix(&self) -> &Arc<PermissionMatrix> {
        &self.matrix
    }

    /// Quota tracker
    #[must_use]
    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    /// Audit log
    #[must_use]
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Task registry
    #[must_use]
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Violation handler
    #[must_use]
    pub fn violations(&self) -> &ViolationHandler {
        &self.violations
    }

    /// Data-source connector, if attached
    #[must_use]
    pub fn data_sources(&self) -> Option<&Arc<dyn DataSourceConnector>> {
        self.data_sources.as_ref()
    }

    /// Retrieval connector, if attached
    #[must_use]
    pub fn retrieval(&self) -> Option<&Arc<dyn RagConnector>> {
        self.retrieval.as_ref()
    }

    /// Append an audit event
    ///
    /// # Errors
    /// `GovernanceError::AuditUnavailable` if the store refused it.
    pub fn record(&self, event: AuditEvent) -> Result<(), GovernanceError> {
        self.audit.append(event)?;
        Ok(())
    }

    /// Validate a request and record the decision
    ///
    /// # Errors
    /// `UnauthorizedAccess` on denial, `AuditUnavailable` if the decision
    /// could not be recorded.
    pub fn check_access(
        &self,
        task_id: TaskId,
        role: Role,
        request: &ResourceRequest,
    ) -> Result<AccessGrant, GovernanceError> {
        let decision = self.validator.validate(role, request);
        let event = AuditEvent::new(task_id, ActionType::PermissionCheck)
            .role(role)
            .resource(request.resource_id());
        match decision {
            Ok(grant) => {
                self.record(event.detail(request.kind().as_str()))?;
                Ok(grant)
            }
            Err(denial) => {
                tracing::warn!(%task_id, %role, resource = %denial.resource, reason = %denial.reason, "access denied");
                self.record(event.denied().detail(denial.reason.to_string()))?;
                Err(denial.into())
            }
        }
    }

    /// Reserve an external call and record the decision
    ///
    /// # Errors
    /// `QuotaExceeded` when refused, `AuditUnavailable` if the decision could
    /// not be recorded.
    pub fn reserve_call(&self, task_id: TaskId, role: Role) -> Result<u32, GovernanceError> {
        let outcome = self.quota.reserve_call(role, task_id);
        self.record_quota(task_id, role, QuotaKind::ExternalCall, &outcome)?;
        Ok(outcome?)
    }

    /// Reserve a retrieval-augmented query and record the decision
    ///
    /// # Errors
    /// As [`GovernanceServices::reserve_call`].
    pub fn reserve_rag(&self, task_id: TaskId, role: Role) -> Result<u32, GovernanceError> {
        let outcome = self.quota.reserve_rag_query(role, task_id);
        self.record_quota(task_id, role, QuotaKind::RetrievalQuery, &outcome)?;
        Ok(outcome?)
    }

    /// Classify and handle a finding
    pub fn raise(&self, task_id: TaskId, role: Option<Role>, error: &GovernanceError) -> Containment {
        self.violations.raise(task_id, role, error)
    }

    fn record_quota(
        &self,
        task_id: TaskId,
        role: Role,
        kind: QuotaKind,
        outcome: &Result<u32, pgov_policy::QuotaExceeded>,
    ) -> Result<(), GovernanceError> {
        let detail = match outcome {
            Ok(index) => format!("granted index={index}"),
            Err(e) => format!(
                "refused current={} max={} attempted={}",
                e.current, e.max, e.attempted
            ),
        };
        self.record(
            AuditEvent::new(task_id, ActionType::QuotaCheck)
                .role(role)
                .resource(kind.to_string())
                .decision(Decision::from_allowed(outcome.is_ok()))
                .detail(detail),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgov_policy::DataSource;

    fn services() -> GovernanceServices {
        GovernanceServices::new(GovernanceConfig::default(), AuditLog::in_memory()).unwrap()
    }

    #[test]
    fn access_decisions_are_audited() {
        let s = services();
        let task = TaskId::new();
        assert!(s
            .check_access(
                task,
                Role::Ideator,
                &ResourceRequest::data_source(DataSource::PersonalNotes, 20)
            )
            .is_ok());
        let err = s
            .check_access(
                task,
                Role::Drafter,
                &ResourceRequest::data_source(DataSource::PersonalNotes, 1),
            )
            .unwrap_err();
        assert!(matches!(err, GovernanceError::UnauthorizedAccess(_)));

        let checks = s
            .audit()
            .query_action(task, ActionType::PermissionCheck)
            .unwrap();
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0].decision, Decision::Allowed);
        assert_eq!(checks[1].decision, Decision::Denied);
    }

    #[test]
    fn quota_decisions_are_audited() {
        let s = services();
        let task = TaskId::new();
        assert_eq!(s.reserve_call(task, Role::Critic).unwrap(), 0);
        assert!(matches!(
            s.reserve_call(task, Role::Critic),
            Err(GovernanceError::QuotaExceeded(_))
        ));
        let checks = s.audit().query_action(task, ActionType::QuotaCheck).unwrap();
        assert_eq!(checks.len(), 2);
        assert!(checks[1].detail.contains("refused"));
    }
}
