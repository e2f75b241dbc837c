//! Governed access for running stages
//!
//! A [`StageContext`] is bound to one task and one role. Every data-source
//! query, retrieval lookup and extra external call made by an executor goes
//! through it: the request is validated, counted, bounded in time, audited,
//! and its results trimmed to what the role may see. Findings are raised as
//! violations here, so an executor only ever sees a [`GatewayError`].

use crate::connector::{ConnectorError, RagResult, Snippet};
use crate::error::GovernanceError;
use crate::services::GovernanceServices;
use crate::types::TaskStatus;
use crate::violation::Containment;
use pgov_audit::{ActionType, AuditEvent, Decision};
use pgov_policy::{DataSource, QuotaKind, ResourceRequest, Role, TaskId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Why a governed request produced no result
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Refused by governance; the violation has already been handled
    #[error("refused: {reason} ({containment})")]
    Refused {
        /// Underlying finding
        reason: String,
        /// Containment that was applied
        containment: Containment,
    },

    /// Backend throttled the request
    #[error("rate limited")]
    RateLimited,

    /// Backend unreachable
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// No answer within the configured bound
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// No connector attached for this kind of request
    #[error("no {0} connector configured")]
    NotConfigured(&'static str),

    /// The task has already ended; governed access is closed
    #[error("task already {0}")]
    TaskEnded(TaskStatus),
}

impl GatewayError {
    /// Whether the task may still continue after this error
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Refused { containment, .. } => *containment == Containment::Warned,
            Self::TaskEnded(_) => false,
            _ => true,
        }
    }
}

/// Per-stage handle to governed resources
#[derive(Debug, Clone)]
pub struct StageContext {
    services: Arc<GovernanceServices>,
    task_id: TaskId,
    role: Role,
}

impl StageContext {
    /// Bind services to a task and role
    #[must_use]
    pub fn new(services: Arc<GovernanceServices>, task_id: TaskId, role: Role) -> Self {
        Self {
            services,
            task_id,
            role,
        }
    }

    /// Owning task
    #[inline]
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Role the context acts for
    #[inline]
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Query one of the author's data sources
    ///
    /// Results are capped at the role's snippet limit and stripped of
    /// engagement fields the role may not see.
    ///
    /// # Errors
    /// `GatewayError` if refused, throttled, unavailable or late.
    pub async fn query_source(
        &self,
        source: DataSource,
        text: &str,
        limit: u32,
        engagement_fields: bool,
    ) -> Result<Vec<Snippet>, GatewayError> {
        let request = ResourceRequest::DataSource {
            source,
            limit,
            engagement_fields,
        };
        let resource = request.resource_id();
        self.ensure_open(ActionType::DataSourceQuery, &resource)?;
        let grant = self
            .services
            .check_access(self.task_id, self.role, &request)
            .map_err(|e| self.contain(&e))?;

        let Some(connector) = self.services.data_sources() else {
            self.record_query(ActionType::DataSourceQuery, &resource, false, "no connector")?;
            return Err(GatewayError::NotConfigured("data-source"));
        };

        let bound = self.services.config().pipeline.source_timeout();
        let mut snippets = self
            .bounded(
                ActionType::DataSourceQuery,
                &resource,
                bound,
                connector.query(source, text, limit),
            )
            .await?;

        let cap = grant.max_snippets.unwrap_or(limit).min(limit);
        snippets.truncate(cap as usize);
        if grant.strip_engagement {
            for snippet in &mut snippets {
                snippet.engagement = None;
            }
        }

        self.record_query(
            ActionType::DataSourceQuery,
            &resource,
            true,
            &format!("returned={}", snippets.len()),
        )?;
        Ok(snippets)
    }

    /// Run a retrieval-augmented lookup
    ///
    /// Results without a source or timestamp are dropped with a warning.
    ///
    /// # Errors
    /// `GatewayError` if refused, over quota, throttled, unavailable or late.
    pub async fn retrieval_query(
        &self,
        text: &str,
        domains: &[String],
    ) -> Result<Vec<RagResult>, GatewayError> {
        let request = ResourceRequest::RetrievalQuery {
            text: text.to_string(),
            domains: domains.to_vec(),
        };
        let resource = request.resource_id();
        self.ensure_open(ActionType::RetrievalQuery, &resource)?;
        self.services
            .check_access(self.task_id, self.role, &request)
            .map_err(|e| self.contain(&e))?;
        self.services
            .reserve_rag(self.task_id, self.role)
            .map_err(|e| self.contain(&e))?;

        let Some(connector) = self.services.retrieval() else {
            self.record_query(ActionType::RetrievalQuery, &resource, false, "no connector")?;
            return Err(GatewayError::NotConfigured("retrieval"));
        };

        let bound = self.services.config().rag.timeout();
        let results = self
            .bounded(
                ActionType::RetrievalQuery,
                &resource,
                bound,
                connector.query(text),
            )
            .await?;

        let (kept, dropped): (Vec<_>, Vec<_>) =
            results.into_iter().partition(RagResult::is_attributed);
        if !dropped.is_empty() {
            let finding = GovernanceError::InputValidation(format!(
                "{} retrieval result(s) without source or timestamp dropped",
                dropped.len()
            ));
            if let containment @ (Containment::Terminated | Containment::Rejected) =
                self.services.raise(self.task_id, Some(self.role), &finding)
            {
                return Err(GatewayError::Refused {
                    reason: finding.to_string(),
                    containment,
                });
            }
        }

        self.record_query(
            ActionType::RetrievalQuery,
            &resource,
            true,
            &format!("kept={} dropped={}", kept.len(), dropped.len()),
        )?;
        Ok(kept)
    }

    /// Reserve one more external call for this stage
    ///
    /// Returns the zero-based index of the reserved call.
    ///
    /// # Errors
    /// `GatewayError::Refused` when the role may not call or is out of quota,
    /// `GatewayError::TaskEnded` once the task has ended.
    pub fn reserve_external_call(&self) -> Result<u32, GatewayError> {
        self.ensure_open(ActionType::QuotaCheck, &QuotaKind::ExternalCall.to_string())?;
        self.services
            .check_access(self.task_id, self.role, &ResourceRequest::ExternalCall)
            .map_err(|e| self.contain(&e))?;
        self.services
            .reserve_call(self.task_id, self.role)
            .map_err(|e| self.contain(&e))
    }

    async fn bounded<T, F>(
        &self,
        action: ActionType,
        resource: &str,
        bound: Duration,
        call: F,
    ) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, ConnectorError>>,
    {
        match tokio::time::timeout(bound, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(ConnectorError::RateLimited { retry_after })) => {
                self.record_query(action, resource, false, "rate limited")?;
                tracing::debug!(task_id = %self.task_id, role = %self.role, ?retry_after, "connector throttled");
                let finding = GovernanceError::RateLimited {
                    resource: resource.to_string(),
                };
                match self.services.raise(self.task_id, Some(self.role), &finding) {
                    Containment::Warned => Err(GatewayError::RateLimited),
                    containment => Err(GatewayError::Refused {
                        reason: finding.to_string(),
                        containment,
                    }),
                }
            }
            Ok(Err(ConnectorError::Unavailable(message))) => {
                self.record_query(action, resource, false, &format!("unavailable: {message}"))?;
                Err(GatewayError::Unavailable(message))
            }
            Err(_) => {
                self.record_query(action, resource, false, &format!("timed out after {bound:?}"))?;
                Err(GatewayError::Timeout(bound))
            }
        }
    }

    /// Refuse every request once the task is terminal
    ///
    /// The refusal is audited but raises no new violation; the one that ended
    /// the task already stands.
    fn ensure_open(&self, action: ActionType, resource: &str) -> Result<(), GatewayError> {
        let Some(state) = self.services.registry().state(self.task_id) else {
            return Ok(());
        };
        if !state.is_terminal() {
            return Ok(());
        }
        let status = state.status();
        tracing::warn!(task_id = %self.task_id, role = %self.role, %resource, %status, "request after task end refused");
        let event = AuditEvent::new(self.task_id, action)
            .role(self.role)
            .resource(resource)
            .denied()
            .detail(format!("task already {status}"));
        if let Err(e) = self.services.record(event) {
            tracing::error!(task_id = %self.task_id, error = %e, "refusal could not be audited");
        }
        Err(GatewayError::TaskEnded(status))
    }

    fn record_query(
        &self,
        action: ActionType,
        resource: &str,
        allowed: bool,
        detail: &str,
    ) -> Result<(), GatewayError> {
        self.services
            .record(
                AuditEvent::new(self.task_id, action)
                    .role(self.role)
                    .resource(resource)
                    .decision(Decision::from_allowed(allowed))
                    .detail(detail),
            )
            .map_err(|e| self.contain(&e))
    }

    fn contain(&self, finding: &GovernanceError) -> GatewayError {
        let containment = self.services.raise(self.task_id, Some(self.role), finding);
        GatewayError::Refused {
            reason: finding.to_string(),
            containment,
        }
    }
}
