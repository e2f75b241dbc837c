//! Pipeline orchestrator
//!
//! Drives one task at a time through Ideator → Drafter → Critic → Revisor →
//! Summarizer. Many tasks run concurrently; stages within a task never
//! overlap. Each stage:
//!
//! 1. pre-stage checks (order, cancellation, quota for external mode)
//! 2. `StageStart` audit entry
//! 3. executor on the worker pool, under the stage deadline and cancel token
//! 4. post-stage checks on the output
//! 5. merge into the metadata bundle, `StageEnd` audit entry, advance
//!
//! Any finding is handed to the violation handler; once the task has reached
//! a terminal state the run stops and an outcome is assembled from the
//! registry and the handler.

use crate::bundle::MetadataBundle;
use crate::connector::{DataSourceConnector, RagConnector};
use crate::error::{ExternalCallFailure, GovernanceError, PipelineError, PoolError};
use crate::executor::{StageExecutor, StageInput, StageOutput, GOVERNANCE_HEADER};
use crate::gateway::StageContext;
use crate::middleware::{
    ClaimCheck, MiddlewareChain, PostStageCheck, PostStageContext, PreStageCheck,
    PreStageContext, PreStageError, SourcedClaimCheck,
};
use crate::registry::TaskEntry;
use crate::services::GovernanceServices;
use crate::types::{ExecutionMode, PipelineState, Task, TaskRequest, TaskStatus};
use crate::violation::{Severity, Violation};
use crate::worker_pool::{PoolStats, WorkerPool};
use futures::future::join_all;
use pgov_audit::{ActionType, AuditEvent, AuditLog, Decision};
use pgov_policy::{ExternalServicePolicy, GovernanceConfig, Role, TaskId, TaskUsage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// The run stopped because the task reached a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Halt;

/// Mutable state of one run
#[derive(Debug)]
struct RunState {
    bundle: MetadataBundle,
    previous_output: String,
    critic_flags: Vec<String>,
    fallbacks_left: u32,
}

/// Result of one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// Task identifier
    pub task_id: TaskId,
    /// Final status
    pub status: TaskStatus,
    /// Final state
    pub final_state: PipelineState,
    /// Why the task did not complete
    pub reason: Option<String>,
    /// Metadata bundle; withheld when the task was terminated
    pub bundle: Option<MetadataBundle>,
    /// Violations in handling order
    pub violations: Vec<Violation>,
    /// Medium-severity findings surfaced beside the output
    pub warnings: Vec<String>,
    /// Quota consumed by the task
    pub usage: TaskUsage,
}

impl PipelineOutcome {
    /// Whether the task completed
    #[inline]
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// Summarizer output, for completed tasks
    #[must_use]
    pub fn final_output(&self) -> Option<&str> {
        self.bundle.as_ref()?.final_output.as_deref()
    }

    /// Most severe violation recorded
    #[must_use]
    pub fn highest_severity(&self) -> Option<Severity> {
        self.violations.iter().map(|v| v.severity).max()
    }
}

/// Handle to a spawned run
#[derive(Debug)]
pub struct TaskHandle {
    task_id: TaskId,
    join: JoinHandle<Result<PipelineOutcome, PipelineError>>,
}

impl TaskHandle {
    /// Task identifier
    #[inline]
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Wait for the run to finish
    ///
    /// # Errors
    /// The run's `PipelineError`, or `PipelineError::Join` if it panicked.
    pub async fn join(self) -> Result<PipelineOutcome, PipelineError> {
        self.join
            .await
            .map_err(|e| PipelineError::Join(e.to_string()))?
    }
}

/// Builder for [`PipelineOrchestrator`]
#[derive(Debug, Default)]
pub struct OrchestratorBuilder {
    config: GovernanceConfig,
    audit: Option<AuditLog>,
    executors: HashMap<(Role, ExecutionMode), Arc<dyn StageExecutor>>,
    data_sources: Option<Arc<dyn DataSourceConnector>>,
    retrieval: Option<Arc<dyn RagConnector>>,
    claims: Option<Arc<dyn ClaimCheck>>,
    pre: Vec<Arc<dyn PreStageCheck>>,
    post: Vec<Arc<dyn PostStageCheck>>,
}

impl OrchestratorBuilder {
    /// Governance configuration
    #[must_use]
    pub fn config(mut self, config: GovernanceConfig) -> Self {
        self.config = config;
        self
    }

    /// Audit log; in-memory when not set
    #[must_use]
    pub fn audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Executor serving `role` in `mode`
    #[must_use]
    pub fn executor(
        mut self,
        role: Role,
        mode: ExecutionMode,
        executor: Arc<dyn StageExecutor>,
    ) -> Self {
        self.executors.insert((role, mode), executor);
        self
    }

    /// Data-source connector
    #[must_use]
    pub fn data_sources(mut self, connector: Arc<dyn DataSourceConnector>) -> Self {
        self.data_sources = Some(connector);
        self
    }

    /// Retrieval connector
    #[must_use]
    pub fn retrieval(mut self, connector: Arc<dyn RagConnector>) -> Self {
        self.retrieval = Some(connector);
        self
    }

    /// Claim check used once the Critic has flagged content
    #[must_use]
    pub fn claim_check(mut self, check: Arc<dyn ClaimCheck>) -> Self {
        self.claims = Some(check);
        self
    }

    /// Extra pre-stage check, run after the standard ones
    #[must_use]
    pub fn pre_check(mut self, check: Arc<dyn PreStageCheck>) -> Self {
        self.pre.push(check);
        self
    }

    /// Extra post-stage check, run after the standard ones
    #[must_use]
    pub fn post_check(mut self, check: Arc<dyn PostStageCheck>) -> Self {
        self.post.push(check);
        self
    }

    /// Build the orchestrator
    ///
    /// # Errors
    /// - `PipelineError::Config` if the configuration does not validate
    /// - `PipelineError::MissingExecutor` if a role has no executor for its
    ///   initial execution mode
    pub fn build(self) -> Result<PipelineOrchestrator, PipelineError> {
        let mut services =
            GovernanceServices::new(self.config, self.audit.unwrap_or_default())?;
        if let Some(connector) = self.data_sources {
            services = services.with_data_sources(connector);
        }
        if let Some(connector) = self.retrieval {
            services = services.with_retrieval(connector);
        }

        for role in Role::ALL {
            let mode = initial_mode(services.matrix().grant(role).external_policy);
            if !self.executors.contains_key(&(role, mode)) {
                return Err(PipelineError::MissingExecutor { role });
            }
        }

        let mut middleware =
            MiddlewareChain::standard(self.claims.unwrap_or_else(|| Arc::new(SourcedClaimCheck)));
        for check in self.pre {
            middleware = middleware.with_pre(check);
        }
        for check in self.post {
            middleware = middleware.with_post(check);
        }

        let pool = WorkerPool::new(services.config().pipeline.max_concurrent_calls);
        Ok(PipelineOrchestrator {
            services: Arc::new(services),
            executors: self.executors,
            middleware,
            pool,
        })
    }
}

/// Drives tasks through the governed pipeline
#[derive(Debug)]
pub struct PipelineOrchestrator {
    services: Arc<GovernanceServices>,
    executors: HashMap<(Role, ExecutionMode), Arc<dyn StageExecutor>>,
    middleware: MiddlewareChain,
    pool: WorkerPool,
}

impl PipelineOrchestrator {
    /// Start building an orchestrator
    #[must_use]
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Shared governance services
    #[must_use]
    pub fn services(&self) -> &Arc<GovernanceServices> {
        &self.services
    }

    /// Worker pool statistics
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Current status of a task
    #[must_use]
    pub fn status(&self, task_id: TaskId) -> Option<TaskStatus> {
        self.services.registry().status(task_id)
    }

    /// Run a task to its end
    ///
    /// Governance outcomes, including rejection and termination, are reported
    /// in the [`PipelineOutcome`].
    ///
    /// # Errors
    /// `PipelineError::InvalidTask` for an empty prompt,
    /// `PipelineError::DuplicateTask` for a reused task id.
    pub async fn run(&self, request: TaskRequest) -> Result<PipelineOutcome, PipelineError> {
        if request.user_prompt.trim().is_empty() {
            return Err(PipelineError::InvalidTask("empty prompt".to_string()));
        }
        let task_id = request.task_id.unwrap_or_default();
        let entry = self.services.registry().register(Task::new(
            task_id,
            request.user_prompt.clone(),
            request.classification.clone(),
        ))?;
        if request.governance_override {
            self.services.quota().grant_override(task_id);
        }
        tracing::info!(%task_id, classification = %request.classification, "task submitted");

        let mut state = RunState {
            bundle: MetadataBundle::new(task_id),
            previous_output: String::new(),
            critic_flags: Vec::new(),
            fallbacks_left: self.services.config().pipeline.fallback_transitions,
        };

        let submitted = AuditEvent::new(task_id, ActionType::TaskSubmitted)
            .resource(request.classification.as_str())
            .detail(format!("override={}", request.governance_override));
        let driven = match self.services.record(submitted) {
            Ok(()) => self.drive(&entry, &request, &mut state).await,
            Err(e) => self.escalate(task_id, None, &e).and(Err(Halt)),
        };
        if driven.is_err() && !entry.state().is_terminal() {
            // containment could not be applied; never leave a halted task running
            let _ = self
                .services
                .registry()
                .terminate(task_id, "run halted without containment");
        }

        Ok(self.finish(&entry, state))
    }

    /// Run several tasks concurrently on the current task
    pub async fn run_many(
        &self,
        requests: Vec<TaskRequest>,
    ) -> Vec<Result<PipelineOutcome, PipelineError>> {
        join_all(requests.into_iter().map(|r| self.run(r))).await
    }

    /// Run a task on the runtime
    pub fn spawn(self: &Arc<Self>, request: TaskRequest) -> TaskHandle {
        let task_id = request.task_id.unwrap_or_default();
        let request = request.with_task_id(task_id);
        let this = Arc::clone(self);
        TaskHandle {
            task_id,
            join: tokio::spawn(async move { this.run(request).await }),
        }
    }

    /// Cancel a task
    ///
    /// Stops further stages, aborts the in-flight executor and records a
    /// `Cancellation` entry. Returns the task's final state; cancelling a
    /// finished task changes nothing.
    ///
    /// # Errors
    /// `PipelineError::UnknownTask`
    pub fn cancel(&self, task_id: TaskId) -> Result<PipelineState, PipelineError> {
        // recorded under the task lock, so it precedes the run's closing entry
        let (after, recorded) =
            self.services
                .registry()
                .terminate_with(task_id, "cancelled", |before| {
                    tracing::info!(%task_id, stage = %before, "task cancelled");
                    self.services.record(
                        AuditEvent::new(task_id, ActionType::Cancellation)
                            .resource(before.as_str())
                            .denied()
                            .detail("cancelled by caller"),
                    )
                })?;
        if let Some(Err(e)) = recorded {
            tracing::error!(%task_id, error = %e, "cancellation could not be audited");
            self.services.raise(task_id, None, &e);
        }
        Ok(after)
    }

    async fn drive(
        &self,
        entry: &TaskEntry,
        request: &TaskRequest,
        state: &mut RunState,
    ) -> Result<(), Halt> {
        for role in Role::ALL {
            self.run_stage(entry, request, role, state).await?;
        }

        let task_id = state.bundle.task_id;
        let finished = AuditEvent::new(task_id, ActionType::TaskFinished)
            .resource(TaskStatus::Completed.as_str())
            .detail(format!("tokens={}", state.bundle.token_stats.total()));
        if let Err(e) = self.services.record(finished) {
            return self.escalate(task_id, None, &e);
        }
        self.services
            .registry()
            .transition(task_id, PipelineState::Completed)
            .map_err(|_| Halt)?;
        tracing::info!(%task_id, "task completed");
        Ok(())
    }

    async fn run_stage(
        &self,
        entry: &TaskEntry,
        request: &TaskRequest,
        role: Role,
        state: &mut RunState,
    ) -> Result<(), Halt> {
        let task_id = state.bundle.task_id;
        let mut mode = initial_mode(self.services.matrix().grant(role).external_policy);

        loop {
            let pre = PreStageContext {
                services: &self.services,
                entry,
                task_id,
                role,
                mode,
            };
            match self.middleware.before(&pre) {
                Ok(()) => {}
                Err(PreStageError::Cancelled | PreStageError::Finished(_)) => return Err(Halt),
                Err(PreStageError::Governance(e)) => {
                    self.escalate(task_id, Some(role), &e)?;
                    return Err(Halt);
                }
                Err(e @ PreStageError::OutOfOrder { .. }) => {
                    let finding = GovernanceError::ValidationFailure(e.to_string());
                    self.escalate(task_id, Some(role), &finding)?;
                    return Err(Halt);
                }
            }

            self.audit_stage(task_id, role, ActionType::StageStart, true, mode.to_string())?;
            tracing::info!(%task_id, %role, %mode, "stage started");

            let result = self.invoke(entry, request, role, mode, state).await;
            if entry.state().is_terminal() {
                return Err(Halt);
            }

            let failure = match result {
                Ok(Ok(output)) => return self.accept(task_id, role, mode, output, state),
                Ok(Err(failure)) => failure,
                Err(PoolError::Cancelled) => return Err(Halt),
                Err(other) => other.into(),
            };
            self.audit_stage(task_id, role, ActionType::StageEnd, false, failure.to_string())?;

            if self.try_fallback(task_id, role, mode, &failure, state)? {
                mode = ExecutionMode::External;
                continue;
            }
            self.escalate(task_id, Some(role), &GovernanceError::ExternalCallFailure(failure))?;
            return Err(Halt);
        }
    }

    async fn invoke(
        &self,
        entry: &TaskEntry,
        request: &TaskRequest,
        role: Role,
        mode: ExecutionMode,
        state: &RunState,
    ) -> Result<Result<StageOutput, ExternalCallFailure>, PoolError> {
        let task_id = state.bundle.task_id;
        let Some(executor) = self.executors.get(&(role, mode)).map(Arc::clone) else {
            return Ok(Err(ExternalCallFailure::Unavailable(format!(
                "no {mode} executor for {role}"
            ))));
        };
        let input = StageInput {
            task_id,
            role,
            mode,
            header: &GOVERNANCE_HEADER,
            user_prompt: request.user_prompt.clone(),
            classification: request.classification.clone(),
            previous_output: state.previous_output.clone(),
            bundle: state.bundle.clone(),
            critic_flags: state.critic_flags.clone(),
        };
        let ctx = StageContext::new(Arc::clone(&self.services), task_id, role);
        let deadline = self.services.config().pipeline.stage_timeout();

        self.pool
            .submit(
                async move { executor.execute(input, ctx).await },
                deadline,
                entry.cancel_token(),
            )
            .await
    }

    fn accept(
        &self,
        task_id: TaskId,
        role: Role,
        mode: ExecutionMode,
        output: StageOutput,
        state: &mut RunState,
    ) -> Result<(), Halt> {
        for warning in &output.warnings {
            self.escalate(
                task_id,
                Some(role),
                &GovernanceError::InputValidation(warning.clone()),
            )?;
        }

        let checked = self.middleware.after(&PostStageContext {
            task_id,
            role,
            output: &output,
            bundle: &state.bundle,
            critic_flags: &state.critic_flags,
        });
        if let Err(finding) = checked {
            self.audit_stage(task_id, role, ActionType::StageEnd, false, finding.to_string())?;
            self.escalate(task_id, Some(role), &finding)?;
            return Err(Halt);
        }

        for flag in &output.critical_flags {
            if !state.critic_flags.contains(flag) {
                state.critic_flags.push(flag.clone());
            }
        }
        // a rejected output never reaches the bundle
        if output.critical_failure {
            let finding = GovernanceError::CriticalContentFailure {
                flags: output.critical_flags,
            };
            self.audit_stage(task_id, role, ActionType::StageEnd, false, finding.to_string())?;
            self.escalate(task_id, Some(role), &finding)?;
            return Err(Halt);
        }

        state.bundle.merge(role, &output);
        state.previous_output = output.content;

        self.audit_stage(
            task_id,
            role,
            ActionType::StageEnd,
            true,
            format!("mode={mode} tokens={}", output.token_stats.total()),
        )?;
        tracing::info!(%task_id, %role, %mode, "stage completed");

        if role != Role::Summarizer {
            self.services
                .registry()
                .transition(task_id, PipelineState::after(role))
                .map_err(|_| Halt)?;
        }
        Ok(())
    }

    /// Switch a terminal stage from its deterministic service to the external
    /// one, at most `fallback_transitions` times per task
    fn try_fallback(
        &self,
        task_id: TaskId,
        role: Role,
        mode: ExecutionMode,
        failure: &ExternalCallFailure,
        state: &mut RunState,
    ) -> Result<bool, Halt> {
        if !role.is_terminal_stage()
            || mode != ExecutionMode::Fallback
            || state.fallbacks_left == 0
            || !self.executors.contains_key(&(role, ExecutionMode::External))
        {
            return Ok(false);
        }

        let quota = self.services.quota();
        quota.signal_primary_failure(task_id);
        if quota.effective_max(task_id, role) <= quota.usage(task_id, role) {
            tracing::warn!(%task_id, %role, "no external allowance for fallback");
            return Ok(false);
        }

        state.fallbacks_left -= 1;
        let event = AuditEvent::new(task_id, ActionType::FallbackTransition)
            .role(role)
            .resource("reasoning-service")
            .detail(format!("fallback -> external after: {failure}"));
        if let Err(e) = self.services.record(event) {
            self.escalate(task_id, Some(role), &e)?;
        }
        tracing::warn!(%task_id, %role, %failure, "switching to external execution");
        Ok(true)
    }

    fn audit_stage(
        &self,
        task_id: TaskId,
        role: Role,
        action: ActionType,
        allowed: bool,
        detail: String,
    ) -> Result<(), Halt> {
        let event = AuditEvent::new(task_id, action)
            .role(role)
            .resource(role.as_str())
            .decision(Decision::from_allowed(allowed))
            .detail(detail);
        match self.services.record(event) {
            Ok(()) => Ok(()),
            Err(e) => self.escalate(task_id, Some(role), &e),
        }
    }

    /// Hand a finding to the violation handler; halts once the task has
    /// reached a terminal state
    fn escalate(
        &self,
        task_id: TaskId,
        role: Option<Role>,
        finding: &GovernanceError,
    ) -> Result<(), Halt> {
        self.services.raise(task_id, role, finding);
        match self.services.registry().state(task_id) {
            Some(s) if !s.is_terminal() => Ok(()),
            _ => Err(Halt),
        }
    }

    fn finish(&self, entry: &TaskEntry, state: RunState) -> PipelineOutcome {
        let task_id = state.bundle.task_id;
        let final_state = entry.state();
        let status = final_state.status();

        if status != TaskStatus::Completed {
            let event = AuditEvent::new(task_id, ActionType::TaskFinished)
                .resource(status.as_str())
                .denied()
                .detail(entry.reason().unwrap_or_default());
            if let Err(e) = self.services.record(event) {
                tracing::error!(%task_id, error = %e, "task end could not be audited");
            }
            tracing::warn!(%task_id, %status, reason = ?entry.reason(), "task did not complete");
        }

        let violations = self.services.violations().violations(task_id);
        let warnings = violations
            .iter()
            .filter(|v| v.severity == Severity::Medium)
            .map(|v| v.context.clone())
            .collect();
        let bundle = match status {
            TaskStatus::Terminated => None,
            _ => Some(state.bundle),
        };

        PipelineOutcome {
            task_id,
            status,
            final_state,
            reason: entry.reason(),
            bundle,
            violations,
            warnings,
            usage: self.services.quota().release_task(task_id),
        }
    }
}

fn initial_mode(policy: ExternalServicePolicy) -> ExecutionMode {
    match policy {
        ExternalServicePolicy::Primary => ExecutionMode::External,
        ExternalServicePolicy::FallbackOnly | ExternalServicePolicy::None => {
            ExecutionMode::Fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StageExecutor for Echo {
        async fn execute(
            &self,
            input: StageInput,
            _ctx: StageContext,
        ) -> Result<StageOutput, ExternalCallFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(StageOutput::new(format!("{}: {}", input.role, input.user_prompt))
                .with_attribution(input.bundle.attribution.clone()))
        }
    }

    fn orchestrator(echo: &Arc<Echo>) -> PipelineOrchestrator {
        let mut builder = PipelineOrchestrator::builder();
        for role in [Role::Ideator, Role::Drafter, Role::Critic] {
            builder = builder.executor(role, ExecutionMode::External, Arc::clone(echo) as _);
        }
        for role in [Role::Revisor, Role::Summarizer] {
            builder = builder.executor(role, ExecutionMode::Fallback, Arc::clone(echo) as _);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn clean_run_completes() {
        let echo = Arc::new(Echo::default());
        let orch = orchestrator(&echo);
        let outcome = orch.run(TaskRequest::new("a post about rust")).await.unwrap();

        assert!(outcome.is_completed());
        assert_eq!(outcome.final_output(), Some("summarizer: a post about rust"));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 5);
        assert_eq!(outcome.usage.total_calls(), 3);
        assert!(outcome.violations.is_empty());
        orch.services()
            .audit()
            .verify_integrity(outcome.task_id)
            .unwrap();
    }

    #[tokio::test]
    async fn empty_prompt_refused() {
        let orch = orchestrator(&Arc::new(Echo::default()));
        assert!(matches!(
            orch.run(TaskRequest::new("  ")).await,
            Err(PipelineError::InvalidTask(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_task_refused() {
        let orch = orchestrator(&Arc::new(Echo::default()));
        let id = TaskId::new();
        orch.run(TaskRequest::new("one").with_task_id(id))
            .await
            .unwrap();
        assert!(matches!(
            orch.run(TaskRequest::new("two").with_task_id(id)).await,
            Err(PipelineError::DuplicateTask(_))
        ));
    }

    #[test]
    fn missing_executor_refused() {
        let err = PipelineOrchestrator::builder()
            .executor(
                Role::Ideator,
                ExecutionMode::External,
                Arc::new(Echo::default()),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingExecutor { role: Role::Drafter }));
    }

    #[test]
    fn initial_modes_follow_policy() {
        assert_eq!(
            initial_mode(ExternalServicePolicy::Primary),
            ExecutionMode::External
        );
        assert_eq!(
            initial_mode(ExternalServicePolicy::FallbackOnly),
            ExecutionMode::Fallback
        );
    }
}
