//! Testing utilities for PGOV workspace
//!
//! Scripted stage executors, in-memory connectors and a failing audit store.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use pgov_audit::{ActionType, AuditEntry, AuditError, AuditEvent, AuditStore, MemoryAuditStore};
use pgov_core::{
    Attribution, ConnectorError, DataSourceConnector, ExecutionMode, ExternalCallFailure,
    GatewayError, OrchestratorBuilder, PipelineOrchestrator, RagConnector, RagResult, Snippet,
    StageContext, StageExecutor, StageInput, StageOutput,
};
use pgov_policy::{DataSource, Role, TaskId};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// One scripted executor behaviour
#[derive(Debug, Clone)]
pub enum Step {
    /// `"{role}: {previous output or prompt}"`, carrying bundle attribution
    Echo,
    /// Return this output verbatim
    Output(StageOutput),
    /// Return this output with the bundle's attribution prepended
    Carry(StageOutput),
    /// Fail the call
    Fail(ExternalCallFailure),
    /// Never finish
    Hang,
    /// Query a data source, then echo with the snippets attributed
    QuerySource {
        source: DataSource,
        limit: u32,
        engagement_fields: bool,
    },
    /// Run a retrieval query, then echo with the results attributed
    Retrieve { text: String },
    /// Reserve an extra external call, then echo
    ReserveCall,
}

/// Executor replaying a script, then echoing
#[derive(Debug)]
pub struct ScriptedExecutor {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    inputs: Mutex<Vec<StageInput>>,
    gateway_errors: Mutex<Vec<GatewayError>>,
    started: Notify,
}

impl ScriptedExecutor {
    pub fn echo() -> Arc<Self> {
        Self::with_steps(Vec::new())
    }

    pub fn with_steps(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
            gateway_errors: Mutex::new(Vec::new()),
            started: Notify::new(),
        })
    }

    pub fn once(step: Step) -> Arc<Self> {
        Self::with_steps(vec![step])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<StageInput> {
        self.inputs.lock().clone()
    }

    pub fn gateway_errors(&self) -> Vec<GatewayError> {
        self.gateway_errors.lock().clone()
    }

    /// Resolves once the executor has been invoked
    pub async fn started(&self) {
        if self.calls() > 0 {
            return;
        }
        self.started.notified().await;
    }

    fn echo_output(input: &StageInput) -> StageOutput {
        let from = if input.previous_output.is_empty() {
            &input.user_prompt
        } else {
            &input.previous_output
        };
        StageOutput::new(format!("{}: {from}", input.role))
            .with_attribution(input.bundle.attribution.clone())
    }

    fn gateway_failure(&self, err: GatewayError) -> Result<StageOutput, ExternalCallFailure> {
        self.gateway_errors.lock().push(err.clone());
        Err(ExternalCallFailure::Failed(err.to_string()))
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        input: StageInput,
        ctx: StageContext,
    ) -> Result<StageOutput, ExternalCallFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().push(input.clone());
        self.started.notify_one();

        let step = self.steps.lock().pop_front().unwrap_or(Step::Echo);
        match step {
            Step::Echo => Ok(Self::echo_output(&input)),
            Step::Output(output) => Ok(output),
            Step::Carry(mut output) => {
                let mut attribution = input.bundle.attribution.clone();
                attribution.append(&mut output.attribution);
                output.attribution = attribution;
                Ok(output)
            }
            Step::Fail(failure) => Err(failure),
            Step::Hang => std::future::pending().await,
            Step::QuerySource {
                source,
                limit,
                engagement_fields,
            } => match ctx
                .query_source(source, &input.user_prompt, limit, engagement_fields)
                .await
            {
                Ok(snippets) => {
                    let mut out = Self::echo_output(&input);
                    out.input_sources.push(source.as_str().to_string());
                    out.attribution.extend(snippets.into_iter().map(|s| Attribution {
                        source_id: s.source_id,
                        origin: source.as_str().to_string(),
                        excerpt: s.snippet,
                        retrieved_at: s.timestamp,
                    }));
                    Ok(out)
                }
                Err(err) if err.is_recoverable() => {
                    self.gateway_errors.lock().push(err);
                    Ok(Self::echo_output(&input))
                }
                Err(err) => self.gateway_failure(err),
            },
            Step::Retrieve { text } => match ctx.retrieval_query(&text, &[]).await {
                Ok(results) => {
                    let mut out = Self::echo_output(&input);
                    out.attribution.extend(results.into_iter().filter_map(|r| {
                        Some(Attribution {
                            source_id: r.source.clone()?,
                            origin: "retrieval".to_string(),
                            excerpt: r.result,
                            retrieved_at: r.timestamp?,
                        })
                    }));
                    Ok(out)
                }
                Err(err) if err.is_recoverable() => {
                    self.gateway_errors.lock().push(err);
                    Ok(Self::echo_output(&input))
                }
                Err(err) => self.gateway_failure(err),
            },
            Step::ReserveCall => match ctx.reserve_external_call() {
                Ok(_) => Ok(Self::echo_output(&input)),
                Err(err) => self.gateway_failure(err),
            },
        }
    }
}

/// One scripted executor per role plus external executors for the terminal
/// stages
#[derive(Debug)]
pub struct Stages {
    pub ideator: Arc<ScriptedExecutor>,
    pub drafter: Arc<ScriptedExecutor>,
    pub critic: Arc<ScriptedExecutor>,
    pub revisor: Arc<ScriptedExecutor>,
    pub summarizer: Arc<ScriptedExecutor>,
    pub revisor_external: Arc<ScriptedExecutor>,
    pub summarizer_external: Arc<ScriptedExecutor>,
}

impl Stages {
    pub fn echo() -> Self {
        Self {
            ideator: ScriptedExecutor::echo(),
            drafter: ScriptedExecutor::echo(),
            critic: ScriptedExecutor::echo(),
            revisor: ScriptedExecutor::echo(),
            summarizer: ScriptedExecutor::echo(),
            revisor_external: ScriptedExecutor::echo(),
            summarizer_external: ScriptedExecutor::echo(),
        }
    }

    pub fn get(&self, role: Role) -> &Arc<ScriptedExecutor> {
        match role {
            Role::Ideator => &self.ideator,
            Role::Drafter => &self.drafter,
            Role::Critic => &self.critic,
            Role::Revisor => &self.revisor,
            Role::Summarizer => &self.summarizer,
        }
    }

    /// Builder with every executor registered in its mode
    pub fn builder(&self) -> OrchestratorBuilder {
        let as_dyn = |e: &Arc<ScriptedExecutor>| -> Arc<dyn StageExecutor> { e.clone() };
        PipelineOrchestrator::builder()
            .executor(Role::Ideator, ExecutionMode::External, as_dyn(&self.ideator))
            .executor(Role::Drafter, ExecutionMode::External, as_dyn(&self.drafter))
            .executor(Role::Critic, ExecutionMode::External, as_dyn(&self.critic))
            .executor(Role::Revisor, ExecutionMode::Fallback, as_dyn(&self.revisor))
            .executor(
                Role::Summarizer,
                ExecutionMode::Fallback,
                as_dyn(&self.summarizer),
            )
            .executor(
                Role::Revisor,
                ExecutionMode::External,
                as_dyn(&self.revisor_external),
            )
            .executor(
                Role::Summarizer,
                ExecutionMode::External,
                as_dyn(&self.summarizer_external),
            )
    }

    /// Orchestrator with default config and in-memory connectors
    pub fn orchestrator(&self) -> PipelineOrchestrator {
        self.builder()
            .data_sources(StaticDataSource::new())
            .retrieval(StaticRag::attributed(2))
            .build()
            .unwrap()
    }
}

/// Fixed timestamp so generated records are stable across calls
pub fn fixed_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// Data-source connector serving generated snippets
#[derive(Debug)]
pub struct StaticDataSource {
    per_source: u32,
    failure: Option<ConnectorError>,
    queries: AtomicUsize,
}

impl StaticDataSource {
    pub fn new() -> Arc<Self> {
        Self::with_size(10)
    }

    pub fn with_size(per_source: u32) -> Arc<Self> {
        Arc::new(Self {
            per_source,
            failure: None,
            queries: AtomicUsize::new(0),
        })
    }

    pub fn failing(failure: ConnectorError) -> Arc<Self> {
        Arc::new(Self {
            per_source: 0,
            failure: Some(failure),
            queries: AtomicUsize::new(0),
        })
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSourceConnector for StaticDataSource {
    async fn query(
        &self,
        source: DataSource,
        text: &str,
        limit: u32,
    ) -> Result<Vec<Snippet>, ConnectorError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        Ok((0..self.per_source.min(limit))
            .map(|i| Snippet {
                snippet: format!("{source} snippet {i} about {text}"),
                source_id: format!("{source}-{i}"),
                timestamp: fixed_time(),
                engagement: Some(BTreeMap::from([
                    ("likes".to_string(), u64::from(i) * 3),
                    ("shares".to_string(), u64::from(i)),
                ])),
            })
            .collect())
    }
}

/// Retrieval connector serving fixed results
#[derive(Debug)]
pub struct StaticRag {
    results: Vec<RagResult>,
    queries: AtomicUsize,
}

impl StaticRag {
    pub fn attributed(n: usize) -> Arc<Self> {
        Self::with_results(
            (0..n)
                .map(|i| RagResult {
                    result: format!("fact {i}"),
                    source: Some(format!("https://en.wikipedia.org/wiki/Fact_{i}")),
                    timestamp: Some(fixed_time()),
                })
                .collect(),
        )
    }

    pub fn with_results(results: Vec<RagResult>) -> Arc<Self> {
        Arc::new(Self {
            results,
            queries: AtomicUsize::new(0),
        })
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RagConnector for StaticRag {
    async fn query(&self, _text: &str) -> Result<Vec<RagResult>, ConnectorError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.results.clone())
    }
}

/// Audit store that starts refusing appends on a trigger
#[derive(Debug, Default)]
pub struct FailingAuditStore {
    inner: MemoryAuditStore,
    fail_on: Option<ActionType>,
    fail_after: Option<usize>,
    appended: AtomicUsize,
    tripped: AtomicBool,
}

impl FailingAuditStore {
    /// Refuse every append from the first `action` on
    pub fn on(action: ActionType) -> Arc<Self> {
        Arc::new(Self {
            fail_on: Some(action),
            ..Self::default()
        })
    }

    /// Refuse every append after `n` successful ones
    pub fn after(n: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_after: Some(n),
            ..Self::default()
        })
    }

    /// Refuse everything
    pub fn down() -> Arc<Self> {
        Self::after(0)
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}

impl AuditStore for FailingAuditStore {
    fn append(&self, event: AuditEvent) -> Result<AuditEntry, AuditError> {
        let trip = self.fail_on == Some(event.action_type)
            || self
                .fail_after
                .is_some_and(|n| self.appended.load(Ordering::SeqCst) >= n);
        if trip {
            self.tripped.store(true, Ordering::SeqCst);
        }
        if self.is_tripped() {
            return Err(AuditError::unavailable("store offline"));
        }
        self.appended.fetch_add(1, Ordering::SeqCst);
        self.inner.append(event)
    }

    fn query(&self, task_id: TaskId) -> Result<Vec<AuditEntry>, AuditError> {
        self.inner.query(task_id)
    }

    fn task_ids(&self) -> Vec<TaskId> {
        self.inner.task_ids()
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}
