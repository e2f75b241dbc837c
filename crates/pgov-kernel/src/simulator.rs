//! Seeded pipeline simulator
//!
//! Drives a batch of tasks through a fully governed orchestrator backed by
//! in-process demo executors and connectors. Every task is assigned a
//! [`Scenario`] up front; the demo stages read the plan and misbehave on cue.
//! The report compares the status each scenario must end in with the status
//! the pipeline actually produced, and re-verifies every task's audit chain.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use pgov_audit::AuditLog;
use pgov_core::prelude::*;
use pgov_core::{
    ChangeLogEntry, ConnectorError, DataSourceConnector, GatewayError, RagConnector, RagResult,
    Snippet, TokenStats,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Notify;

/// Behaviour injected into one simulated task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// Every stage behaves
    Clean,
    /// The Critic reports a critical content failure
    CriticReject,
    /// The Drafter reads personal notes
    Trespass,
    /// The Critic reserves a second external call
    QuotaOverrun,
    /// The Revisor's deterministic service is down
    Fallback,
    /// The caller cancels while the Drafter is running
    Cancel,
}

impl Scenario {
    /// All scenarios, in mixing order
    pub const ALL: [Scenario; 6] = [
        Scenario::Clean,
        Scenario::CriticReject,
        Scenario::Trespass,
        Scenario::QuotaOverrun,
        Scenario::Fallback,
        Scenario::Cancel,
    ];

    /// Status a governed pipeline must end the task in
    #[must_use]
    pub fn expected_status(self) -> TaskStatus {
        match self {
            Scenario::Clean | Scenario::Fallback => TaskStatus::Completed,
            Scenario::CriticReject | Scenario::QuotaOverrun => TaskStatus::Rejected,
            Scenario::Trespass | Scenario::Cancel => TaskStatus::Terminated,
        }
    }

    /// Stable name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Scenario::Clean => "clean",
            Scenario::CriticReject => "critic-reject",
            Scenario::Trespass => "trespass",
            Scenario::QuotaOverrun => "quota-overrun",
            Scenario::Fallback => "fallback",
            Scenario::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scenario::ALL
            .into_iter()
            .find(|scenario| scenario.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<_> = Scenario::ALL.iter().map(|s| s.as_str()).collect();
                format!("unknown scenario '{s}' (expected one of: {})", known.join(", "))
            })
    }
}

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Tasks to submit
    pub tasks: usize,
    /// Run every task with this scenario instead of a seeded mix
    pub scenario: Option<Scenario>,
    /// Governance settings for the orchestrator
    pub governance: GovernanceConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            tasks: 100,
            scenario: None,
            governance: GovernanceConfig::default(),
        }
    }
}

impl SimulatorConfig {
    /// Scenario of every task, in submission order
    #[must_use]
    pub fn plan(&self) -> Vec<Scenario> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        (0..self.tasks)
            .map(|_| {
                self.scenario
                    .unwrap_or_else(|| Scenario::ALL[rng.gen_range(0..Scenario::ALL.len())])
            })
            .collect()
    }
}

/// Outcome of one simulated task
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    /// Task identifier
    pub task_id: TaskId,
    /// Injected behaviour
    pub scenario: Scenario,
    /// Status the scenario must end in
    pub expected: TaskStatus,
    /// Status the pipeline produced
    pub actual: TaskStatus,
    /// Violations raised for the task
    pub violations: usize,
    /// Audit entries recorded for the task
    pub audit_entries: usize,
    /// Whether the task's hash chain verified
    pub chain_intact: bool,
}

impl TaskRecord {
    /// Whether the task ended as governed
    #[must_use]
    pub fn is_anomaly(&self) -> bool {
        self.expected != self.actual || !self.chain_intact
    }
}

/// Aggregate counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulatorStats {
    pub completed: u64,
    pub rejected: u64,
    pub terminated: u64,
    pub violations: u64,
    pub audit_entries: u64,
}

/// Final report from the simulator
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorReport {
    pub seed: u64,
    pub stats: SimulatorStats,
    pub tasks: Vec<TaskRecord>,
}

impl SimulatorReport {
    /// Tasks that did not end as their scenario requires
    pub fn anomalies(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.iter().filter(|t| t.is_anomaly())
    }

    /// Check if every task ended as governed
    #[must_use]
    pub fn passed(&self) -> bool {
        self.anomalies().next().is_none()
    }

    /// Human-readable report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::new();
        let _ = writeln!(report, "=== Pipeline Governance Simulator Report ===\n");
        let _ = writeln!(report, "Seed: {}", self.seed);
        let _ = writeln!(report, "Tasks: {}", self.tasks.len());
        let _ = writeln!(report, "Completed: {}", self.stats.completed);
        let _ = writeln!(report, "Rejected: {}", self.stats.rejected);
        let _ = writeln!(report, "Terminated: {}", self.stats.terminated);
        let _ = writeln!(report, "Violations: {}", self.stats.violations);
        let _ = writeln!(report, "Audit entries: {}", self.stats.audit_entries);

        let mut by_scenario: BTreeMap<Scenario, usize> = BTreeMap::new();
        for task in &self.tasks {
            *by_scenario.entry(task.scenario).or_default() += 1;
        }
        let _ = writeln!(report, "\nScenarios:");
        for (scenario, count) in by_scenario {
            let _ = writeln!(
                report,
                "  {scenario:<14} {count:>5}  -> {}",
                scenario.expected_status()
            );
        }

        let anomalies: Vec<_> = self.anomalies().collect();
        if anomalies.is_empty() {
            let _ = writeln!(report, "\nResult: PASS");
        } else {
            let _ = writeln!(report, "\nAnomalies ({}):", anomalies.len());
            for task in anomalies {
                let _ = writeln!(
                    report,
                    "  {} {}: expected {}, got {}{}",
                    task.task_id,
                    task.scenario,
                    task.expected,
                    task.actual,
                    if task.chain_intact { "" } else { " (audit chain broken)" }
                );
            }
            let _ = writeln!(report, "\nResult: FAIL");
        }
        report
    }
}

/// Scenario plan shared by the demo stages
#[derive(Debug, Default)]
struct ScenarioBook {
    scenarios: DashMap<TaskId, Scenario>,
    started: DashMap<TaskId, Arc<Notify>>,
}

impl ScenarioBook {
    fn assign(&self, task_id: TaskId, scenario: Scenario) {
        self.scenarios.insert(task_id, scenario);
        self.started.insert(task_id, Arc::new(Notify::new()));
    }

    fn scenario(&self, task_id: TaskId) -> Scenario {
        self.scenarios
            .get(&task_id)
            .map_or(Scenario::Clean, |s| *s)
    }

    fn started(&self, task_id: TaskId) -> Option<Arc<Notify>> {
        self.started.get(&task_id).map(|n| Arc::clone(&n))
    }
}

/// Stage executor standing in for every reasoning and deterministic service
#[derive(Debug)]
struct DemoStage {
    book: Arc<ScenarioBook>,
}

impl DemoStage {
    fn carry(input: &StageInput, content: String) -> StageOutput {
        let input_tokens = approx_tokens(&input.previous_output) + approx_tokens(&input.user_prompt);
        let mut out = StageOutput::new(content).with_attribution(input.bundle.attribution.clone());
        out.token_stats = TokenStats {
            input_tokens,
            output_tokens: approx_tokens(&out.content),
        };
        out
    }

    async fn gather(
        input: &StageInput,
        ctx: &StageContext,
        source: DataSource,
        limit: u32,
        content: String,
    ) -> Result<StageOutput, ExternalCallFailure> {
        let mut out = Self::carry(input, content);
        match ctx.query_source(source, &input.user_prompt, limit, true).await {
            Ok(snippets) => {
                out.input_sources.push(source.as_str().to_string());
                out.attribution.extend(snippets.into_iter().map(|s| Attribution {
                    source_id: s.source_id,
                    origin: source.as_str().to_string(),
                    excerpt: s.snippet,
                    retrieved_at: s.timestamp,
                }));
                Ok(out)
            }
            Err(err) if err.is_recoverable() => Ok(out.with_warning(err.to_string())),
            Err(err) => Err(refused(&err)),
        }
    }

    async fn critique(input: &StageInput, ctx: &StageContext) -> Result<StageOutput, ExternalCallFailure> {
        let mut out = Self::carry(input, format!("Reviewed: {}", input.previous_output));
        let query = format!("fact check: {}", input.user_prompt);
        match ctx.retrieval_query(&query, &[]).await {
            Ok(results) => {
                let found: Vec<_> = results
                    .into_iter()
                    .filter_map(|r| {
                        Some(Attribution {
                            source_id: r.source?,
                            origin: "retrieval".to_string(),
                            excerpt: r.result,
                            retrieved_at: r.timestamp?,
                        })
                    })
                    .collect();
                out.claims = found
                    .iter()
                    .map(|a| Claim::sourced(a.excerpt.clone(), a.source_id.clone()))
                    .collect();
                out.attribution.extend(found);
                Ok(out)
            }
            Err(err) if err.is_recoverable() => Ok(out.with_warning(err.to_string())),
            Err(err) => Err(refused(&err)),
        }
    }
}

#[async_trait]
impl StageExecutor for DemoStage {
    async fn execute(
        &self,
        input: StageInput,
        ctx: StageContext,
    ) -> Result<StageOutput, ExternalCallFailure> {
        let scenario = self.book.scenario(input.task_id);
        let prompt = input.user_prompt.clone();
        let previous = input.previous_output.clone();

        match (input.role, scenario) {
            (Role::Ideator, _) => {
                Self::gather(&input, &ctx, DataSource::PersonalNotes, 3, format!("Ideas: {prompt}"))
                    .await
            }
            (Role::Drafter, Scenario::Trespass) => {
                Self::gather(&input, &ctx, DataSource::PersonalNotes, 1, format!("Draft: {previous}"))
                    .await
            }
            (Role::Drafter, Scenario::Cancel) => {
                if let Some(started) = self.book.started(input.task_id) {
                    started.notify_one();
                }
                std::future::pending().await
            }
            (Role::Drafter, _) => {
                Self::gather(
                    &input,
                    &ctx,
                    DataSource::PublishedArticles,
                    2,
                    format!("Draft: {previous}"),
                )
                .await
            }
            (Role::Critic, Scenario::CriticReject) => Ok(Self::carry(
                &input,
                format!("Reviewed: {previous}"),
            )
            .with_critical_flag("unsupported medical claim")
            .critical_failure()),
            (Role::Critic, Scenario::QuotaOverrun) => {
                ctx.reserve_external_call().map_err(|e| refused(&e))?;
                Ok(Self::carry(&input, format!("Reviewed twice: {previous}")))
            }
            (Role::Critic, _) => Self::critique(&input, &ctx).await,
            (Role::Revisor, Scenario::Fallback) if input.mode == ExecutionMode::Fallback => Err(
                ExternalCallFailure::Unavailable("style service offline".to_string()),
            ),
            (Role::Revisor, _) => {
                let revised = previous.replace("Reviewed: ", "");
                let mut out = Self::carry(&input, format!("Revised: {revised}"));
                out.tone_flags.voice_match_score = Some(0.9);
                out.change_log.push(ChangeLogEntry {
                    change_id: format!("{}-tone", input.task_id),
                    original_text: previous,
                    revised_text: revised,
                    reason: "match author voice".to_string(),
                    applied_by: Role::Revisor,
                });
                Ok(out)
            }
            (Role::Summarizer, _) => {
                let summary: String = previous.chars().take(80).collect();
                let mut out = Self::carry(&input, format!("Summary: {summary}"));
                if previous.chars().count() > 80 {
                    out.trimmed_sections.push("tail".to_string());
                }
                out.long_tail_keywords.push(prompt.to_lowercase());
                Ok(out)
            }
        }
    }
}

fn refused(err: &GatewayError) -> ExternalCallFailure {
    ExternalCallFailure::Failed(err.to_string())
}

fn approx_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// In-process stand-in for the author's notes, posts and articles
#[derive(Debug, Default)]
pub struct DemoLibrary;

#[async_trait]
impl DataSourceConnector for DemoLibrary {
    async fn query(
        &self,
        source: DataSource,
        text: &str,
        limit: u32,
    ) -> Result<Vec<Snippet>, ConnectorError> {
        let now = Utc::now();
        Ok((0..limit)
            .map(|i| Snippet {
                snippet: format!("{source} record {i} on {text}"),
                source_id: format!("{source}-{i}"),
                timestamp: now,
                engagement: Some(BTreeMap::from([
                    ("likes".to_string(), u64::from(i) * 7),
                    ("shares".to_string(), u64::from(i)),
                ])),
            })
            .collect())
    }
}

/// In-process stand-in for retrieval search
#[derive(Debug, Default)]
pub struct DemoSearch;

#[async_trait]
impl RagConnector for DemoSearch {
    async fn query(&self, text: &str) -> Result<Vec<RagResult>, ConnectorError> {
        let now = Utc::now();
        Ok(vec![
            RagResult {
                result: format!("encyclopedia entry for {text}"),
                source: Some("https://en.wikipedia.org/wiki/Ownership".to_string()),
                timestamp: Some(now),
            },
            RagResult {
                result: format!("wire report on {text}"),
                source: Some("https://www.reuters.com/technology".to_string()),
                timestamp: Some(now),
            },
        ])
    }
}

/// Build an orchestrator wired with the demo stages and connectors
///
/// # Errors
/// `PipelineError::Config` if the governance settings are invalid.
fn demo_orchestrator(
    config: GovernanceConfig,
    audit: AuditLog,
    book: &Arc<ScenarioBook>,
) -> Result<PipelineOrchestrator, PipelineError> {
    let stage: Arc<dyn StageExecutor> = Arc::new(DemoStage {
        book: Arc::clone(book),
    });
    let mut builder = PipelineOrchestrator::builder().config(config).audit(audit);
    for role in Role::ALL {
        builder = builder.executor(role, ExecutionMode::External, Arc::clone(&stage));
    }
    for role in [Role::Revisor, Role::Summarizer] {
        builder = builder.executor(role, ExecutionMode::Fallback, Arc::clone(&stage));
    }
    builder
        .data_sources(Arc::new(DemoLibrary))
        .retrieval(Arc::new(DemoSearch))
        .build()
}

/// Run a simulation against the given audit log
///
/// # Errors
/// `PipelineError` if the orchestrator cannot be built or a run aborts.
pub async fn run_simulator(
    config: SimulatorConfig,
    audit: AuditLog,
) -> Result<SimulatorReport, PipelineError> {
    let book = Arc::new(ScenarioBook::default());
    let orch = Arc::new(demo_orchestrator(
        config.governance.clone(),
        audit,
        &book,
    )?);

    let plan = config.plan();
    tracing::info!(seed = config.seed, tasks = plan.len(), "simulation started");

    let mut handles = Vec::with_capacity(plan.len());
    let mut cancellers = Vec::new();
    for (i, scenario) in plan.iter().copied().enumerate() {
        let task_id = TaskId::new();
        book.assign(task_id, scenario);
        if scenario == Scenario::Cancel {
            if let Some(started) = book.started(task_id) {
                let orch = Arc::clone(&orch);
                cancellers.push(tokio::spawn(async move {
                    started.notified().await;
                    if let Err(e) = orch.cancel(task_id) {
                        tracing::warn!(%task_id, error = %e, "cancel failed");
                    }
                }));
            }
        }
        let request = TaskRequest::new(format!("post {i} about rust ownership"))
            .with_task_id(task_id)
            .with_classification(scenario.as_str());
        handles.push((scenario, orch.spawn(request)));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for (scenario, handle) in handles {
        outcomes.push((scenario, handle.join().await?));
    }
    // cancellation entries land after the run observes the cancel
    for canceller in cancellers {
        canceller
            .await
            .map_err(|e| PipelineError::Join(e.to_string()))?;
    }

    let mut stats = SimulatorStats::default();
    let mut tasks = Vec::with_capacity(outcomes.len());
    for (scenario, outcome) in outcomes {
        let audit = orch.services().audit();
        let audit_entries = audit.query(outcome.task_id).map_or(0, |e| e.len());
        let chain_intact = audit.verify_integrity(outcome.task_id).is_ok();

        match outcome.status {
            TaskStatus::Completed => stats.completed += 1,
            TaskStatus::Rejected => stats.rejected += 1,
            TaskStatus::Terminated => stats.terminated += 1,
            TaskStatus::Running => {}
        }
        stats.violations += outcome.violations.len() as u64;
        stats.audit_entries += audit_entries as u64;

        let record = TaskRecord {
            task_id: outcome.task_id,
            scenario,
            expected: scenario.expected_status(),
            actual: outcome.status,
            violations: outcome.violations.len(),
            audit_entries,
            chain_intact,
        };
        if record.is_anomaly() {
            tracing::warn!(task_id = %record.task_id, %scenario, actual = %record.actual, "ungoverned outcome");
        }
        tasks.push(record);
    }

    tracing::info!(
        completed = stats.completed,
        rejected = stats.rejected,
        terminated = stats.terminated,
        "simulation finished"
    );
    Ok(SimulatorReport {
        seed: config.seed,
        stats,
        tasks,
    })
}
