//! Pipeline types
//!
//! Task lifecycle, pipeline states and submission requests.

use pgov_policy::{Role, TaskId};
use serde::{Deserialize, Serialize};

/// Externally visible task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Stages still executing
    Running,
    /// Summarizer finished and the final bundle was produced
    Completed,
    /// A stage output was rejected
    Rejected,
    /// Stopped by containment or cancellation
    Terminated,
}

impl TaskStatus {
    /// Whether the task will not change any more
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Running)
    }

    /// Stable name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    /// Idea collection
    Ideator,
    /// Drafting
    Drafter,
    /// Fact-checking
    Critic,
    /// Revision
    Revisor,
    /// Compression
    Summarizer,
    /// Finished successfully
    Completed,
    /// Stage output rejected
    Rejected,
    /// Contained or cancelled
    Terminated,
}

impl PipelineState {
    /// All states
    pub const ALL: [PipelineState; 8] = [
        PipelineState::Ideator,
        PipelineState::Drafter,
        PipelineState::Critic,
        PipelineState::Revisor,
        PipelineState::Summarizer,
        PipelineState::Completed,
        PipelineState::Rejected,
        PipelineState::Terminated,
    ];

    /// Stage state of a role
    #[must_use]
    pub fn from_role(role: Role) -> Self {
        match role {
            Role::Ideator => PipelineState::Ideator,
            Role::Drafter => PipelineState::Drafter,
            Role::Critic => PipelineState::Critic,
            Role::Revisor => PipelineState::Revisor,
            Role::Summarizer => PipelineState::Summarizer,
        }
    }

    /// Role executing in this state, if it is a stage
    #[must_use]
    pub fn role(self) -> Option<Role> {
        match self {
            PipelineState::Ideator => Some(Role::Ideator),
            PipelineState::Drafter => Some(Role::Drafter),
            PipelineState::Critic => Some(Role::Critic),
            PipelineState::Revisor => Some(Role::Revisor),
            PipelineState::Summarizer => Some(Role::Summarizer),
            PipelineState::Completed | PipelineState::Rejected | PipelineState::Terminated => {
                None
            }
        }
    }

    /// State following a successful stage
    #[must_use]
    pub fn after(role: Role) -> Self {
        role.next().map_or(PipelineState::Completed, Self::from_role)
    }

    /// Task status in this state
    #[must_use]
    pub fn status(self) -> TaskStatus {
        match self {
            PipelineState::Completed => TaskStatus::Completed,
            PipelineState::Rejected => TaskStatus::Rejected,
            PipelineState::Terminated => TaskStatus::Terminated,
            _ => TaskStatus::Running,
        }
    }

    /// Whether no transition leaves this state
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.status().is_terminal()
    }

    /// Stable name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Ideator => "ideator",
            PipelineState::Drafter => "drafter",
            PipelineState::Critic => "critic",
            PipelineState::Revisor => "revisor",
            PipelineState::Summarizer => "summarizer",
            PipelineState::Completed => "completed",
            PipelineState::Rejected => "rejected",
            PipelineState::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a stage reaches its executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// External reasoning service, one reserved call per invocation
    External,
    /// Deterministic local service, no quota
    Fallback,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::External => f.write_str("external"),
            ExecutionMode::Fallback => f.write_str("fallback"),
        }
    }
}

/// A pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub task_id: TaskId,
    /// Prompt the pipeline works on
    pub user_prompt: String,
    /// Caller-supplied content classification
    pub classification: String,
    /// Current state
    pub current_stage: PipelineState,
    /// Status derived from the state
    pub status: TaskStatus,
}

impl Task {
    /// New task at the first stage
    #[must_use]
    pub fn new(task_id: TaskId, user_prompt: String, classification: String) -> Self {
        Self {
            task_id,
            user_prompt,
            classification,
            current_stage: PipelineState::Ideator,
            status: TaskStatus::Running,
        }
    }
}

/// Submission request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    /// Fixed id, generated when absent
    pub task_id: Option<TaskId>,
    /// Prompt text
    pub user_prompt: String,
    /// Content classification
    pub classification: String,
    /// Governance override unlocking override calls
    pub governance_override: bool,
}

impl TaskRequest {
    /// Request with a generated id and the default classification
    #[must_use]
    pub fn new(user_prompt: impl Into<String>) -> Self {
        Self {
            task_id: None,
            user_prompt: user_prompt.into(),
            classification: "general".to_string(),
            governance_override: false,
        }
    }

    /// Use a fixed task id
    #[inline]
    #[must_use]
    pub fn with_task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Set classification
    #[inline]
    #[must_use]
    pub fn with_classification(mut self, classification: impl Into<String>) -> Self {
        self.classification = classification.into();
        self
    }

    /// Attach a governance override
    #[inline]
    #[must_use]
    pub fn with_override(mut self) -> Self {
        self.governance_override = true;
        self
    }
}
