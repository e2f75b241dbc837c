//! Error types for the governed pipeline
//!
//! - [`GovernanceError`]: everything a check can find wrong with a stage;
//!   each one becomes a classified violation
//! - [`ExternalCallFailure`]: executor or external service failure
//! - [`PipelineError`]: misuse of the orchestrator itself
//! - [`PoolError`]: worker pool outcomes other than a result

use crate::types::PipelineState;
use pgov_audit::AuditError;
use pgov_policy::{AccessDenial, ConfigError, QuotaExceeded, Role, TaskId};
use std::time::Duration;

/// Failure of an external invocation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExternalCallFailure {
    /// No answer within the time budget
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Service could not be reached
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Service answered with an error
    #[error("call failed: {0}")]
    Failed(String),
}

/// Governance findings, each mapped to a violation
#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    /// Access validator refused a request
    #[error(transparent)]
    UnauthorizedAccess(#[from] AccessDenial),

    /// Call or query quota exhausted
    #[error(transparent)]
    QuotaExceeded(#[from] QuotaExceeded),

    /// Stage executor or external service failed
    #[error("external call failure: {0}")]
    ExternalCallFailure(#[from] ExternalCallFailure),

    /// Critic reported content that must not be published
    #[error("critical content failure: {}", .flags.join("; "))]
    CriticalContentFailure { flags: Vec<String> },

    /// Stage output failed a post-stage check
    #[error("validation failure: {0}")]
    ValidationFailure(String),

    /// Stage output altered an attribution entry already in the bundle
    #[error("attribution entry '{source_id}' was altered")]
    ImmutableRecordMutation { source_id: String },

    /// A decision could not be recorded
    #[error("audit unavailable: {0}")]
    AuditUnavailable(#[from] AuditError),

    /// Connector throttled a request
    #[error("rate limited by {resource}")]
    RateLimited { resource: String },

    /// Input dropped before merging
    #[error("input rejected: {0}")]
    InputValidation(String),
}

impl GovernanceError {
    /// Fatal to the task, never retried
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnauthorizedAccess(_)
                | Self::QuotaExceeded(_)
                | Self::ImmutableRecordMutation { .. }
                | Self::AuditUnavailable(_)
        )
    }

    /// Eligible for the one-off fallback transition of terminal stages
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalCallFailure(_))
    }

    /// Surfaced as a warning beside normal output
    #[inline]
    #[must_use]
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::InputValidation(_))
    }
}

/// State machine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// Transition not in the allowed set
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: PipelineState,
        to: PipelineState,
    },
}

/// Orchestrator usage errors
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Request rejected before registration
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// Task id already known to the registry
    #[error("duplicate task: {0}")]
    DuplicateTask(TaskId),

    /// Task id not known to the registry
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    /// No executor registered for a stage
    #[error("no executor registered for {role}")]
    MissingExecutor { role: Role },

    /// Configuration rejected
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Illegal state transition
    #[error("state machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    /// Spawned run did not finish
    #[error("pipeline run aborted: {0}")]
    Join(String),
}

/// Worker pool errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// Cancel token fired before completion
    #[error("cancelled")]
    Cancelled,

    /// Deadline elapsed
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// Spawned job panicked
    #[error("job panicked: {0}")]
    Panicked(String),
}

impl From<PoolError> for ExternalCallFailure {
    fn from(value: PoolError) -> Self {
        match value {
            PoolError::TimedOut(d) => ExternalCallFailure::Timeout(d),
            PoolError::Cancelled => ExternalCallFailure::Failed("cancelled".to_string()),
            PoolError::Panicked(msg) => ExternalCallFailure::Failed(msg),
        }
    }
}
