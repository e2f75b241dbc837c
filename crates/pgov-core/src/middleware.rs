//! Pre- and post-stage checks
//!
//! Every stage runs inside the same chain:
//!
//! ```text
//! StageOrderCheck -> CancellationCheck -> ExternalQuotaCheck
//!     -> executor
//! WellFormedOutput -> AttributionPreserved -> ClaimsValidated
//! ```
//!
//! Checks run in order and the first failure stops the chain.

use crate::bundle::MetadataBundle;
use crate::error::GovernanceError;
use crate::executor::{Claim, StageOutput};
use crate::registry::TaskEntry;
use crate::services::GovernanceServices;
use crate::types::{ExecutionMode, PipelineState};
use pgov_policy::{ResourceRequest, Role, TaskId};
use std::sync::Arc;

/// Why a stage may not start
#[derive(Debug, thiserror::Error)]
pub enum PreStageError {
    /// Task was cancelled
    #[error("task cancelled")]
    Cancelled,

    /// Task already ended
    #[error("task already {0}")]
    Finished(PipelineState),

    /// Stage requested out of order
    #[error("stage {role} requested while task is at {current}")]
    OutOfOrder {
        /// Requested stage
        role: Role,
        /// Current task state
        current: PipelineState,
    },

    /// A governance check failed
    #[error(transparent)]
    Governance(#[from] GovernanceError),
}

/// What a pre-stage check sees
#[derive(Debug)]
pub struct PreStageContext<'a> {
    /// Shared services
    pub services: &'a GovernanceServices,
    /// Registry record of the task
    pub entry: &'a TaskEntry,
    /// Owning task
    pub task_id: TaskId,
    /// Stage about to run
    pub role: Role,
    /// How it will run
    pub mode: ExecutionMode,
}

/// What a post-stage check sees
#[derive(Debug)]
pub struct PostStageContext<'a> {
    /// Owning task
    pub task_id: TaskId,
    /// Stage that produced the output
    pub role: Role,
    /// Output to check
    pub output: &'a StageOutput,
    /// Bundle before the output is merged
    pub bundle: &'a MetadataBundle,
    /// Flags reported by the Critic so far
    pub critic_flags: &'a [String],
}

/// A check run before the executor
pub trait PreStageCheck: Send + Sync + std::fmt::Debug {
    /// Short name for tracing
    fn name(&self) -> &'static str;

    /// Run the check
    ///
    /// # Errors
    /// `PreStageError` when the stage must not start.
    fn check(&self, ctx: &PreStageContext<'_>) -> Result<(), PreStageError>;
}

/// A check run on executor output before it is merged
pub trait PostStageCheck: Send + Sync + std::fmt::Debug {
    /// Short name for tracing
    fn name(&self) -> &'static str;

    /// Run the check
    ///
    /// # Errors
    /// `GovernanceError` describing the first problem found.
    fn check(&self, ctx: &PostStageContext<'_>) -> Result<(), GovernanceError>;
}

/// Stage must match the task's current state
#[derive(Debug, Clone, Copy, Default)]
pub struct StageOrderCheck;

impl PreStageCheck for StageOrderCheck {
    fn name(&self) -> &'static str {
        "stage_order"
    }

    fn check(&self, ctx: &PreStageContext<'_>) -> Result<(), PreStageError> {
        let current = ctx.entry.state();
        if current.is_terminal() {
            return Err(PreStageError::Finished(current));
        }
        if current != PipelineState::from_role(ctx.role) {
            return Err(PreStageError::OutOfOrder {
                role: ctx.role,
                current,
            });
        }
        Ok(())
    }
}

/// Task must not be cancelled
#[derive(Debug, Clone, Copy, Default)]
pub struct CancellationCheck;

impl PreStageCheck for CancellationCheck {
    fn name(&self) -> &'static str {
        "cancellation"
    }

    fn check(&self, ctx: &PreStageContext<'_>) -> Result<(), PreStageError> {
        if ctx.entry.cancel_token().is_cancelled() {
            Err(PreStageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Externally executed stages reserve their call up front
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalQuotaCheck;

impl PreStageCheck for ExternalQuotaCheck {
    fn name(&self) -> &'static str {
        "external_quota"
    }

    fn check(&self, ctx: &PreStageContext<'_>) -> Result<(), PreStageError> {
        if ctx.mode == ExecutionMode::Fallback {
            return Ok(());
        }
        ctx.services
            .check_access(ctx.task_id, ctx.role, &ResourceRequest::ExternalCall)?;
        ctx.services.reserve_call(ctx.task_id, ctx.role)?;
        Ok(())
    }
}

/// Output must carry content and sane annotations
#[derive(Debug, Clone, Copy, Default)]
pub struct WellFormedOutput;

impl PostStageCheck for WellFormedOutput {
    fn name(&self) -> &'static str {
        "well_formed"
    }

    fn check(&self, ctx: &PostStageContext<'_>) -> Result<(), GovernanceError> {
        let out = ctx.output;
        if out.content.trim().is_empty() {
            return Err(GovernanceError::ValidationFailure(format!(
                "{} produced empty content",
                ctx.role
            )));
        }
        if let Some(score) = out.tone_flags.voice_match_score {
            if !(0.0..=1.0).contains(&score) {
                return Err(GovernanceError::ValidationFailure(format!(
                    "voice match score {score} outside [0, 1]"
                )));
            }
        }
        if out.claims.iter().any(|c| c.text.trim().is_empty()) {
            return Err(GovernanceError::ValidationFailure(
                "claim without text".to_string(),
            ));
        }
        if out.critical_failure && out.critical_flags.is_empty() {
            return Err(GovernanceError::ValidationFailure(
                "critical failure reported without flags".to_string(),
            ));
        }
        Ok(())
    }
}

/// Attribution entries already in the bundle must come back unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct AttributionPreserved;

impl PostStageCheck for AttributionPreserved {
    fn name(&self) -> &'static str {
        "attribution_preserved"
    }

    fn check(&self, ctx: &PostStageContext<'_>) -> Result<(), GovernanceError> {
        for existing in &ctx.bundle.attribution {
            match ctx
                .output
                .attribution
                .iter()
                .find(|a| a.source_id == existing.source_id)
            {
                None => {
                    return Err(GovernanceError::ValidationFailure(format!(
                        "attribution entry '{}' was dropped",
                        existing.source_id
                    )))
                }
                Some(returned) if returned != existing => {
                    return Err(GovernanceError::ImmutableRecordMutation {
                        source_id: existing.source_id.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Verdict of a claim check
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClaimVerdict {
    /// Whether the output may be merged
    pub passed: bool,
    /// Share of claims that were validated, in `[0, 1]`
    pub score: f64,
}

/// Decides whether claims are backed by validated sources
pub trait ClaimCheck: Send + Sync + std::fmt::Debug {
    /// Judge `claims` against the running bundle
    fn verify(&self, claims: &[Claim], bundle: &MetadataBundle) -> ClaimVerdict;
}

/// Every claim must cite an attribution entry already in the bundle
#[derive(Debug, Clone, Copy, Default)]
pub struct SourcedClaimCheck;

impl ClaimCheck for SourcedClaimCheck {
    fn verify(&self, claims: &[Claim], bundle: &MetadataBundle) -> ClaimVerdict {
        if claims.is_empty() {
            return ClaimVerdict {
                passed: true,
                score: 1.0,
            };
        }
        let backed = claims
            .iter()
            .filter(|c| {
                c.source_id
                    .as_deref()
                    .is_some_and(|id| bundle.attribution_for(id).is_some())
            })
            .count();
        #[allow(clippy::cast_precision_loss)]
        let score = backed as f64 / claims.len() as f64;
        ClaimVerdict {
            passed: backed == claims.len(),
            score,
        }
    }
}

/// Once the Critic has flagged content, later stages may only make validated
/// claims
#[derive(Debug, Clone)]
pub struct ClaimsValidated {
    check: Arc<dyn ClaimCheck>,
}

impl ClaimsValidated {
    /// Use `check` to judge claims
    #[must_use]
    pub fn new(check: Arc<dyn ClaimCheck>) -> Self {
        Self { check }
    }
}

impl PostStageCheck for ClaimsValidated {
    fn name(&self) -> &'static str {
        "claims_validated"
    }

    fn check(&self, ctx: &PostStageContext<'_>) -> Result<(), GovernanceError> {
        if ctx.role <= Role::Critic || ctx.critic_flags.is_empty() {
            return Ok(());
        }
        let verdict = self.check.verify(&ctx.output.claims, ctx.bundle);
        if verdict.passed {
            Ok(())
        } else {
            Err(GovernanceError::ValidationFailure(format!(
                "claims not validated by the critic (score {:.2})",
                verdict.score
            )))
        }
    }
}

/// Ordered pre- and post-stage checks
#[derive(Debug, Clone)]
pub struct MiddlewareChain {
    pre: Vec<Arc<dyn PreStageCheck>>,
    post: Vec<Arc<dyn PostStageCheck>>,
}

impl MiddlewareChain {
    /// The standard chain
    #[must_use]
    pub fn standard(claims: Arc<dyn ClaimCheck>) -> Self {
        Self {
            pre: vec![
                Arc::new(StageOrderCheck),
                Arc::new(CancellationCheck),
                Arc::new(ExternalQuotaCheck),
            ],
            post: vec![
                Arc::new(WellFormedOutput),
                Arc::new(AttributionPreserved),
                Arc::new(ClaimsValidated::new(claims)),
            ],
        }
    }

    /// Append a pre-stage check
    #[must_use]
    pub fn with_pre(mut self, check: Arc<dyn PreStageCheck>) -> Self {
        self.pre.push(check);
        self
    }

    /// Append a post-stage check
    #[must_use]
    pub fn with_post(mut self, check: Arc<dyn PostStageCheck>) -> Self {
        self.post.push(check);
        self
    }

    /// Run pre-stage checks in order
    ///
    /// # Errors
    /// The first failing check's error.
    pub fn before(&self, ctx: &PreStageContext<'_>) -> Result<(), PreStageError> {
        for check in &self.pre {
            tracing::trace!(task_id = %ctx.task_id, role = %ctx.role, check = check.name(), "pre-stage check");
            check.check(ctx)?;
        }
        Ok(())
    }

    /// Run post-stage checks in order
    ///
    /// # Errors
    /// The first failing check's error.
    pub fn after(&self, ctx: &PostStageContext<'_>) -> Result<(), GovernanceError> {
        for check in &self.post {
            tracing::trace!(task_id = %ctx.task_id, role = %ctx.role, check = check.name(), "post-stage check");
            check.check(ctx)?;
        }
        Ok(())
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::standard(Arc::new(SourcedClaimCheck))
    }
}
