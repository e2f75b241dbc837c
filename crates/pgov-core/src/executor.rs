//! Stage executor seam
//!
//! Text generation is not part of the governance layer. Each role is served by
//! an external [`StageExecutor`]; the orchestrator hands it a [`StageInput`]
//! and a [`StageContext`] (the only route to data sources) and receives a
//! [`StageOutput`] to validate and merge.

use crate::bundle::{Attribution, ChangeLogEntry, MetadataBundle, TokenStats, ToneFlags};
use crate::error::ExternalCallFailure;
use crate::gateway::StageContext;
use crate::types::ExecutionMode;
use async_trait::async_trait;
use pgov_policy::{Role, TaskId};
use serde::{Deserialize, Serialize};

/// Fixed directive set sent with every stage invocation
#[derive(Debug, PartialEq, Eq)]
pub struct GovernanceHeader {
    /// Tone constraints
    pub tone: &'static [&'static str],
    /// Attribution requirement
    pub attribution: &'static str,
    /// Grounding rule
    pub grounding: &'static str,
}

impl GovernanceHeader {
    /// All directives in order
    pub fn directives(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tone
            .iter()
            .copied()
            .chain([self.attribution, self.grounding])
    }

    /// Directives as a numbered block
    #[must_use]
    pub fn render(&self) -> String {
        self.directives()
            .enumerate()
            .map(|(i, d)| format!("{}. {d}", i + 1))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The header every executor receives
pub static GOVERNANCE_HEADER: GovernanceHeader = GovernanceHeader {
    tone: &[
        "Write in the author's established voice.",
        "Keep a measured tone; no sensational framing.",
    ],
    attribution: "Carry every attribution entry of the metadata bundle forward unchanged.",
    grounding: "Do not state facts beyond the supplied context and retrieved sources.",
};

/// A factual statement made by a stage output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Claim text
    pub text: String,
    /// Attribution entry backing the claim
    #[serde(default)]
    pub source_id: Option<String>,
}

impl Claim {
    /// Claim backed by an attribution entry
    #[must_use]
    pub fn sourced(text: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source_id: Some(source_id.into()),
        }
    }

    /// Claim without a source
    #[must_use]
    pub fn unsourced(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source_id: None,
        }
    }
}

/// Everything a stage receives
#[derive(Debug, Clone)]
pub struct StageInput {
    /// Owning task
    pub task_id: TaskId,
    /// Stage role
    pub role: Role,
    /// Execution mode of this invocation
    pub mode: ExecutionMode,
    /// Governance directives
    pub header: &'static GovernanceHeader,
    /// Original prompt
    pub user_prompt: String,
    /// Content classification
    pub classification: String,
    /// Content produced by the previous stage
    pub previous_output: String,
    /// Snapshot of the running bundle
    pub bundle: MetadataBundle,
    /// Flags reported by the Critic, once it has run
    pub critic_flags: Vec<String>,
}

/// Everything a stage returns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOutput {
    /// Produced content
    pub content: String,
    /// Sources consulted
    pub input_sources: Vec<String>,
    /// Attribution entries, including all previously present ones
    pub attribution: Vec<Attribution>,
    /// Tone and safety annotations
    pub tone_flags: ToneFlags,
    /// Edits applied
    pub change_log: Vec<ChangeLogEntry>,
    /// Keyword suggestions
    pub long_tail_keywords: Vec<String>,
    /// Token accounting
    pub token_stats: TokenStats,
    /// Sections removed while compressing
    pub trimmed_sections: Vec<String>,
    /// Factual claims made by the content
    pub claims: Vec<Claim>,
    /// Critic findings carried into later stages
    pub critical_flags: Vec<String>,
    /// Critic verdict: content must not be published
    pub critical_failure: bool,
    /// Non-fatal executor remarks
    pub warnings: Vec<String>,
}

impl StageOutput {
    /// Output with content only
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// Set attribution entries
    #[inline]
    #[must_use]
    pub fn with_attribution(mut self, attribution: Vec<Attribution>) -> Self {
        self.attribution = attribution;
        self
    }

    /// Set claims
    #[inline]
    #[must_use]
    pub fn with_claims(mut self, claims: Vec<Claim>) -> Self {
        self.claims = claims;
        self
    }

    /// Add a critical flag
    #[inline]
    #[must_use]
    pub fn with_critical_flag(mut self, flag: impl Into<String>) -> Self {
        self.critical_flags.push(flag.into());
        self
    }

    /// Mark as a critical content failure
    #[inline]
    #[must_use]
    pub fn critical_failure(mut self) -> Self {
        self.critical_failure = true;
        self
    }

    /// Add a warning
    #[inline]
    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// One pipeline stage implementation
#[async_trait]
pub trait StageExecutor: Send + Sync + std::fmt::Debug {
    /// Run the stage
    ///
    /// # Errors
    /// `ExternalCallFailure` if the service behind the executor failed.
    async fn execute(
        &self,
        input: StageInput,
        ctx: StageContext,
    ) -> Result<StageOutput, ExternalCallFailure>;
}
