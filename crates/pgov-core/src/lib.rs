//! Governed content pipeline
//!
//! Runs tasks through Ideator → Drafter → Critic → Revisor → Summarizer while
//! enforcing the permission matrix on every step:
//! - Mediates every data-source, retrieval and external-service access
//! - Wraps each stage in an ordered pre/post check chain
//! - Classifies findings by severity and contains them
//! - Records every decision in a hash-chained audit log
//! - Bounds external invocations with a worker pool, deadlines and cancel
//!   tokens
//!
//! # Example
//!
//! ```rust,ignore
//! use pgov_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(drafter: Arc<dyn StageExecutor>) -> Result<(), PipelineError> {
//! let orchestrator = PipelineOrchestrator::builder()
//!     .executor(Role::Drafter, ExecutionMode::External, drafter)
//!     // ... one executor per role
//!     .build()?;
//!
//! let outcome = orchestrator.run(TaskRequest::new("Write about ownership")).await?;
//! println!("{} with {} violation(s)", outcome.status, outcome.violations.len());
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

// Core modules
pub mod bundle;
pub mod connector;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod middleware;
pub mod orchestrator;
pub mod registry;
pub mod services;
pub mod state_machine;
pub mod types;
pub mod violation;
pub mod worker_pool;

// Re-exports for convenience
pub use bundle::{Attribution, ChangeLogEntry, MetadataBundle, TokenStats, ToneFlags};
pub use connector::{ConnectorError, DataSourceConnector, RagConnector, RagResult, Snippet};
pub use error::{
    ExternalCallFailure, GovernanceError, PipelineError, PoolError, StateMachineError,
};
pub use executor::{
    Claim, GovernanceHeader, StageExecutor, StageInput, StageOutput, GOVERNANCE_HEADER,
};
pub use gateway::{GatewayError, StageContext};
pub use middleware::{
    AttributionPreserved, CancellationCheck, ClaimCheck, ClaimVerdict, ClaimsValidated,
    ExternalQuotaCheck, MiddlewareChain, PostStageCheck, PostStageContext, PreStageCheck,
    PreStageContext, PreStageError, SourcedClaimCheck, StageOrderCheck, WellFormedOutput,
};
pub use orchestrator::{OrchestratorBuilder, PipelineOrchestrator, PipelineOutcome, TaskHandle};
pub use registry::{TaskEntry, TaskRegistry};
pub use services::GovernanceServices;
pub use state_machine::{allowed_transitions, validate_transition};
pub use types::{ExecutionMode, PipelineState, Task, TaskRequest, TaskStatus};
pub use violation::{
    Containment, Severity, Violation, ViolationClassifier, ViolationHandler, ViolationId,
    ViolationType,
};
pub use worker_pool::{CancelToken, PoolStats, WorkerPool};

pub use pgov_policy::{DataSource, GovernanceConfig, Role, TaskId};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for building and driving a pipeline
    pub use crate::{
        Attribution, Claim, DataSource, ExecutionMode, ExternalCallFailure, GovernanceConfig,
        MetadataBundle, PipelineError, PipelineOrchestrator, PipelineOutcome, Role,
        StageContext, StageExecutor, StageInput, StageOutput, TaskId, TaskRequest, TaskStatus,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
