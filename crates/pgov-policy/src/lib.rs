//! Pipeline governance policy layer
//!
//! Read-only rules and per-task counters that every stage of the content
//! pipeline is checked against:
//! - [`PermissionMatrix`]: role → data sources, snippet caps, retrieval rights
//!   and external-call budget
//! - [`AccessValidator`]: pure allow/deny decisions for a role and a resource
//! - [`QuotaTracker`]: atomic per-task call reservation
//! - [`GovernanceConfig`]: TOML loading with role overrides
//!
//! # Example
//!
//! ```rust
//! use pgov_policy::prelude::*;
//! use std::sync::Arc;
//!
//! let matrix = Arc::new(PermissionMatrix::standard());
//! let validator = AccessValidator::new(Arc::clone(&matrix));
//!
//! let denied = validator
//!     .validate(Role::Drafter, &ResourceRequest::data_source(DataSource::PersonalNotes, 3))
//!     .unwrap_err();
//! assert!(denied.reason.is_role_level());
//!
//! let quota = QuotaTracker::new(matrix);
//! let task = TaskId::new();
//! assert_eq!(quota.reserve_call(Role::Drafter, task), Ok(0));
//! ```

#![warn(unreachable_pub)]

pub mod config;
pub mod error;
pub mod matrix;
pub mod quota;
pub mod types;
pub mod validator;

pub use config::{GovernanceConfig, PipelineSettings, SeverityPolicy};
pub use error::{ConfigError, PolicyError};
pub use matrix::{
    ExternalServicePolicy, PermissionGrant, PermissionMatrix, RagPolicy, SourceAccess,
};
pub use quota::{CallRecord, QuotaExceeded, QuotaKind, QuotaTracker, TaskUsage};
pub use types::{DataSource, ResourceKind, Role, TaskId};
pub use validator::{
    AccessDenial, AccessGrant, AccessValidator, DenialReason, ResourceRequest,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the policy layer
    pub use crate::{
        AccessValidator, DataSource, GovernanceConfig, PermissionMatrix, QuotaTracker,
        ResourceRequest, Role, TaskId,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
