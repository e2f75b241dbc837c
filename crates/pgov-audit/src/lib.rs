//! Pipeline governance audit trail
//!
//! Every permission check, quota check, data-source and retrieval query, stage
//! boundary, violation and cancellation is recorded as an [`AuditEntry`].
//! Entries of a task form a SHA-256 hash chain with strictly increasing
//! timestamps, so the full decision history of a task can be reconstructed
//! and checked with [`AuditLog::verify_integrity`].
//!
//! # Example
//!
//! ```rust
//! use pgov_audit::{ActionType, AuditEvent, AuditLog};
//! use pgov_policy::{Role, TaskId};
//!
//! let log = AuditLog::in_memory();
//! let task = TaskId::new();
//! log.append(AuditEvent::new(task, ActionType::StageStart).role(Role::Ideator))
//!     .unwrap();
//! assert_eq!(log.query(task).unwrap().len(), 1);
//! log.verify_integrity(task).unwrap();
//! ```

#![warn(unreachable_pub)]

pub mod entry;
pub mod error;
pub mod log;
pub mod store;

pub use entry::{ActionType, AuditEntry, AuditEvent, Decision, GENESIS_HASH};
pub use error::AuditError;
pub use log::AuditLog;
pub use store::{AuditStore, JsonlAuditStore, MemoryAuditStore};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
