//! Error types for the policy layer
//!
//! Denials and quota refusals live next to the components that produce them
//! ([`crate::validator::AccessDenial`], [`crate::quota::QuotaExceeded`]); this
//! module holds parsing and configuration failures.

use crate::types::Role;
use std::path::PathBuf;

/// Parsing errors for identifiers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// Role name not in the closed set
    #[error("unknown role: '{0}'")]
    UnknownRole(String),

    /// Data source name not in the closed set
    #[error("unknown data source: '{0}'")]
    UnknownDataSource(String),

    /// Malformed task identifier
    #[error("invalid task id: '{0}'")]
    InvalidTaskId(String),
}

/// Configuration load/validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error while reading a config file
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or schema error
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Matrix violates a structural rule
    #[error("invalid permission matrix: {0}")]
    InvalidMatrix(String),

    /// A role is declared twice or not at all
    #[error("role {role} declared {count} times in permission matrix")]
    RoleCardinality { role: Role, count: usize },

    /// Scalar setting out of range
    #[error("invalid setting {key}: {message}")]
    InvalidSetting { key: &'static str, message: String },
}

impl ConfigError {
    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create setting error
    pub fn invalid_setting(key: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidSetting {
            key,
            message: message.into(),
        }
    }
}
