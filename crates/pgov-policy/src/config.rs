//! Governance configuration
//!
//! Loaded from TOML once at process start. Every section is optional; missing
//! values fall back to the built-in defaults, and `[[roles]]` entries replace
//! the standard grant of the role they name.
//!
//! ```toml
//! [pipeline]
//! stage_timeout_secs = 90
//! max_concurrent_calls = 8
//!
//! [severity]
//! critical_overage_ratio = 1.0
//!
//! [rag]
//! max_queries = 3
//! timeout_secs = 30
//! domain_whitelist = ["wikipedia.org"]
//!
//! [[roles]]
//! role = "drafter"
//! external_policy = "primary"
//! max_external_calls = 1
//! sources = [{ source = "published_articles", max_snippets = 5 }]
//! ```

use crate::error::ConfigError;
use crate::matrix::{PermissionGrant, PermissionMatrix, RagPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Pipeline execution settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Time budget for one stage executor invocation
    pub stage_timeout_secs: u64,
    /// Time budget for one data-source query
    pub source_timeout_secs: u64,
    /// Concurrent external invocations across all tasks
    pub max_concurrent_calls: usize,
    /// Fallback-mode switches allowed per task
    pub fallback_transitions: u32,
}

impl PipelineSettings {
    /// Stage time budget
    #[inline]
    #[must_use]
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    /// Data-source query time budget
    #[inline]
    #[must_use]
    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_secs)
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stage_timeout_secs: 120,
            source_timeout_secs: 30,
            max_concurrent_calls: 16,
            fallback_transitions: 1,
        }
    }
}

/// Severity thresholds
///
/// Quota overruns are Critical when `attempted > max * (1 + ratio)` and High
/// otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityPolicy {
    /// Overage ratio above which a quota overrun is Critical
    pub critical_overage_ratio: f64,
}

impl SeverityPolicy {
    /// Whether `attempted` calls against `max` is a large overrun
    #[must_use]
    pub fn is_large_overage(&self, attempted: u32, max: u32) -> bool {
        f64::from(attempted) > f64::from(max) * (1.0 + self.critical_overage_ratio)
    }
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        Self {
            critical_overage_ratio: 1.0,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Pipeline execution settings
    pub pipeline: PipelineSettings,
    /// Severity thresholds
    pub severity: SeverityPolicy,
    /// Retrieval-augmented query rules
    pub rag: RagPolicy,
    /// Grants replacing the standard ones
    pub roles: Vec<PermissionGrant>,
}

impl GovernanceConfig {
    /// Load and validate configuration from a TOML file
    ///
    /// # Errors
    /// - `ConfigError::Io` if the file cannot be read
    /// - `ConfigError::Parse` on invalid TOML
    /// - any validation error from [`GovernanceConfig::validate`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::io_error(path, e))?;
        let config = Self::from_toml_str(&raw)?;
        tracing::info!(path = %path.display(), overrides = config.roles.len(), "governance config loaded");
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    ///
    /// # Errors
    /// See [`GovernanceConfig::load`].
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings and build the matrix once to surface structural errors
    ///
    /// # Errors
    /// `ConfigError::InvalidSetting` or any matrix error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.stage_timeout_secs == 0 {
            return Err(ConfigError::invalid_setting(
                "pipeline.stage_timeout_secs",
                "must be greater than zero",
            ));
        }
        if self.pipeline.source_timeout_secs == 0 {
            return Err(ConfigError::invalid_setting(
                "pipeline.source_timeout_secs",
                "must be greater than zero",
            ));
        }
        if self.pipeline.max_concurrent_calls == 0 {
            return Err(ConfigError::invalid_setting(
                "pipeline.max_concurrent_calls",
                "must be greater than zero",
            ));
        }
        let ratio = self.severity.critical_overage_ratio;
        if !ratio.is_finite() || ratio < 0.0 {
            return Err(ConfigError::invalid_setting(
                "severity.critical_overage_ratio",
                format!("must be a non-negative number, got {ratio}"),
            ));
        }
        if self.rag.timeout_secs == 0 {
            return Err(ConfigError::invalid_setting(
                "rag.timeout_secs",
                "must be greater than zero",
            ));
        }
        self.matrix().map(|_| ())
    }

    /// Build the permission matrix: standard grants with `[[roles]]` applied
    ///
    /// # Errors
    /// Matrix validation errors, including a role overridden twice.
    pub fn matrix(&self) -> Result<PermissionMatrix, ConfigError> {
        for role in crate::types::Role::ALL {
            let count = self.roles.iter().filter(|g| g.role == role).count();
            if count > 1 {
                return Err(ConfigError::RoleCardinality { role, count });
            }
        }

        let grants = PermissionMatrix::standard_grants()
            .into_iter()
            .map(|standard| {
                self.roles
                    .iter()
                    .find(|g| g.role == standard.role)
                    .cloned()
                    .unwrap_or(standard)
            })
            .collect();

        PermissionMatrix::new(grants, self.rag.clone())
    }
}
