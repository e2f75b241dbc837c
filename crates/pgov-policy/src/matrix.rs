//! Permission matrix
//!
//! Static, read-only table mapping each [`Role`] to its permission envelope.
//! The matrix is built once per process generation and shared behind an
//! `Arc`; it exposes no mutating API.

use crate::error::ConfigError;
use crate::types::{DataSource, Role};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a role may use the external reasoning service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExternalServicePolicy {
    /// Never calls the external service
    None,
    /// Calls it only after the deterministic service failed
    FallbackOnly,
    /// External service is the normal execution mode
    Primary,
}

/// Access rule for one data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAccess {
    /// The data source
    pub source: DataSource,
    /// Maximum snippets per query (`None` = uncapped)
    #[serde(default)]
    pub max_snippets: Option<u32>,
    /// Whether engagement/metadata fields may be read
    #[serde(default)]
    pub engagement_fields: bool,
}

impl SourceAccess {
    /// Uncapped access including engagement fields
    #[inline]
    #[must_use]
    pub fn full(source: DataSource) -> Self {
        Self {
            source,
            max_snippets: None,
            engagement_fields: true,
        }
    }

    /// Capped access without engagement fields
    #[inline]
    #[must_use]
    pub fn restricted(source: DataSource, max_snippets: u32) -> Self {
        Self {
            source,
            max_snippets: Some(max_snippets),
            engagement_fields: false,
        }
    }
}

/// Permission envelope of a single role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    /// Role this grant applies to
    pub role: Role,
    /// Data sources the role may query
    #[serde(default)]
    pub sources: Vec<SourceAccess>,
    /// Whether retrieval-augmented queries are allowed
    #[serde(default)]
    pub retrieval_queries: bool,
    /// External calls per task under normal conditions
    #[serde(default)]
    pub max_external_calls: u32,
    /// External-service usage policy
    pub external_policy: ExternalServicePolicy,
    /// Extra calls unlocked by a governance override
    #[serde(default)]
    pub override_calls: u32,
}

impl PermissionGrant {
    /// Rule for a data source, if the role may query it
    #[inline]
    #[must_use]
    pub fn source_access(&self, source: DataSource) -> Option<&SourceAccess> {
        self.sources.iter().find(|s| s.source == source)
    }

    /// Whether the role may ever reach the external service
    #[inline]
    #[must_use]
    pub fn may_call_external(&self) -> bool {
        self.external_policy != ExternalServicePolicy::None || self.override_calls > 0
    }
}

/// Retrieval-augmented query rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RagPolicy {
    /// Queries per task
    pub max_queries: u32,
    /// Hard per-query timeout in seconds
    pub timeout_secs: u64,
    /// Domains queries may target (subdomains included)
    pub domain_whitelist: Vec<String>,
}

impl RagPolicy {
    /// Per-query timeout
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether a domain is covered by the whitelist
    #[must_use]
    pub fn is_whitelisted(&self, domain: &str) -> bool {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        self.domain_whitelist.iter().any(|allowed| {
            let allowed = allowed.to_ascii_lowercase();
            domain == allowed || domain.ends_with(&format!(".{allowed}"))
        })
    }
}

impl Default for RagPolicy {
    fn default() -> Self {
        Self {
            max_queries: 3,
            timeout_secs: 30,
            domain_whitelist: vec![
                "wikipedia.org".to_string(),
                "reuters.com".to_string(),
                "apnews.com".to_string(),
            ],
        }
    }
}

/// Role → permission envelope table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionMatrix {
    grants: [PermissionGrant; 5],
    rag: RagPolicy,
}

impl PermissionMatrix {
    /// Build and validate a matrix from one grant per role
    ///
    /// # Errors
    /// - `ConfigError::RoleCardinality` if a role is missing or repeated
    /// - `ConfigError::InvalidMatrix` if not exactly one role may issue
    ///   retrieval-augmented queries, or a role without external access
    ///   declares external calls
    pub fn new(grants: Vec<PermissionGrant>, rag: RagPolicy) -> Result<Self, ConfigError> {
        for role in Role::ALL {
            let count = grants.iter().filter(|g| g.role == role).count();
            if count != 1 {
                return Err(ConfigError::RoleCardinality { role, count });
            }
        }

        let rag_roles = grants.iter().filter(|g| g.retrieval_queries).count();
        if rag_roles != 1 {
            return Err(ConfigError::InvalidMatrix(format!(
                "exactly one role may issue retrieval-augmented queries, found {rag_roles}"
            )));
        }

        for grant in &grants {
            if grant.external_policy == ExternalServicePolicy::None && grant.max_external_calls > 0
            {
                return Err(ConfigError::InvalidMatrix(format!(
                    "{} has external policy 'none' but max_external_calls = {}",
                    grant.role, grant.max_external_calls
                )));
            }
            if let Some(dup) = DataSource::ALL
                .into_iter()
                .find(|d| grant.sources.iter().filter(|s| s.source == *d).count() > 1)
            {
                return Err(ConfigError::InvalidMatrix(format!(
                    "{} lists data source {dup} more than once",
                    grant.role
                )));
            }
        }

        let mut grants = grants;
        grants.sort_by_key(|g| g.role.index());
        let grants: [PermissionGrant; 5] = grants.try_into().map_err(|v: Vec<_>| {
            ConfigError::InvalidMatrix(format!("expected 5 grants, found {}", v.len()))
        })?;

        Ok(Self { grants, rag })
    }

    /// Built-in matrix
    ///
    /// | Role | Sources | RAG | Policy | Calls |
    /// |---|---|---|---|---|
    /// | Ideator | all, uncapped | no | primary | 1 |
    /// | Drafter | social, articles (cap 5, no engagement) | no | primary | 2 |
    /// | Critic | articles (cap 5, no engagement) | yes | primary | 1 |
    /// | Revisor | none | no | fallback-only | 1 |
    /// | Summarizer | none | no | fallback-only | 0 (+1 override) |
    #[must_use]
    pub fn standard() -> Self {
        Self {
            grants: Self::standard_grants(),
            rag: RagPolicy::default(),
        }
    }

    /// Grants of the built-in matrix, in stage order
    #[must_use]
    pub fn standard_grants() -> [PermissionGrant; 5] {
        [
            PermissionGrant {
                role: Role::Ideator,
                sources: DataSource::ALL.into_iter().map(SourceAccess::full).collect(),
                retrieval_queries: false,
                max_external_calls: 1,
                external_policy: ExternalServicePolicy::Primary,
                override_calls: 0,
            },
            PermissionGrant {
                role: Role::Drafter,
                sources: vec![
                    SourceAccess::restricted(DataSource::SocialPosts, 5),
                    SourceAccess::restricted(DataSource::PublishedArticles, 5),
                ],
                retrieval_queries: false,
                max_external_calls: 2,
                external_policy: ExternalServicePolicy::Primary,
                override_calls: 0,
            },
            PermissionGrant {
                role: Role::Critic,
                sources: vec![SourceAccess::restricted(DataSource::PublishedArticles, 5)],
                retrieval_queries: true,
                max_external_calls: 1,
                external_policy: ExternalServicePolicy::Primary,
                override_calls: 0,
            },
            PermissionGrant {
                role: Role::Revisor,
                sources: Vec::new(),
                retrieval_queries: false,
                max_external_calls: 1,
                external_policy: ExternalServicePolicy::FallbackOnly,
                override_calls: 0,
            },
            PermissionGrant {
                role: Role::Summarizer,
                sources: Vec::new(),
                retrieval_queries: false,
                max_external_calls: 0,
                external_policy: ExternalServicePolicy::FallbackOnly,
                override_calls: 1,
            },
        ]
    }

    /// Grant for a role
    #[inline]
    #[must_use]
    pub fn grant(&self, role: Role) -> &PermissionGrant {
        &self.grants[role.index()]
    }

    /// All grants in stage order
    #[inline]
    pub fn grants(&self) -> impl Iterator<Item = &PermissionGrant> {
        self.grants.iter()
    }

    /// Retrieval-augmented query rules
    #[inline]
    #[must_use]
    pub fn rag_policy(&self) -> &RagPolicy {
        &self.rag
    }

    /// The single role allowed to issue retrieval-augmented queries
    #[must_use]
    pub fn designated_rag_role(&self) -> Role {
        self.grants
            .iter()
            .find(|g| g.retrieval_queries)
            .map_or(Role::Critic, |g| g.role)
    }
}

impl Default for PermissionMatrix {
    fn default() -> Self {
        Self::standard()
    }
}
