//! Access validator
//!
//! Checks a requested action against the [`PermissionMatrix`] and its
//! per-role sub-rules. Every refusal is an [`AccessDenial`] carrying the full
//! resource context; there is no other failure mode.

use crate::matrix::PermissionMatrix;
use crate::types::{DataSource, ResourceKind, Role};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email pattern")
});
static SSN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn pattern"));
static PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+?\d{1,2}[\s.-]?)?\(?\b\d{3}\)?[\s.-]\d{3}[\s.-]\d{4}\b")
        .expect("phone pattern")
});
static URL_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)https?://([a-z0-9.-]+)").expect("url host pattern"));

/// An action a role wants to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRequest {
    /// Query a data source
    DataSource {
        /// Target source
        source: DataSource,
        /// Requested snippet count
        limit: u32,
        /// Whether engagement/metadata fields are requested
        engagement_fields: bool,
    },
    /// Retrieval-augmented lookup
    RetrievalQuery {
        /// Query text
        text: String,
        /// Domains explicitly targeted (URLs in `text` are added)
        domains: Vec<String>,
    },
    /// Invoke the external reasoning service
    ExternalCall,
}

impl ResourceRequest {
    /// Data-source query without engagement fields
    #[inline]
    #[must_use]
    pub fn data_source(source: DataSource, limit: u32) -> Self {
        Self::DataSource {
            source,
            limit,
            engagement_fields: false,
        }
    }

    /// Retrieval-augmented query without explicit domains
    #[inline]
    #[must_use]
    pub fn retrieval(text: impl Into<String>) -> Self {
        Self::RetrievalQuery {
            text: text.into(),
            domains: Vec::new(),
        }
    }

    /// Kind of the requested resource
    #[inline]
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::DataSource { .. } => ResourceKind::DataSource,
            Self::RetrievalQuery { .. } => ResourceKind::RetrievalQuery,
            Self::ExternalCall => ResourceKind::ExternalCall,
        }
    }

    /// Resource identifier used in audit entries
    #[must_use]
    pub fn resource_id(&self) -> String {
        match self {
            Self::DataSource { source, limit, .. } => format!("{source}?limit={limit}"),
            Self::RetrievalQuery { text, .. } => {
                let mut preview: String = text.chars().take(64).collect();
                if text.chars().count() > 64 {
                    preview.push('…');
                }
                format!("rag:{preview}")
            }
            Self::ExternalCall => "reasoning-service".to_string(),
        }
    }
}

/// Why a request was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DenialReason {
    /// Source not in the role's allowed set
    #[error("role may not query {data_source}")]
    RoleNotPermitted { data_source: DataSource },

    /// Role is not the designated fact-checker
    #[error("role is not designated for retrieval-augmented queries")]
    RagNotDesignated,

    /// Role never reaches the external service
    #[error("role may not call the external service")]
    ExternalCallsNotPermitted,

    /// Per-query snippet cap exceeded
    #[error("requested {requested} snippets, cap is {cap}")]
    SnippetCapExceeded { requested: u32, cap: u32 },

    /// Engagement/metadata fields requested on a restricted source
    #[error("engagement fields are not available to this role")]
    EngagementFieldsDenied,

    /// Query text carries personally-identifying markers
    #[error("query contains personal data marker: {marker}")]
    PiiDetected { marker: &'static str },

    /// Query targets a domain outside the whitelist
    #[error("domain not whitelisted: {domain}")]
    DomainNotWhitelisted { domain: String },
}

impl DenialReason {
    /// Denials caused by the role itself rather than by a sub-rule
    #[inline]
    #[must_use]
    pub fn is_role_level(&self) -> bool {
        matches!(
            self,
            Self::RoleNotPermitted { .. } | Self::RagNotDesignated | Self::ExternalCallsNotPermitted
        )
    }
}

/// A refused access request with full context
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unauthorized {kind} by {role} on {resource}: {reason}")]
pub struct AccessDenial {
    /// Requesting role
    pub role: Role,
    /// Resource kind
    pub kind: ResourceKind,
    /// Resource identifier
    pub resource: String,
    /// Why it was refused
    pub reason: DenialReason,
}

/// Restrictions attached to an allowed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    /// Requesting role
    pub role: Role,
    /// Resource kind
    pub kind: ResourceKind,
    /// Resource identifier
    pub resource: String,
    /// Snippet cap to apply to results
    pub max_snippets: Option<u32>,
    /// Engagement fields must be removed from results
    pub strip_engagement: bool,
}

/// Validates role requests against the permission matrix
#[derive(Debug, Clone)]
pub struct AccessValidator {
    matrix: Arc<PermissionMatrix>,
}

impl AccessValidator {
    /// Create validator over a shared matrix
    #[inline]
    #[must_use]
    pub fn new(matrix: Arc<PermissionMatrix>) -> Self {
        Self { matrix }
    }

    /// Underlying matrix
    #[inline]
    #[must_use]
    pub fn matrix(&self) -> &PermissionMatrix {
        &self.matrix
    }

    /// Validate a request
    ///
    /// # Errors
    /// Returns `AccessDenial` describing the refused resource and reason.
    pub fn validate(
        &self,
        role: Role,
        request: &ResourceRequest,
    ) -> Result<AccessGrant, AccessDenial> {
        let deny = |reason: DenialReason| AccessDenial {
            role,
            kind: request.kind(),
            resource: request.resource_id(),
            reason,
        };
        let grant = self.matrix.grant(role);

        let outcome = match request {
            ResourceRequest::DataSource {
                source,
                limit,
                engagement_fields,
            } => {
                let access = grant.source_access(*source).ok_or_else(|| {
                    deny(DenialReason::RoleNotPermitted {
                        data_source: *source,
                    })
                })?;
                if let Some(cap) = access.max_snippets {
                    if *limit > cap {
                        return Err(deny(DenialReason::SnippetCapExceeded {
                            requested: *limit,
                            cap,
                        }));
                    }
                }
                if *engagement_fields && !access.engagement_fields {
                    return Err(deny(DenialReason::EngagementFieldsDenied));
                }
                AccessGrant {
                    role,
                    kind: request.kind(),
                    resource: request.resource_id(),
                    max_snippets: access.max_snippets,
                    strip_engagement: !access.engagement_fields,
                }
            }
            ResourceRequest::RetrievalQuery { text, domains } => {
                if !grant.retrieval_queries {
                    return Err(deny(DenialReason::RagNotDesignated));
                }
                if let Some(marker) = pii_marker(text) {
                    return Err(deny(DenialReason::PiiDetected { marker }));
                }
                let rag = self.matrix.rag_policy();
                if let Some(domain) = target_domains(text, domains)
                    .into_iter()
                    .find(|d| !rag.is_whitelisted(d))
                {
                    return Err(deny(DenialReason::DomainNotWhitelisted { domain }));
                }
                AccessGrant {
                    role,
                    kind: request.kind(),
                    resource: request.resource_id(),
                    max_snippets: None,
                    strip_engagement: false,
                }
            }
            ResourceRequest::ExternalCall => {
                if !grant.may_call_external() {
                    return Err(deny(DenialReason::ExternalCallsNotPermitted));
                }
                AccessGrant {
                    role,
                    kind: request.kind(),
                    resource: request.resource_id(),
                    max_snippets: None,
                    strip_engagement: false,
                }
            }
        };

        tracing::trace!(%role, resource = %outcome.resource, "access granted");
        Ok(outcome)
    }
}

/// First personal-data marker found in `text`
#[must_use]
pub fn pii_marker(text: &str) -> Option<&'static str> {
    if EMAIL.is_match(text) {
        Some("email")
    } else if SSN.is_match(text) {
        Some("ssn")
    } else if PHONE.is_match(text) {
        Some("phone")
    } else {
        None
    }
}

/// Lowercased domains targeted by a query: URL hosts in `text` plus `explicit`
#[must_use]
pub fn target_domains(text: &str, explicit: &[String]) -> Vec<String> {
    let mut out: Vec<String> = URL_HOST
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
        .chain(explicit.iter().map(|d| d.trim().to_ascii_lowercase()))
        .filter(|d| !d.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}
