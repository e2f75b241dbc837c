//! Data-source and retrieval connectors
//!
//! Storage and search live outside the governance layer. Stages never hold a
//! connector; they reach one through [`crate::gateway::StageContext`], which
//! validates, audits and trims every call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgov_policy::DataSource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// One snippet returned by a data source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snippet {
    /// Snippet text
    pub snippet: String,
    /// Stable identifier of the underlying record
    pub source_id: String,
    /// Record time
    pub timestamp: DateTime<Utc>,
    /// Engagement/metadata fields (likes, shares, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engagement: Option<BTreeMap<String, u64>>,
}

/// One retrieval-augmented result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RagResult {
    /// Result text
    pub result: String,
    /// Source URL or domain
    #[serde(default)]
    pub source: Option<String>,
    /// Publication or retrieval time
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl RagResult {
    /// Whether the result can be attributed
    #[inline]
    #[must_use]
    pub fn is_attributed(&self) -> bool {
        self.source.as_deref().is_some_and(|s| !s.trim().is_empty()) && self.timestamp.is_some()
    }
}

/// Connector failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    /// Backend unreachable
    #[error("connector unavailable: {0}")]
    Unavailable(String),

    /// Backend throttled the request
    #[error("rate limited")]
    RateLimited {
        /// Suggested wait, if the backend gave one
        retry_after: Option<Duration>,
    },
}

/// Access to the author's data sources
#[async_trait]
pub trait DataSourceConnector: Send + Sync + std::fmt::Debug {
    /// Query a source for up to `limit` snippets
    ///
    /// # Errors
    /// `ConnectorError` when the backend fails or throttles.
    async fn query(
        &self,
        source: DataSource,
        text: &str,
        limit: u32,
    ) -> Result<Vec<Snippet>, ConnectorError>;
}

/// Retrieval-augmented search
#[async_trait]
pub trait RagConnector: Send + Sync + std::fmt::Debug {
    /// Search for `text`
    ///
    /// # Errors
    /// `ConnectorError` when the backend fails or throttles.
    async fn query(&self, text: &str) -> Result<Vec<RagResult>, ConnectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribution_requires_source_and_time() {
        let mut r = RagResult {
            result: "Paris is the capital of France".into(),
            source: Some("https://en.wikipedia.org/wiki/Paris".into()),
            timestamp: Some(Utc::now()),
        };
        assert!(r.is_attributed());
        r.timestamp = None;
        assert!(!r.is_attributed());
        r.timestamp = Some(Utc::now());
        r.source = Some("  ".into());
        assert!(!r.is_attributed());
    }

    #[test]
    fn engagement_omitted_when_absent() {
        let s = Snippet {
            snippet: "post".into(),
            source_id: "sp-1".into(),
            timestamp: Utc::now(),
            engagement: None,
        };
        let json = serde_json::to_value(&s).unwrap();
        assert!(json.get("engagement").is_none());
    }
}
