//! Core identifiers shared by every governance component
//!
//! - Task identifiers (ULID for sortability)
//! - The closed set of pipeline roles
//! - The closed set of data sources
//! - Resource kinds a role may request

use crate::error::PolicyError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use ulid::Ulid;

/// Unique task identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Ulid);

impl TaskId {
    /// Generate new task ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|_| PolicyError::InvalidTaskId(s.to_string()))
    }
}

/// Pipeline roles, in stage order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Collects ideas and source material
    Ideator,
    /// Writes the first draft
    Drafter,
    /// Fact-checks and scores the draft
    Critic,
    /// Applies the critic's changes
    Revisor,
    /// Compresses the revision into the final output
    Summarizer,
}

impl Role {
    /// All roles in fixed stage order
    pub const ALL: [Role; 5] = [
        Role::Ideator,
        Role::Drafter,
        Role::Critic,
        Role::Revisor,
        Role::Summarizer,
    ];

    /// Position in the stage order
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Role::Ideator => 0,
            Role::Drafter => 1,
            Role::Critic => 2,
            Role::Revisor => 3,
            Role::Summarizer => 4,
        }
    }

    /// Stable lowercase name
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Ideator => "ideator",
            Role::Drafter => "drafter",
            Role::Critic => "critic",
            Role::Revisor => "revisor",
            Role::Summarizer => "summarizer",
        }
    }

    /// Next stage, `None` after the summarizer
    #[inline]
    #[must_use]
    pub fn next(self) -> Option<Role> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Revisor and summarizer run on the fallback service first
    #[inline]
    #[must_use]
    pub fn is_terminal_stage(self) -> bool {
        matches!(self, Role::Revisor | Role::Summarizer)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PolicyError::UnknownRole(s.to_string()))
    }
}

/// Content repositories a role may query
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Private notes of the author
    PersonalNotes,
    /// Social media posts, with engagement counters
    SocialPosts,
    /// Previously published articles
    PublishedArticles,
}

impl DataSource {
    /// Every known data source
    pub const ALL: [DataSource; 3] = [
        DataSource::PersonalNotes,
        DataSource::SocialPosts,
        DataSource::PublishedArticles,
    ];

    /// Stable snake_case name
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DataSource::PersonalNotes => "personal_notes",
            DataSource::SocialPosts => "social_posts",
            DataSource::PublishedArticles => "published_articles",
        }
    }
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSource {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PolicyError::UnknownDataSource(s.to_string()))
    }
}

/// Kind of resource a role asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// Query against one of the data sources
    DataSource,
    /// Retrieval-augmented lookup
    RetrievalQuery,
    /// Invocation of the external reasoning service
    ExternalCall,
}

impl ResourceKind {
    /// Stable kebab-case name
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::DataSource => "data-source",
            ResourceKind::RetrievalQuery => "retrieval-augmented-query",
            ResourceKind::ExternalCall => "external-call",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
