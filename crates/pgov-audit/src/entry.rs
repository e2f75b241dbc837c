//! Audit entries
//!
//! Callers describe what happened with an [`AuditEvent`]; the store seals it
//! into an [`AuditEntry`] by assigning the sequence number, timestamp and
//! chain hashes. Sealed entries are never mutated.

use chrono::{DateTime, Utc};
use pgov_policy::{Role, TaskId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hash used as `prev_hash` of the first entry of every task
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Kind of recorded decision or lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Task accepted by the orchestrator
    TaskSubmitted,
    /// Access validator decision
    PermissionCheck,
    /// Quota reservation decision
    QuotaCheck,
    /// Data-source query issued through the gateway
    DataSourceQuery,
    /// Retrieval-augmented query issued through the gateway
    RetrievalQuery,
    /// Stage executor about to be invoked
    StageStart,
    /// Stage finished (successfully or not)
    StageEnd,
    /// Violation classified and handled
    Violation,
    /// Terminal stage switched from fallback to external mode
    FallbackTransition,
    /// Task cancelled by request
    Cancellation,
    /// Task reached a terminal status
    TaskFinished,
}

impl ActionType {
    /// Stable name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::TaskSubmitted => "task_submitted",
            ActionType::PermissionCheck => "permission_check",
            ActionType::QuotaCheck => "quota_check",
            ActionType::DataSourceQuery => "data_source_query",
            ActionType::RetrievalQuery => "retrieval_query",
            ActionType::StageStart => "stage_start",
            ActionType::StageEnd => "stage_end",
            ActionType::Violation => "violation",
            ActionType::FallbackTransition => "fallback_transition",
            ActionType::Cancellation => "cancellation",
            ActionType::TaskFinished => "task_finished",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the recorded decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Action went ahead
    Allowed,
    /// Action was refused or failed
    Denied,
}

impl Decision {
    /// Stable name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Allowed => "allowed",
            Decision::Denied => "denied",
        }
    }

    /// Map a boolean outcome
    #[inline]
    #[must_use]
    pub fn from_allowed(allowed: bool) -> Self {
        if allowed {
            Decision::Allowed
        } else {
            Decision::Denied
        }
    }
}

/// Unsealed description of something to record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    /// Owning task
    pub task_id: TaskId,
    /// Acting role, if any
    pub role: Option<Role>,
    /// What happened
    pub action_type: ActionType,
    /// Resource identifier
    pub resource: String,
    /// Outcome
    pub decision: Decision,
    /// Free-form context
    pub detail: String,
}

impl AuditEvent {
    /// New allowed event with no role, resource or detail
    #[must_use]
    pub fn new(task_id: TaskId, action_type: ActionType) -> Self {
        Self {
            task_id,
            role: None,
            action_type,
            resource: String::new(),
            decision: Decision::Allowed,
            detail: String::new(),
        }
    }

    /// Set the acting role
    #[inline]
    #[must_use]
    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    /// Set the resource identifier
    #[inline]
    #[must_use]
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    /// Set the decision
    #[inline]
    #[must_use]
    pub fn decision(mut self, decision: Decision) -> Self {
        self.decision = decision;
        self
    }

    /// Mark as denied
    #[inline]
    #[must_use]
    pub fn denied(self) -> Self {
        self.decision(Decision::Denied)
    }

    /// Set the detail text
    #[inline]
    #[must_use]
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// Sealed, immutable audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Store-wide sequence number
    pub seq: u64,
    /// Owning task
    pub task_id: TaskId,
    /// Acting role, if any
    pub role: Option<Role>,
    /// What happened
    pub action_type: ActionType,
    /// Resource identifier
    pub resource: String,
    /// Outcome
    pub decision: Decision,
    /// Microsecond-precision UTC time, strictly increasing per task
    pub timestamp: DateTime<Utc>,
    /// Free-form context
    pub detail: String,
    /// Hash of the previous entry of the same task
    pub prev_hash: String,
    /// SHA-256 over this entry's fields and `prev_hash`, hex encoded
    pub hash: String,
}

impl AuditEntry {
    /// Seal an event
    #[must_use]
    pub fn seal(event: AuditEvent, seq: u64, timestamp: DateTime<Utc>, prev_hash: String) -> Self {
        let mut entry = Self {
            seq,
            task_id: event.task_id,
            role: event.role,
            action_type: event.action_type,
            resource: event.resource,
            decision: event.decision,
            timestamp,
            detail: event.detail,
            prev_hash,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash();
        entry
    }

    /// Recompute the hash from the current field values
    #[must_use]
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.seq.to_le_bytes());
        hasher.update(self.task_id.0.to_bytes());
        hasher.update(self.role.map_or("", Role::as_str).as_bytes());
        hasher.update([0]);
        hasher.update(self.action_type.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.resource.as_bytes());
        hasher.update([0]);
        hasher.update(self.decision.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.timestamp.timestamp_micros().to_le_bytes());
        hasher.update(self.detail.as_bytes());
        hasher.update([0]);
        hasher.update(self.prev_hash.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Whether the stored hash matches the fields
    #[inline]
    #[must_use]
    pub fn is_intact(&self) -> bool {
        self.hash == self.compute_hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sealed() -> AuditEntry {
        let event = AuditEvent::new(TaskId::new(), ActionType::PermissionCheck)
            .role(Role::Drafter)
            .resource("personal_notes?limit=3")
            .denied()
            .detail("role may not query personal_notes");
        AuditEntry::seal(event, 7, Utc::now(), GENESIS_HASH.to_string())
    }

    #[test]
    fn builder_sets_fields() {
        let entry = sealed();
        assert_eq!(entry.role, Some(Role::Drafter));
        assert_eq!(entry.decision, Decision::Denied);
        assert_eq!(entry.hash.len(), 64);
        assert!(entry.is_intact());
    }

    #[test]
    fn tampering_breaks_hash() {
        let mut entry = sealed();
        entry.decision = Decision::Allowed;
        assert!(!entry.is_intact());

        let mut entry = sealed();
        entry.detail.push('!');
        assert!(!entry.is_intact());
    }

    #[test]
    fn json_uses_stable_names() {
        let entry = sealed();
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["action_type"], "permission_check");
        assert_eq!(json["decision"], "denied");
        assert_eq!(json["role"], "drafter");
    }
}
