//! Audit error types

use pgov_policy::TaskId;

/// Audit store failures
///
/// Every variant is fatal for the task whose append failed: a decision that
/// cannot be recorded must not take effect.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Backing store refused the write
    #[error("audit store unavailable: {0}")]
    StoreUnavailable(String),

    /// IO error on a file-backed store
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry could not be encoded or decoded
    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Hash chain or timestamp order broken
    #[error("audit chain broken for task {task_id} at seq {seq}")]
    IntegrityViolation { task_id: TaskId, seq: u64 },
}

impl AuditError {
    /// Create unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable(message.into())
    }

    /// Whether the store itself could not accept writes
    #[inline]
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_classification() {
        assert!(AuditError::unavailable("disk full").is_unavailable());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "broken pipe");
        assert!(AuditError::from(io).is_unavailable());
        let broken = AuditError::IntegrityViolation {
            task_id: TaskId::new(),
            seq: 3,
        };
        assert!(!broken.is_unavailable());
        assert!(broken.to_string().contains("seq 3"));
    }
}
