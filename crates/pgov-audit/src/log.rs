//! Audit log facade

use crate::entry::{ActionType, AuditEntry, AuditEvent, GENESIS_HASH};
use crate::error::AuditError;
use crate::store::{AuditStore, MemoryAuditStore};
use pgov_policy::TaskId;
use std::sync::Arc;

/// Shared handle to the audit trail
#[derive(Debug, Clone)]
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
}

impl AuditLog {
    /// Wrap a store
    #[must_use]
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Log backed by a fresh [`MemoryAuditStore`]
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryAuditStore::new()))
    }

    /// Append an event
    ///
    /// # Errors
    /// Propagates the store failure. Callers treat it as fatal for the task.
    pub fn append(&self, event: AuditEvent) -> Result<AuditEntry, AuditError> {
        let task_id = event.task_id;
        let action = event.action_type;
        match self.store.append(event) {
            Ok(entry) => {
                tracing::trace!(%task_id, seq = entry.seq, %action, decision = entry.decision.as_str(), "audit entry appended");
                Ok(entry)
            }
            Err(err) => {
                tracing::error!(%task_id, %action, store = self.store.name(), error = %err, "audit append failed");
                Err(err)
            }
        }
    }

    /// Entries of a task in append order
    ///
    /// # Errors
    /// If the store cannot be read.
    pub fn query(&self, task_id: TaskId) -> Result<Vec<AuditEntry>, AuditError> {
        self.store.query(task_id)
    }

    /// Entries of a task with the given action type
    ///
    /// # Errors
    /// If the store cannot be read.
    pub fn query_action(
        &self,
        task_id: TaskId,
        action: ActionType,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(self
            .query(task_id)?
            .into_iter()
            .filter(|e| e.action_type == action)
            .collect())
    }

    /// Tasks with at least one entry
    #[must_use]
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.store.task_ids()
    }

    /// Check the hash chain and timestamp order of a task
    ///
    /// # Errors
    /// `AuditError::IntegrityViolation` naming the first broken entry.
    pub fn verify_integrity(&self, task_id: TaskId) -> Result<(), AuditError> {
        let entries = self.query(task_id)?;
        let mut prev_hash = GENESIS_HASH;
        let mut prev_entry: Option<&AuditEntry> = None;

        for entry in &entries {
            let ordered = prev_entry
                .map_or(true, |p| p.seq < entry.seq && p.timestamp < entry.timestamp);
            if entry.task_id != task_id
                || entry.prev_hash != prev_hash
                || !entry.is_intact()
                || !ordered
            {
                return Err(AuditError::IntegrityViolation {
                    task_id,
                    seq: entry.seq,
                });
            }
            prev_hash = entry.hash.as_str();
            prev_entry = Some(entry);
        }
        Ok(())
    }

    /// Underlying store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::in_memory()
    }
}
