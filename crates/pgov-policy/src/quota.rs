//! Quota tracker
//!
//! Per-task, per-role counters of external calls and retrieval-augmented
//! queries. Reservation is a single atomic compare-and-increment on a counter
//! keyed by `(task_id, role)`, so unrelated tasks never contend and a counter
//! can never pass its maximum.

use crate::matrix::{ExternalServicePolicy, PermissionMatrix};
use crate::types::{Role, TaskId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// What a quota counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuotaKind {
    /// External reasoning-service calls
    ExternalCall,
    /// Retrieval-augmented queries
    RetrievalQuery,
}

impl std::fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaKind::ExternalCall => f.write_str("external-call"),
            QuotaKind::RetrievalQuery => f.write_str("retrieval-augmented-query"),
        }
    }
}

/// One granted reservation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Owning task
    pub task_id: TaskId,
    /// Reserving role
    pub role: Role,
    /// What was reserved
    pub kind: QuotaKind,
    /// Zero-based index of this reservation
    pub call_index: u32,
    /// When it was granted
    pub timestamp: DateTime<Utc>,
}

/// Refused reservation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} quota exceeded for {role} on task {task_id}: current={current}, max={max}")]
pub struct QuotaExceeded {
    /// Owning task
    pub task_id: TaskId,
    /// Reserving role
    pub role: Role,
    /// What was reserved
    pub kind: QuotaKind,
    /// Reservations already granted
    pub current: u32,
    /// Effective maximum at the time of the attempt
    pub max: u32,
    /// Total reservations attempted, including refused ones
    pub attempted: u32,
}

impl QuotaExceeded {
    /// Attempts beyond the maximum
    #[inline]
    #[must_use]
    pub fn overage(&self) -> u32 {
        self.attempted.saturating_sub(self.max)
    }
}

/// Usage of a finished task, kept after its live counters are released
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUsage {
    /// External calls granted per role, in stage order
    pub calls: [u32; 5],
    /// Retrieval-augmented queries granted
    pub rag_queries: u32,
    /// Granted external-call records, ordered by role then index
    pub records: Vec<CallRecord>,
}

impl TaskUsage {
    /// External calls granted to `role`
    #[inline]
    #[must_use]
    pub fn calls_for(&self, role: Role) -> u32 {
        self.calls[role.index()]
    }

    /// External calls granted across all roles
    #[must_use]
    pub fn total_calls(&self) -> u32 {
        self.calls.iter().sum()
    }
}

#[derive(Debug, Default)]
struct Counter {
    used: AtomicU32,
    refused: AtomicU32,
    records: Mutex<Vec<CallRecord>>,
}

#[derive(Debug, Default)]
struct TaskSignals {
    primary_failed: AtomicBool,
    governance_override: AtomicBool,
}

/// Per-task call quotas
#[derive(Debug)]
pub struct QuotaTracker {
    matrix: Arc<PermissionMatrix>,
    calls: DashMap<(TaskId, Role), Arc<Counter>>,
    rag: DashMap<TaskId, Arc<Counter>>,
    signals: DashMap<TaskId, Arc<TaskSignals>>,
    archived: DashMap<TaskId, TaskUsage>,
}

impl QuotaTracker {
    /// Create tracker over a shared matrix
    #[must_use]
    pub fn new(matrix: Arc<PermissionMatrix>) -> Self {
        Self {
            matrix,
            calls: DashMap::new(),
            rag: DashMap::new(),
            signals: DashMap::new(),
            archived: DashMap::new(),
        }
    }

    /// Reserve one external call
    ///
    /// Returns the zero-based index of the granted call.
    ///
    /// # Errors
    /// `QuotaExceeded` when the role's effective maximum is reached.
    pub fn reserve_call(&self, role: Role, task_id: TaskId) -> Result<u32, QuotaExceeded> {
        let max = self.effective_max(task_id, role);
        let counter = self.counter(&self.calls, (task_id, role));
        reserve(&counter, task_id, role, QuotaKind::ExternalCall, max)
    }

    /// Reserve one retrieval-augmented query
    ///
    /// Only the designated role has a non-zero allowance; callers are expected
    /// to validate the role first.
    ///
    /// # Errors
    /// `QuotaExceeded` when the per-task query cap is reached.
    pub fn reserve_rag_query(&self, role: Role, task_id: TaskId) -> Result<u32, QuotaExceeded> {
        let max = if self.matrix.grant(role).retrieval_queries
            && !self.archived.contains_key(&task_id)
        {
            self.matrix.rag_policy().max_queries
        } else {
            0
        };
        let counter = self.counter(&self.rag, task_id);
        reserve(&counter, task_id, role, QuotaKind::RetrievalQuery, max)
    }

    /// Maximum external calls currently available to `role` on `task_id`
    ///
    /// Zero once the task has been released.
    #[must_use]
    pub fn effective_max(&self, task_id: TaskId, role: Role) -> u32 {
        if self.archived.contains_key(&task_id) {
            return 0;
        }
        let grant = self.matrix.grant(role);
        let signals = self.signals.get(&task_id).map(|s| Arc::clone(s.value()));
        let primary_failed = signals
            .as_ref()
            .is_some_and(|s| s.primary_failed.load(Ordering::Acquire));
        let overridden = signals
            .as_ref()
            .is_some_and(|s| s.governance_override.load(Ordering::Acquire));

        let base = match grant.external_policy {
            ExternalServicePolicy::None => 0,
            ExternalServicePolicy::FallbackOnly if !primary_failed => 0,
            ExternalServicePolicy::FallbackOnly | ExternalServicePolicy::Primary => {
                grant.max_external_calls
            }
        };
        if overridden {
            base + grant.override_calls
        } else {
            base
        }
    }

    /// Raise the "primary service failed" signal for a task
    pub fn signal_primary_failure(&self, task_id: TaskId) {
        tracing::debug!(%task_id, "primary service failure signalled");
        self.task_signals(task_id)
            .primary_failed
            .store(true, Ordering::Release);
    }

    /// Whether the primary-failure signal is raised
    #[must_use]
    pub fn primary_failed(&self, task_id: TaskId) -> bool {
        self.signals
            .get(&task_id)
            .is_some_and(|s| s.primary_failed.load(Ordering::Acquire))
    }

    /// Record an explicit governance override for a task
    pub fn grant_override(&self, task_id: TaskId) {
        tracing::info!(%task_id, "governance override granted");
        self.task_signals(task_id)
            .governance_override
            .store(true, Ordering::Release);
    }

    /// Whether a governance override is present
    #[must_use]
    pub fn has_override(&self, task_id: TaskId) -> bool {
        self.signals
            .get(&task_id)
            .is_some_and(|s| s.governance_override.load(Ordering::Acquire))
    }

    /// External calls granted so far
    #[must_use]
    pub fn usage(&self, task_id: TaskId, role: Role) -> u32 {
        if let Some(usage) = self.archived.get(&task_id) {
            return usage.calls_for(role);
        }
        self.calls
            .get(&(task_id, role))
            .map_or(0, |c| c.used.load(Ordering::Acquire))
    }

    /// Retrieval-augmented queries granted so far
    #[must_use]
    pub fn rag_usage(&self, task_id: TaskId) -> u32 {
        if let Some(usage) = self.archived.get(&task_id) {
            return usage.rag_queries;
        }
        self.rag
            .get(&task_id)
            .map_or(0, |c| c.used.load(Ordering::Acquire))
    }

    /// Drop the live counters of a finished task and archive its usage
    ///
    /// Consumed quota is never given back: further reservations for the task
    /// are refused. Releasing twice returns the archived usage unchanged.
    pub fn release_task(&self, task_id: TaskId) -> TaskUsage {
        if let Some(usage) = self.archived.get(&task_id) {
            return usage.clone();
        }

        let mut usage = TaskUsage::default();
        // archive first so racing reservations see a zero maximum
        self.archived.insert(task_id, TaskUsage::default());
        for role in Role::ALL {
            if let Some((_, counter)) = self.calls.remove(&(task_id, role)) {
                usage.calls[role.index()] = counter.used.load(Ordering::Acquire);
                let mut records = counter.records.lock().clone();
                records.sort_by_key(|r| r.call_index);
                usage.records.extend(records);
            }
        }
        if let Some((_, counter)) = self.rag.remove(&task_id) {
            usage.rag_queries = counter.used.load(Ordering::Acquire);
        }
        self.signals.remove(&task_id);
        self.archived.insert(task_id, usage.clone());

        tracing::debug!(%task_id, calls = usage.total_calls(), rag = usage.rag_queries, "quota released");
        usage
    }

    /// Granted external-call records, ordered by index
    #[must_use]
    pub fn records(&self, task_id: TaskId, role: Role) -> Vec<CallRecord> {
        if let Some(usage) = self.archived.get(&task_id) {
            return usage
                .records
                .iter()
                .filter(|r| r.role == role)
                .cloned()
                .collect();
        }
        let Some(counter) = self.calls.get(&(task_id, role)).map(|c| Arc::clone(c.value())) else {
            return Vec::new();
        };
        let mut records = counter.records.lock().clone();
        records.sort_by_key(|r| r.call_index);
        records
    }

    fn counter<K>(&self, map: &DashMap<K, Arc<Counter>>, key: K) -> Arc<Counter>
    where
        K: std::hash::Hash + Eq,
    {
        // Clone the Arc out so the shard lock is not held during reservation.
        Arc::clone(map.entry(key).or_default().value())
    }

    fn task_signals(&self, task_id: TaskId) -> Arc<TaskSignals> {
        Arc::clone(self.signals.entry(task_id).or_default().value())
    }
}

fn reserve(
    counter: &Counter,
    task_id: TaskId,
    role: Role,
    kind: QuotaKind,
    max: u32,
) -> Result<u32, QuotaExceeded> {
    match counter
        .used
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n < max).then_some(n + 1)
        }) {
        Ok(index) => {
            counter.records.lock().push(CallRecord {
                task_id,
                role,
                kind,
                call_index: index,
                timestamp: Utc::now(),
            });
            Ok(index)
        }
        Err(current) => {
            let refused = counter.refused.fetch_add(1, Ordering::AcqRel) + 1;
            let err = QuotaExceeded {
                task_id,
                role,
                kind,
                current,
                max,
                attempted: current.max(max) + refused,
            };
            tracing::warn!(%task_id, %role, %kind, current, max, "quota exceeded");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tracker() -> QuotaTracker {
        QuotaTracker::new(Arc::new(PermissionMatrix::standard()))
    }

    #[test]
    fn single_call_role_second_reservation_denied() {
        let quota = tracker();
        let task = TaskId::new();

        assert_eq!(quota.reserve_call(Role::Ideator, task), Ok(0));
        let err = quota.reserve_call(Role::Ideator, task).unwrap_err();
        assert_eq!(err.current, 1);
        assert_eq!(err.max, 1);
        assert_eq!(err.attempted, 2);
        assert_eq!(err.overage(), 1);
    }

    #[test]
    fn counters_are_per_task() {
        let quota = tracker();
        let a = TaskId::new();
        let b = TaskId::new();
        assert!(quota.reserve_call(Role::Ideator, a).is_ok());
        assert!(quota.reserve_call(Role::Ideator, b).is_ok());
        assert_eq!(quota.usage(a, Role::Ideator), 1);
        assert_eq!(quota.usage(b, Role::Ideator), 1);
    }

    #[test]
    fn summarizer_needs_override() {
        let quota = tracker();
        let task = TaskId::new();

        let err = quota.reserve_call(Role::Summarizer, task).unwrap_err();
        assert_eq!((err.current, err.max), (0, 0));

        quota.grant_override(task);
        assert!(quota.has_override(task));
        assert_eq!(quota.reserve_call(Role::Summarizer, task), Ok(0));
        assert!(quota.reserve_call(Role::Summarizer, task).is_err());
    }

    #[test]
    fn revisor_needs_primary_failure() {
        let quota = tracker();
        let task = TaskId::new();

        assert_eq!(quota.effective_max(task, Role::Revisor), 0);
        assert!(quota.reserve_call(Role::Revisor, task).is_err());

        quota.signal_primary_failure(task);
        assert!(quota.primary_failed(task));
        assert_eq!(quota.effective_max(task, Role::Revisor), 1);
        assert_eq!(quota.reserve_call(Role::Revisor, task), Ok(0));
    }

    #[test]
    fn rag_cap_only_for_designated_role() {
        let quota = tracker();
        let task = TaskId::new();

        for i in 0..3 {
            assert_eq!(quota.reserve_rag_query(Role::Critic, task), Ok(i));
        }
        let err = quota.reserve_rag_query(Role::Critic, task).unwrap_err();
        assert_eq!(err.kind, QuotaKind::RetrievalQuery);
        assert_eq!(quota.rag_usage(task), 3);

        let other = TaskId::new();
        assert!(quota.reserve_rag_query(Role::Drafter, other).is_err());
    }

    #[test]
    fn refused_attempts_accumulate() {
        let quota = tracker();
        let task = TaskId::new();
        quota.reserve_call(Role::Critic, task).unwrap();
        assert_eq!(quota.reserve_call(Role::Critic, task).unwrap_err().attempted, 2);
        assert_eq!(quota.reserve_call(Role::Critic, task).unwrap_err().attempted, 3);
        // usage never moves past the maximum
        assert_eq!(quota.usage(task, Role::Critic), 1);
    }

    #[test]
    fn records_are_append_only() {
        let quota = tracker();
        let task = TaskId::new();
        quota.reserve_call(Role::Drafter, task).unwrap();
        quota.reserve_call(Role::Drafter, task).unwrap();
        let records = quota.records(task, Role::Drafter);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].call_index, 0);
        assert_eq!(records[1].call_index, 1);
        assert!(records.iter().all(|r| r.kind == QuotaKind::ExternalCall));
    }

    #[test]
    fn concurrent_reservations_never_exceed_max() {
        let quota = Arc::new(tracker());
        let task = TaskId::new();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let quota = Arc::clone(&quota);
                std::thread::spawn(move || quota.reserve_call(Role::Drafter, task).is_ok())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(granted, 2);
        assert_eq!(quota.usage(task, Role::Drafter), 2);
        assert_eq!(quota.records(task, Role::Drafter).len(), 2);
    }

    #[test]
    fn release_archives_usage_and_refuses_more() {
        let quota = tracker();
        let task = TaskId::new();
        quota.reserve_call(Role::Drafter, task).unwrap();
        quota.reserve_call(Role::Drafter, task).unwrap();
        quota.reserve_rag_query(Role::Critic, task).unwrap();

        let usage = quota.release_task(task);
        assert_eq!(usage.calls_for(Role::Drafter), 2);
        assert_eq!(usage.rag_queries, 1);
        assert_eq!(usage.records.len(), 2);

        // counters are archived, not reset
        assert_eq!(quota.usage(task, Role::Drafter), 2);
        assert_eq!(quota.records(task, Role::Drafter).len(), 2);
        assert!(quota.reserve_call(Role::Ideator, task).is_err());
        assert_eq!(quota.release_task(task), usage);
    }

    proptest! {
        #[test]
        fn prop_one_more_than_max_is_refused(role_idx in 0usize..5, extra in 0u32..4) {
            let quota = tracker();
            let task = TaskId::new();
            let role = Role::ALL[role_idx];
            quota.grant_override(task);
            quota.signal_primary_failure(task);
            let max = quota.effective_max(task, role);

            for i in 0..max {
                prop_assert_eq!(quota.reserve_call(role, task), Ok(i));
            }
            for n in 0..=extra {
                let err = quota.reserve_call(role, task).unwrap_err();
                prop_assert_eq!(err.current, max);
                prop_assert_eq!(err.max, max);
                prop_assert_eq!(err.attempted, max + n + 1);
            }
            prop_assert_eq!(quota.usage(task, role), max);
        }
    }
}
