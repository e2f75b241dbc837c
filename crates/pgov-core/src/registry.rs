//! Task registry
//!
//! Owns the lifecycle record of every submitted task. All state changes go
//! through [`crate::state_machine::validate_transition`], so stages advance
//! monotonically and terminal states are final. Records stay queryable after
//! a task ends.

use crate::error::PipelineError;
use crate::state_machine::validate_transition;
use crate::types::{PipelineState, Task, TaskStatus};
use crate::worker_pool::CancelToken;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use pgov_policy::TaskId;
use std::sync::Arc;

/// Registry record of one task
#[derive(Debug)]
pub struct TaskEntry {
    task: Mutex<Task>,
    reason: Mutex<Option<String>>,
    cancel: CancelToken,
}

impl TaskEntry {
    /// Snapshot of the task
    #[must_use]
    pub fn task(&self) -> Task {
        self.task.lock().clone()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.task.lock().current_stage
    }

    /// Why the task was rejected or terminated
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Cancel token shared with in-flight jobs
    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// Concurrent task registry
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: DashMap<TaskId, Arc<TaskEntry>>,
}

impl TaskRegistry {
    /// Create empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new task
    ///
    /// # Errors
    /// `PipelineError::DuplicateTask` if the id is already known, even if that
    /// task has finished.
    pub fn register(&self, task: Task) -> Result<Arc<TaskEntry>, PipelineError> {
        match self.tasks.entry(task.task_id) {
            Entry::Occupied(_) => Err(PipelineError::DuplicateTask(task.task_id)),
            Entry::Vacant(slot) => {
                let entry = Arc::new(TaskEntry {
                    task: Mutex::new(task),
                    reason: Mutex::new(None),
                    cancel: CancelToken::new(),
                });
                slot.insert(Arc::clone(&entry));
                Ok(entry)
            }
        }
    }

    /// Record of a task
    #[must_use]
    pub fn get(&self, task_id: TaskId) -> Option<Arc<TaskEntry>> {
        self.tasks.get(&task_id).map(|e| Arc::clone(e.value()))
    }

    /// Current state of a task
    #[must_use]
    pub fn state(&self, task_id: TaskId) -> Option<PipelineState> {
        self.get(task_id).map(|e| e.state())
    }

    /// Current status of a task
    #[must_use]
    pub fn status(&self, task_id: TaskId) -> Option<TaskStatus> {
        self.state(task_id).map(PipelineState::status)
    }

    /// Move a task to `to`
    ///
    /// # Errors
    /// - `PipelineError::UnknownTask`
    /// - `PipelineError::StateMachine` for an illegal transition
    pub fn transition(&self, task_id: TaskId, to: PipelineState) -> Result<(), PipelineError> {
        let entry = self.get(task_id).ok_or(PipelineError::UnknownTask(task_id))?;
        let mut task = entry.task.lock();
        validate_transition(task.current_stage, to)?;
        tracing::debug!(%task_id, from = %task.current_stage, %to, "task transition");
        task.current_stage = to;
        task.status = to.status();
        Ok(())
    }

    /// End a task as Rejected unless it already ended, and fire its cancel
    /// token so no rejected stage keeps running
    ///
    /// Returns the final state.
    ///
    /// # Errors
    /// `PipelineError::UnknownTask`
    pub fn reject(
        &self,
        task_id: TaskId,
        reason: impl Into<String>,
    ) -> Result<PipelineState, PipelineError> {
        self.end(task_id, PipelineState::Rejected, reason.into(), |_| ())
            .map(|(state, _)| state)
    }

    /// End a task as Terminated unless it already ended, and fire its cancel
    /// token
    ///
    /// Returns the final state.
    ///
    /// # Errors
    /// `PipelineError::UnknownTask`
    pub fn terminate(
        &self,
        task_id: TaskId,
        reason: impl Into<String>,
    ) -> Result<PipelineState, PipelineError> {
        self.terminate_with(task_id, reason, |_| ())
            .map(|(state, _)| state)
    }

    /// Terminate a task, running `on_end` before the new state is visible
    ///
    /// `on_end` receives the state the task was in and runs only if this call
    /// ended the task; anyone reading the task state waits until it returns.
    /// The cancel token fires afterwards.
    ///
    /// # Errors
    /// `PipelineError::UnknownTask`
    pub fn terminate_with<T>(
        &self,
        task_id: TaskId,
        reason: impl Into<String>,
        on_end: impl FnOnce(PipelineState) -> T,
    ) -> Result<(PipelineState, Option<T>), PipelineError> {
        self.end(task_id, PipelineState::Terminated, reason.into(), on_end)
    }

    /// Tasks currently running
    #[must_use]
    pub fn running(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|e| !e.value().state().is_terminal())
            .map(|e| *e.key())
            .collect()
    }

    /// Number of known tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn end<T>(
        &self,
        task_id: TaskId,
        to: PipelineState,
        reason: String,
        on_end: impl FnOnce(PipelineState) -> T,
    ) -> Result<(PipelineState, Option<T>), PipelineError> {
        let entry = self.get(task_id).ok_or(PipelineError::UnknownTask(task_id))?;
        let ended = {
            let mut task = entry.task.lock();
            if task.current_stage.is_terminal() {
                (task.current_stage, None)
            } else {
                let before = task.current_stage;
                validate_transition(before, to)?;
                task.current_stage = to;
                task.status = to.status();
                *entry.reason.lock() = Some(reason);
                (to, Some(on_end(before)))
            }
        };
        entry.cancel.cancel();
        Ok(ended)
    }
}
