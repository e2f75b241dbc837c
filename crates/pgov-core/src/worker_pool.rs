//! Bounded worker pool for external invocations
//!
//! - A semaphore caps concurrent invocations across all tasks
//! - Every submission carries a cancel token and a deadline
//! - Cancelled or timed-out jobs are aborted, not left running
//! - Pool statistics for monitoring

use crate::error::PoolError;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

/// Cooperative cancellation signal shared by a task and its jobs
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    /// New, not cancelled
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the token; idempotent
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the token has fired
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token fires
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // sender lives in self, so wait_for only returns once the value is true
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Jobs submitted
    pub submitted: u64,
    /// Jobs that produced a result
    pub completed: u64,
    /// Jobs aborted at their deadline
    pub timed_out: u64,
    /// Jobs aborted by their cancel token
    pub cancelled: u64,
    /// Jobs that panicked
    pub panicked: u64,
}

/// Semaphore-bounded job runner
#[derive(Debug)]
pub struct WorkerPool {
    max_concurrent: usize,
    permits: Arc<Semaphore>,
    stats: Mutex<PoolStats>,
}

impl WorkerPool {
    /// Create pool allowing `max_concurrent` jobs at once
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            max_concurrent,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            stats: Mutex::new(PoolStats::default()),
        }
    }

    /// Run `job` on the runtime once a permit is free
    ///
    /// The deadline covers execution, not the wait for a permit.
    ///
    /// # Errors
    /// - `PoolError::Cancelled` if `cancel` fires first
    /// - `PoolError::TimedOut` if the deadline elapses
    /// - `PoolError::Panicked` if the job panics
    pub async fn submit<F, T>(
        &self,
        job: F,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<T, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.stats.lock().submitted += 1;
        if cancel.is_cancelled() {
            return Err(self.record(PoolError::Cancelled));
        }

        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Err(self.record(PoolError::Cancelled)),
            },
            () = cancel.cancelled() => return Err(self.record(PoolError::Cancelled)),
        };

        let handle = tokio::spawn(async move {
            let _permit = permit;
            job.await
        });
        let abort = handle.abort_handle();

        tokio::select! {
            joined = tokio::time::timeout(deadline, handle) => match joined {
                Ok(Ok(value)) => {
                    self.stats.lock().completed += 1;
                    Ok(value)
                }
                Ok(Err(join_err)) => {
                    let message = if join_err.is_panic() {
                        "executor panicked".to_string()
                    } else {
                        join_err.to_string()
                    };
                    Err(self.record(PoolError::Panicked(message)))
                }
                Err(_) => {
                    abort.abort();
                    Err(self.record(PoolError::TimedOut(deadline)))
                }
            },
            () = cancel.cancelled() => {
                abort.abort();
                Err(self.record(PoolError::Cancelled))
            }
        }
    }

    /// Permits not currently held
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Configured concurrency limit
    #[inline]
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Snapshot of pool statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        *self.stats.lock()
    }

    fn record(&self, err: PoolError) -> PoolError {
        let mut stats = self.stats.lock();
        match err {
            PoolError::Cancelled => stats.cancelled += 1,
            PoolError::TimedOut(_) => stats.timed_out += 1,
            PoolError::Panicked(_) => stats.panicked += 1,
        }
        err
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(16)
    }
}
