//! Futures handed out to callers waiting for a job to finish.
//!
//! Holds at most one pending [`JobFuture`] per prompt id. Futures are
//! registered by callers and settled by the reconciler at the moment the
//! job turns terminal or disappears.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use comfyq_core::job::{JobRecord, JobStatus};
use comfyq_core::types::PromptId;

use super::error::{JobFailure, JobManagerError};
use super::future::{JobFuture, JobResult};
use super::registry::{JobRegistry, Snapshot};

#[derive(Default)]
struct WaitState {
    pending: HashMap<PromptId, JobFuture>,
    closed: bool,
}

#[derive(Default)]
pub struct WaitRegistry {
    state: Mutex<WaitState>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pending future for `prompt_id`, if one was registered.
    pub fn existing(&self, prompt_id: &str) -> Option<JobFuture> {
        self.lock().pending.get(prompt_id).cloned()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of futures still waiting for a terminal state.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Return the existing future, a settled one for a terminal job, or
    /// register a fresh pending future.
    ///
    /// The registry is read while holding the wait lock. The reconciler
    /// publishes its snapshot before taking this lock to settle futures,
    /// so a future registered against an older snapshot is still seen by
    /// that pass.
    pub fn get_or_register(
        &self,
        prompt_id: &str,
        registry: &JobRegistry,
    ) -> Result<JobFuture, JobManagerError> {
        let mut state = self.lock();
        if state.closed {
            return Err(JobManagerError::ShutDown);
        }
        if let Some(future) = state.pending.get(prompt_id) {
            return Ok(future.clone());
        }

        let record = registry
            .get(prompt_id)
            .ok_or_else(|| JobManagerError::NotFound(prompt_id.to_string()))?;

        if record.status.is_terminal() {
            return Ok(JobFuture::settled(prompt_id.to_string(), outcome(&record)));
        }

        let future = JobFuture::pending(prompt_id.to_string());
        state.pending.insert(prompt_id.to_string(), future.clone());
        tracing::debug!(prompt_id, "Registered job waiter");
        Ok(future)
    }

    /// Settle futures after a reconciliation pass.
    ///
    /// Jobs that are terminal in `snapshot` resolve or fail by their
    /// status; ids in `vanished` fail with [`JobFailure::UnknownState`].
    /// Returns how many futures were settled.
    pub fn settle(&self, snapshot: &Snapshot, vanished: &[PromptId]) -> usize {
        let mut state = self.lock();
        let mut settled = 0;

        for record in snapshot.values().filter(|r| r.status.is_terminal()) {
            if let Some(future) = state.pending.remove(&record.prompt_id) {
                if settle_future(&future, outcome(record)) {
                    settled += 1;
                }
            }
        }

        for prompt_id in vanished {
            if let Some(future) = state.pending.remove(prompt_id) {
                tracing::warn!(prompt_id = %prompt_id, "Job vanished from queue and history");
                if future.fail(JobFailure::UnknownState(prompt_id.clone())) {
                    settled += 1;
                }
            }
        }

        settled
    }

    /// Stop accepting waiters and fail every pending future.
    pub fn close(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        let drained: Vec<_> = state.pending.drain().collect();
        drop(state);

        for (prompt_id, future) in &drained {
            future.fail(JobFailure::Shutdown(prompt_id.clone()));
        }
        drained.len()
    }

    fn lock(&self) -> MutexGuard<'_, WaitState> {
        // Every mutation leaves the map consistent, so a poisoned lock is safe to reuse.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Outcome delivered to waiters of a terminal record.
fn outcome(record: &JobRecord) -> JobResult {
    match record.status {
        JobStatus::Success => Ok(record.outputs.clone().unwrap_or_default()),
        _ => Err(JobFailure::Failed {
            prompt_id: record.prompt_id.clone(),
            message: record.error_message.clone(),
        }),
    }
}

fn settle_future(future: &JobFuture, result: JobResult) -> bool {
    match result {
        Ok(outputs) => future.resolve(outputs),
        Err(failure) => future.fail(failure),
    }
}
