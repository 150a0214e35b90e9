use std::sync::Arc;

use comfyq_core::job::{JobOutput, JobStatus};
use comfyq_core::types::PromptId;

use super::error::JobManagerError;
use super::future::JobFuture;
use super::tracker::JobTracker;

/// A submitted job.
///
/// Created from the submission response; the queue position is captured
/// once and never refreshed.
#[derive(Clone)]
pub struct JobHandle {
    prompt_id: PromptId,
    queue_number: i64,
    tracker: Arc<JobTracker>,
}

impl JobHandle {
    pub fn new(prompt_id: PromptId, queue_number: i64, tracker: Arc<JobTracker>) -> Self {
        Self {
            prompt_id,
            queue_number,
            tracker,
        }
    }

    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    /// Queue position reported at submission time.
    pub fn queue_number(&self) -> i64 {
        self.queue_number
    }

    /// Last known status. `None` until the first pass that sees the job,
    /// and again once it is removed from the server.
    pub fn status(&self) -> JobStatus {
        self.tracker.status(&self.prompt_id)
    }

    /// Future of this job's outputs. Concurrent calls share one future.
    pub async fn outputs(&self) -> Result<JobFuture, JobManagerError> {
        self.tracker.future(&self.prompt_id).await
    }

    /// Wait for the job to finish and return its outputs.
    pub async fn wait(&self) -> Result<Vec<JobOutput>, JobManagerError> {
        Ok(self.outputs().await?.wait().await?)
    }

    /// Delete the job from the server queue and history.
    ///
    /// Fetch outputs first: once released, the job is gone from history
    /// and any pending future fails. Calling this again is harmless.
    pub async fn release(&self) -> Result<(), JobManagerError> {
        self.tracker.release(&self.prompt_id).await
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("prompt_id", &self.prompt_id)
            .field("queue_number", &self.queue_number)
            .finish()
    }
}
