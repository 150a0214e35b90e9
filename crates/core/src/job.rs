//! Job model shared by the reconciliation engine and its callers.
//!
//! A job is one prompt queued on a ComfyUI server. Its lifecycle only
//! moves forward: `Pending -> Running -> {Success | Error}`.

use serde::{Deserialize, Serialize};

use crate::types::{PromptId, Timestamp};

/// Lifecycle state of a job as seen by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the server queue.
    Pending,
    /// Currently executing on the server.
    Running,
    /// Finished successfully; outputs are available.
    Success,
    /// Finished with an error.
    Error,
    /// Not present in the queue or history. Never stored in a snapshot.
    None,
}

impl JobStatus {
    /// `Success` and `Error` are terminal: no further transitions occur.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    /// Wire/log name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::None => "none",
        }
    }

    /// Position along the forward-only lifecycle. `None` sorts first.
    fn rank(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Pending => 1,
            Self::Running => 2,
            Self::Success | Self::Error => 3,
        }
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    ///
    /// Staying in the same state is allowed; a terminal state never moves.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return self == next;
        }
        next.rank() >= self.rank()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One artifact produced by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    /// Id of the node in the workflow graph that produced the file.
    pub node: String,
    pub filename: String,
    pub subfolder: String,
    /// Storage bucket on the server (`output`, `temp`, ...).
    #[serde(rename = "type")]
    pub kind: String,
}

/// The engine's view of one job at the time of a reconciliation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub prompt_id: PromptId,
    pub status: JobStatus,
    pub last_update: Timestamp,
    /// Present once the job is known from history.
    pub outputs: Option<Vec<JobOutput>>,
    /// Server-reported failure detail for `Error` records, if any.
    pub error_message: Option<String>,
}

impl JobRecord {
    /// A queue-derived record (`Pending` or `Running`) without outputs.
    pub fn queued(prompt_id: PromptId, status: JobStatus, now: Timestamp) -> Self {
        Self {
            prompt_id,
            status,
            last_update: now,
            outputs: None,
            error_message: None,
        }
    }
}
