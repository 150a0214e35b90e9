use comfyq_core::types::PromptId;

use crate::api::ComfyUIApiError;

/// Why a job's output future failed. Cloned to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobFailure {
    /// The server finished the job with an error.
    #[error("Job {prompt_id} failed: {}", .message.as_deref().unwrap_or("no error detail reported"))]
    Failed {
        prompt_id: PromptId,
        /// `exception_message` from the server's history, if present.
        message: Option<String>,
    },

    /// The job disappeared from both queue and history between two passes.
    #[error("Job {0} state unknown: no longer in queue or history")]
    UnknownState(PromptId),

    /// The tracker shut down before the job reached a terminal state.
    #[error("Job tracker shut down before job {0} completed")]
    Shutdown(PromptId),
}

/// Errors returned synchronously by tracker operations.
#[derive(Debug, thiserror::Error)]
pub enum JobManagerError {
    /// The id is absent from the registry even after a fresh pass.
    #[error("Job {0} not found")]
    NotFound(PromptId),

    /// A queue/history/delete call failed; local state is unchanged.
    #[error("Transport error: {0}")]
    Transport(#[from] ComfyUIApiError),

    /// The tracker no longer accepts waiters.
    #[error("Job tracker is shut down")]
    ShutDown,

    /// Awaiting the job's outputs failed.
    #[error(transparent)]
    Job(#[from] JobFailure),
}
