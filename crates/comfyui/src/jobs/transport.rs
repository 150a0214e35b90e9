//! The calls the reconciliation engine makes against the server.
//!
//! The engine only depends on [`JobTransport`]; [`ComfyUIApi`] is the
//! production implementation and tests substitute in-memory fakes.

use async_trait::async_trait;

use crate::api::{ComfyUIApi, ComfyUIApiError, DeleteRequest, HistoryResponse, QueueResponse};

#[async_trait]
pub trait JobTransport: Send + Sync {
    /// Pending and running queue entries.
    async fn get_queue(&self) -> Result<QueueResponse, ComfyUIApiError>;

    /// Every history entry the server still holds.
    async fn get_history(&self) -> Result<HistoryResponse, ComfyUIApiError>;

    /// Remove history entries.
    async fn delete_history(&self, request: &DeleteRequest) -> Result<(), ComfyUIApiError>;

    /// Remove pending queue entries.
    async fn delete_queued(&self, request: &DeleteRequest) -> Result<(), ComfyUIApiError>;
}

#[async_trait]
impl JobTransport for ComfyUIApi {
    async fn get_queue(&self) -> Result<QueueResponse, ComfyUIApiError> {
        ComfyUIApi::get_queue(self).await
    }

    async fn get_history(&self) -> Result<HistoryResponse, ComfyUIApiError> {
        ComfyUIApi::get_history(self).await
    }

    async fn delete_history(&self, request: &DeleteRequest) -> Result<(), ComfyUIApiError> {
        ComfyUIApi::delete_history(self, request).await
    }

    async fn delete_queued(&self, request: &DeleteRequest) -> Result<(), ComfyUIApiError> {
        ComfyUIApi::delete_queued(self, request).await
    }
}
