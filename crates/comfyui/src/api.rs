//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (workflow submission, queue and history
//! queries, history/queue deletion, artifact download) using [`reqwest`].

use std::collections::BTreeMap;

use comfyq_core::job::JobOutput;
use comfyq_core::types::PromptId;
use serde::{Deserialize, Serialize};

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: PromptId,
    /// Position in the execution queue.
    pub number: i64,
    /// Per-node validation errors. Shape varies between server versions.
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

/// Body of `GET /queue`.
#[derive(Debug, Default, Deserialize)]
pub struct QueueResponse {
    #[serde(default)]
    pub queue_running: Vec<QueueEntry>,
    #[serde(default)]
    pub queue_pending: Vec<QueueEntry>,
}

/// One queue entry.
///
/// ComfyUI encodes entries as arrays: `[number, prompt_id, prompt,
/// extra_data, outputs_to_execute]`. Older servers send four elements,
/// so only the first two positions are read.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Vec<serde_json::Value>")]
pub struct QueueEntry {
    pub number: i64,
    pub prompt_id: PromptId,
}

impl TryFrom<Vec<serde_json::Value>> for QueueEntry {
    type Error = String;

    fn try_from(fields: Vec<serde_json::Value>) -> Result<Self, Self::Error> {
        let number = fields
            .first()
            .and_then(serde_json::Value::as_i64)
            .ok_or("queue entry is missing its number")?;
        let prompt_id = fields
            .get(1)
            .and_then(serde_json::Value::as_str)
            .ok_or("queue entry is missing its prompt id")?;

        Ok(Self {
            number,
            prompt_id: prompt_id.to_string(),
        })
    }
}

/// Body of `GET /history`: prompt id to history entry.
pub type HistoryResponse = BTreeMap<PromptId, HistoryEntry>;

/// A finished prompt as reported by `GET /history`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    /// Files produced per node id.
    #[serde(default)]
    pub outputs: BTreeMap<String, NodeOutput>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

/// Output lists of a single node. Nodes report files under different
/// keys depending on the media they produce.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<OutputFile>,
    #[serde(default)]
    pub gifs: Vec<OutputFile>,
    #[serde(default)]
    pub audio: Vec<OutputFile>,
}

/// A file reference inside a [`NodeOutput`].
#[derive(Debug, Clone, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Execution status attached to a history entry.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryStatus {
    pub status_str: String,
    #[serde(default)]
    pub completed: bool,
    /// `[name, payload]` pairs such as `["execution_error", {...}]`.
    #[serde(default)]
    pub messages: Vec<(String, serde_json::Value)>,
}

impl HistoryEntry {
    /// A history entry counts as successful only when the server says so
    /// explicitly. Entries without a status are treated as failed.
    pub fn is_success(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.status_str.eq_ignore_ascii_case("success"))
    }

    /// Flatten every node's files into one list, ordered by node id.
    pub fn job_outputs(&self) -> Vec<JobOutput> {
        self.outputs
            .iter()
            .flat_map(|(node, output)| {
                output
                    .images
                    .iter()
                    .chain(&output.gifs)
                    .chain(&output.audio)
                    .map(move |file| JobOutput {
                        node: node.clone(),
                        filename: file.filename.clone(),
                        subfolder: file.subfolder.clone(),
                        kind: file.kind.clone(),
                    })
            })
            .collect()
    }

    /// The `exception_message` of the last `execution_error` status
    /// message, if the server recorded one.
    pub fn error_message(&self) -> Option<String> {
        self.status
            .as_ref()?
            .messages
            .iter()
            .rev()
            .find(|(name, _)| name == "execution_error")
            .and_then(|(_, payload)| payload.get("exception_message"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
    }
}

/// Body of `POST /history` and `POST /queue`.
///
/// Either deletes specific prompts or clears everything. Clients should
/// not send both at once; the server resolves that case on its own terms.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeleteRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub delete: Vec<PromptId>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub clear: bool,
}

impl DeleteRequest {
    /// Delete only the given prompt ids.
    pub fn ids(ids: impl IntoIterator<Item = PromptId>) -> Self {
        Self {
            delete: ids.into_iter().collect(),
            clear: false,
        }
    }

    /// Remove every entry.
    pub fn clear_all() -> Self {
        Self {
            delete: Vec::new(),
            clear: true,
        }
    }
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, decoding, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// A 2xx body that is not the JSON we expected.
    #[error("Failed to decode ComfyUI response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`]
    /// (useful for custom timeouts or connection pooling).
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        let api_url = api_url.trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    /// HTTP API base URL without a trailing slash.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow JSON and
    /// client ID. Progress events for the prompt are delivered to the
    /// WebSocket connected with the same client ID.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Fetch the pending and running queue.
    pub async fn get_queue(&self) -> Result<QueueResponse, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/queue", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Fetch the full execution history.
    ///
    /// An empty or `null` body is treated as an empty history.
    pub async fn get_history(&self) -> Result<HistoryResponse, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history", self.api_url))
            .send()
            .await?;

        let body = Self::ensure_success(response).await?.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(HistoryResponse::new());
        }

        let history: Option<HistoryResponse> = serde_json::from_slice(&body)?;
        Ok(history.unwrap_or_default())
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request. The server answers
    /// with a map that is empty when the prompt is unknown.
    ///
    /// Reconciliation always reads the full history; this is for callers
    /// that need a single entry, such as the worker's final report.
    pub async fn get_prompt_history(
        &self,
        prompt_id: &str,
    ) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        let mut history: HistoryResponse = Self::parse_response(response).await?;
        Ok(history.remove(prompt_id))
    }

    /// Delete history entries (`POST /history`).
    pub async fn delete_history(&self, request: &DeleteRequest) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .post(format!("{}/history", self.api_url))
            .json(request)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Remove pending prompts from the queue (`POST /queue`).
    ///
    /// This does not interrupt a prompt that is already executing.
    pub async fn delete_queued(&self, request: &DeleteRequest) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(request)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Download the bytes of a produced artifact (`GET /view`).
    pub async fn view(&self, output: &JobOutput) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", output.filename.as_str()),
                ("subfolder", output.subfolder.as_str()),
                ("type", output.kind.as_str()),
            ])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}
