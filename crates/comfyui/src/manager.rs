//! ComfyUI connection manager.
//!
//! [`ComfyUIManager`] wires the REST client, the WebSocket push channel
//! and the job tracker together for one ComfyUI server. It spawns two
//! long-lived tasks: the connection loop (connect -> process ->
//! reconnect), which forwards push events into a channel, and the
//! notification bridge, which consumes that channel and drives the
//! tracker.
//!
//! Job events are broadcast via a [`tokio::sync::broadcast`] channel.
//! Call [`ComfyUIManager::subscribe`] to receive them.

use std::sync::Arc;
use std::time::Duration;

use comfyq_core::job::JobOutput;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, ComfyUIApiError, HistoryEntry};
use crate::client::ComfyUIClient;
use crate::config::ComfyUIConfig;
use crate::events::JobEvent;
use crate::jobs::{JobHandle, JobManagerError, JobTracker, NotificationBridge, PushEvent};
use crate::processor::{process_messages, StreamEnd};
use crate::reconnect::{reconnect_loop, ReconnectConfig};

/// How long [`ComfyUIManager::shutdown`] waits for each task.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Manages the connection to a ComfyUI server and the jobs submitted
/// through it.
///
/// Created once via [`ComfyUIManager::start`]. The returned `Arc` can be
/// cheaply cloned into whatever needs to submit work.
pub struct ComfyUIManager {
    api: Arc<ComfyUIApi>,
    tracker: Arc<JobTracker>,
    /// Sent with every submission so the server routes progress for
    /// those prompts to our WebSocket.
    client_id: String,
    /// Master cancellation token -- cancelled during shutdown.
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ComfyUIManager {
    /// Build the clients and tracker, then spawn the connection and
    /// bridge tasks. Must be called from within a tokio runtime.
    pub fn start(config: ComfyUIConfig) -> Result<Arc<Self>, ComfyUIManagerError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(ComfyUIManagerError::HttpClient)?;
        let api = Arc::new(ComfyUIApi::with_client(http, config.api_url.clone()));
        let tracker = JobTracker::with_event_capacity(api.clone(), config.event_capacity);

        let client_id = uuid::Uuid::new_v4().to_string();
        let client = ComfyUIClient::new(config.ws_url.clone(), client_id.clone());
        let reconnect = ReconnectConfig::with_max_delay(config.reconnect_max_delay);
        let cancel = CancellationToken::new();
        let (push_tx, push_rx) = mpsc::channel(config.event_capacity);

        tracing::info!(
            api_url = %config.api_url,
            ws_url = %config.ws_url,
            client_id = %client_id,
            "Starting ComfyUI manager",
        );

        let connection_cancel = cancel.clone();
        let connection = tokio::spawn(async move {
            run_connection_loop(&client, &push_tx, &reconnect, &connection_cancel).await;
            tracing::info!("Connection task exited");
        });

        let bridge = NotificationBridge::new(Arc::clone(&tracker));
        let bridge = tokio::spawn(bridge.run(push_rx));

        Ok(Arc::new(Self {
            api,
            tracker,
            client_id,
            cancel,
            tasks: Mutex::new(vec![connection, bridge]),
        }))
    }

    /// Subscribe to job and connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tracker.subscribe()
    }

    /// The job tracker, for status queries beyond a single handle.
    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Queue a workflow and return a handle to the new job.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
    ) -> Result<JobHandle, ComfyUIManagerError> {
        if self.cancel.is_cancelled() {
            return Err(ComfyUIManagerError::ShutDown);
        }

        let response = self.api.submit_workflow(workflow, &self.client_id).await?;

        tracing::info!(
            prompt_id = %response.prompt_id,
            queue_number = response.number,
            "Workflow submitted to ComfyUI",
        );

        Ok(JobHandle::new(
            response.prompt_id,
            response.number,
            Arc::clone(&self.tracker),
        ))
    }

    /// Download the bytes of one output artifact.
    pub async fn view(&self, output: &JobOutput) -> Result<Vec<u8>, ComfyUIManagerError> {
        Ok(self.api.view(output).await?)
    }

    /// The server's history entry for `prompt_id`, if it has one.
    pub async fn history_entry(
        &self,
        prompt_id: &str,
    ) -> Result<Option<HistoryEntry>, ComfyUIManagerError> {
        Ok(self.api.get_prompt_history(prompt_id).await?)
    }

    /// Delete the entire server history.
    pub async fn clear_history(&self) -> Result<(), ComfyUIManagerError> {
        Ok(self.tracker.clear_history().await?)
    }

    /// Gracefully shut down.
    ///
    /// Cancels the master token, waits up to 5 seconds per task for a
    /// clean exit, then fails every future still waiting on a job.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down ComfyUI manager");
        self.cancel.cancel();

        let mut tasks = self.tasks.lock().await;
        for mut task in tasks.drain(..) {
            if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                tracing::warn!("Task did not stop in time, aborting");
                task.abort();
            }
        }

        self.tracker.shutdown();
        tracing::info!("ComfyUI manager shut down complete");
    }
}

/// Core connection loop: connect -> process messages -> reconnect.
///
/// Runs until the cancellation token is triggered or the bridge goes
/// away. Returning drops `push_tx`, which ends the bridge task.
async fn run_connection_loop(
    client: &ComfyUIClient,
    push_tx: &mpsc::Sender<PushEvent>,
    reconnect: &ReconnectConfig,
    cancel: &CancellationToken,
) {
    let first = tokio::select! {
        _ = cancel.cancelled() => return,
        result = client.connect() => result,
    };

    let mut conn = match first {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(error = %e, "Connection failed, entering reconnect loop");
            match reconnect_loop(client, reconnect, cancel).await {
                Some(conn) => conn,
                None => return, // cancelled
            }
        }
    };

    loop {
        if push_tx.send(PushEvent::Connected).await.is_err() {
            return;
        }

        // Process messages until the connection drops.
        let mut ws_stream = conn.ws_stream;
        let end = tokio::select! {
            _ = cancel.cancelled() => return,
            end = process_messages(&mut ws_stream, push_tx) => end,
        };

        match end {
            Ok(StreamEnd::ReceiverDropped) => return,
            Ok(StreamEnd::Closed) => {}
            Err(e) => tracing::error!(error = %e, "WebSocket receive error"),
        }

        // The connection has dropped.
        if push_tx.send(PushEvent::Disconnected).await.is_err() || cancel.is_cancelled() {
            return;
        }

        tracing::info!("Connection lost, entering reconnect loop");
        conn = match reconnect_loop(client, reconnect, cancel).await {
            Some(conn) => conn,
            None => return, // cancelled
        };
    }
}

/// Errors that can occur when interacting with the manager.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIManagerError {
    /// The HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(reqwest::Error),

    /// A REST call (submission, download) failed.
    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    /// A job tracker operation failed.
    #[error(transparent)]
    Jobs(#[from] JobManagerError),

    /// [`ComfyUIManager::shutdown`] has been called.
    #[error("ComfyUI manager is shut down")]
    ShutDown,
}
