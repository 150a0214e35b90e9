//! Turns push-channel messages into engine updates.
//!
//! The WebSocket reader only forwards [`PushEvent`]s into a channel. A
//! single bridge task consumes that channel, so engine logic (including
//! the network calls of a reconciliation pass) never runs on the
//! reader's task.

use std::sync::Arc;

use comfyq_core::types::PromptId;
use tokio::sync::mpsc;

use crate::events::JobEvent;
use crate::messages::ComfyUIMessage;

use super::tracker::JobTracker;

/// What the WebSocket reader forwards to the bridge.
#[derive(Debug, Clone)]
pub enum PushEvent {
    /// A (re)connection succeeded. Events may have been missed meanwhile.
    Connected,
    /// A parsed server message.
    Message(ComfyUIMessage),
    /// The connection dropped.
    Disconnected,
}

/// What the bridge does with one [`PushEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeAction {
    /// Run a full reconciliation pass.
    Reconcile,
    /// Fast-path the job to `Running`, or reconcile if it is unknown.
    Touch(PromptId),
    /// Nothing to do.
    Ignore,
}

/// Decide how to react to a push event.
pub fn classify(event: &PushEvent) -> BridgeAction {
    let message = match event {
        PushEvent::Connected => return BridgeAction::Reconcile,
        PushEvent::Disconnected => return BridgeAction::Ignore,
        PushEvent::Message(message) => message,
    };

    match message {
        ComfyUIMessage::Status(_)
        | ComfyUIMessage::ExecutionSuccess(_)
        | ComfyUIMessage::ExecutionError(_) => BridgeAction::Reconcile,
        ComfyUIMessage::Executing(data) if data.node.is_none() => BridgeAction::Reconcile,
        ComfyUIMessage::Executing(data) => BridgeAction::Touch(data.prompt_id.clone()),
        ComfyUIMessage::ProgressState(data) => BridgeAction::Touch(data.prompt_id.clone()),
        ComfyUIMessage::Progress(data) => BridgeAction::Touch(data.prompt_id.clone()),
        ComfyUIMessage::ExecutionStart(data) => BridgeAction::Touch(data.prompt_id.clone()),
        ComfyUIMessage::ExecutionCached(_) | ComfyUIMessage::Executed(_) => BridgeAction::Ignore,
    }
}

pub struct NotificationBridge {
    tracker: Arc<JobTracker>,
}

impl NotificationBridge {
    pub fn new(tracker: Arc<JobTracker>) -> Self {
        Self { tracker }
    }

    /// Consume events until every sender is dropped.
    pub async fn run(self, mut events: mpsc::Receiver<PushEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        tracing::debug!("Notification bridge stopped");
    }

    /// Apply one event. Failures are logged, never returned, so one bad
    /// pass does not stop delivery of later events.
    pub async fn handle(&self, event: PushEvent) {
        match &event {
            PushEvent::Connected => self.tracker.publish(JobEvent::Connected),
            PushEvent::Disconnected => self.tracker.publish(JobEvent::Disconnected),
            PushEvent::Message(ComfyUIMessage::Progress(data)) => {
                tracing::debug!(
                    prompt_id = %data.prompt_id,
                    node = data.node.as_deref().unwrap_or("-"),
                    value = data.value,
                    max = data.max,
                    percent = data.percent(),
                    "Generation progress",
                );
            }
            PushEvent::Message(ComfyUIMessage::Status(data)) => {
                tracing::debug!(
                    queue_remaining = data.status.exec_info.queue_remaining,
                    "ComfyUI queue status",
                );
            }
            PushEvent::Message(message) => {
                tracing::debug!(kind = message.kind(), "ComfyUI push message");
            }
        }

        let result = match classify(&event) {
            BridgeAction::Reconcile => self.tracker.reconcile().await.map(|_| ()),
            BridgeAction::Touch(prompt_id) => self.tracker.touch(&prompt_id).await,
            BridgeAction::Ignore => Ok(()),
        };

        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to apply ComfyUI push event");
        }
    }
}
