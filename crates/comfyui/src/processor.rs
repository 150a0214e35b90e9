//! WebSocket message processing loop.
//!
//! Reads raw frames from a ComfyUI WebSocket connection, parses them
//! into typed [`ComfyUIMessage`] variants and forwards them to the
//! notification bridge. No engine work happens on this task.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::client::{ComfyUIClientError, ComfyUIStream};
use crate::jobs::PushEvent;
use crate::messages::parse_message;

/// Why [`process_messages`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The server closed the connection or the stream ended.
    Closed,
    /// The bridge is gone; there is no one left to forward to.
    ReceiverDropped,
}

/// Process WebSocket messages from a ComfyUI connection.
///
/// Loops until the WebSocket closes, encounters a receive error, or the
/// bridge drops its receiver. Text frames that do not parse are logged
/// and skipped.
///
/// Binary frames (preview images) are ignored.
pub async fn process_messages(
    ws_stream: &mut ComfyUIStream,
    push_tx: &mpsc::Sender<PushEvent>,
) -> Result<StreamEnd, ComfyUIClientError> {
    while let Some(msg_result) = ws_stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if !forward_text(&text, push_tx).await {
                    return Ok(StreamEnd::ReceiverDropped);
                }
            }
            Ok(Message::Binary(_)) => {
                tracing::trace!("Ignoring binary message (preview image)");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Handled automatically by tungstenite.
            }
            Ok(Message::Close(frame)) => {
                tracing::info!(?frame, "ComfyUI WebSocket closed");
                return Ok(StreamEnd::Closed);
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                return Err(ComfyUIClientError::Protocol(e.to_string()));
            }
        }
    }
    Ok(StreamEnd::Closed)
}

/// Parse one text frame and hand it to the bridge.
///
/// Returns `false` once the receiving side is closed.
async fn forward_text(text: &str, push_tx: &mpsc::Sender<PushEvent>) -> bool {
    match parse_message(text) {
        Ok(msg) => {
            tracing::trace!(kind = msg.kind(), "ComfyUI message received");
            push_tx.send(PushEvent::Message(msg)).await.is_ok()
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                raw_message = %text,
                "Failed to parse ComfyUI message",
            );
            true
        }
    }
}
