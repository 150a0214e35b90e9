//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the connection configuration for a single
//! ComfyUI instance. Call [`ComfyUIClient::connect`] to establish a
//! live [`ComfyUIConnection`] over WebSocket.

use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// Raw WebSocket stream type used by the reader loop.
pub type ComfyUIStream =
    tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for a ComfyUI push channel.
///
/// Stores the WebSocket URL and the client id that submissions are
/// tagged with, so that ComfyUI routes progress events for those
/// prompts to this connection.
pub struct ComfyUIClient {
    ws_url: String,
    client_id: String,
}

/// A live WebSocket connection to a ComfyUI instance.
pub struct ComfyUIConnection {
    /// Client id sent during the WebSocket handshake.
    pub client_id: String,
    /// The raw WebSocket stream for reading/writing frames.
    pub ws_stream: ComfyUIStream,
}

impl ComfyUIClient {
    /// Create a new client.
    ///
    /// * `ws_url`    - WebSocket base URL, e.g. `ws://host:8188`.
    /// * `client_id` - id to announce in the handshake and on submissions.
    pub fn new(ws_url: String, client_id: String) -> Self {
        let ws_url = ws_url.trim_end_matches('/').to_string();
        Self { ws_url, client_id }
    }

    /// WebSocket base URL (e.g. `ws://host:8188`).
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Client id announced to the server.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Full endpoint URL including the `clientId` query parameter.
    pub fn endpoint(&self) -> String {
        format!("{}/ws?clientId={}", self.ws_url, self.client_id)
    }

    /// Connect to the ComfyUI WebSocket endpoint.
    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let (ws_stream, _response) = connect_async(self.endpoint()).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            client_id = %self.client_id,
            "Connected to ComfyUI at {}",
            self.ws_url,
        );

        Ok(ComfyUIConnection {
            client_id: self.client_id.clone(),
            ws_stream,
        })
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the initial WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an already-established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_includes_client_id() {
        let client = ComfyUIClient::new("ws://host:8188/".into(), "c-1".into());
        assert_eq!(client.ws_url(), "ws://host:8188");
        assert_eq!(client.endpoint(), "ws://host:8188/ws?clientId=c-1");
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let client = ComfyUIClient::new("ws://127.0.0.1:9".into(), "c-1".into());
        let result = client.connect().await;
        assert!(matches!(result, Err(ComfyUIClientError::Connection(_))));
    }
}
