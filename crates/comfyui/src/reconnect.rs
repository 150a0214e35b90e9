//! Exponential-backoff reconnection for the ComfyUI push channel.
//!
//! Only the long-lived WebSocket subscription is retried here. REST
//! calls made by the reconciliation engine are single attempts whose
//! failures surface to the caller.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIConnection};

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Default backoff with a custom ceiling.
    pub fn with_max_delay(max_delay: Duration) -> Self {
        Self {
            max_delay,
            ..Default::default()
        }
    }

    /// Calculate the next backoff delay, clamped to [`max_delay`](Self::max_delay).
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms).min(self.max_delay)
    }
}

/// Keep trying to connect until it works or `cancel` fires.
///
/// Waits [`initial_delay`](ReconnectConfig::initial_delay) before the
/// first attempt. Returns `None` on cancellation.
pub async fn reconnect_loop(
    client: &ComfyUIClient,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<ComfyUIConnection> {
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(ws_url = client.ws_url(), "Reconnect cancelled");
                return None;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
        tracing::info!(
            ws_url = client.ws_url(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to ComfyUI",
        );

        tokio::select! {
            _ = cancel.cancelled() => return None,
            result = client.connect() => match result {
                Ok(conn) => {
                    tracing::info!(ws_url = client.ws_url(), attempt, "Reconnected to ComfyUI");
                    return Some(conn);
                }
                Err(e) => {
                    tracing::warn!(
                        ws_url = client.ws_url(),
                        error = %e,
                        "Reconnect attempt {attempt} failed",
                    );
                }
            }
        }

        delay = config.next_delay(delay);
    }
}
