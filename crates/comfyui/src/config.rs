use std::time::Duration;

use crate::events::EVENT_CHANNEL_CAPACITY;

/// Connection settings for one ComfyUI server, loaded from environment
/// variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComfyUIConfig {
    /// HTTP base URL (default: `http://127.0.0.1:8188`).
    pub api_url: String,
    /// WebSocket base URL. Derived from `api_url` unless set explicitly.
    pub ws_url: String,
    /// Per-request HTTP timeout (default: 30 s).
    pub request_timeout: Duration,
    /// Capacity of the push-event and job-event channels (default: `256`).
    pub event_capacity: usize,
    /// Ceiling for the WebSocket reconnect backoff (default: 30 s).
    pub reconnect_max_delay: Duration,
}

impl ComfyUIConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                            | Default                 |
    /// |------------------------------------|-------------------------|
    /// | `COMFYUI_URL`                      | `http://127.0.0.1:8188` |
    /// | `COMFYUI_WS_URL`                   | derived from the above  |
    /// | `COMFYUI_REQUEST_TIMEOUT_SECS`     | `30`                    |
    /// | `COMFYUI_EVENT_CAPACITY`           | `256`                   |
    /// | `COMFYUI_RECONNECT_MAX_DELAY_SECS` | `30`                    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_url = lookup("COMFYUI_URL")
            .unwrap_or_else(|| "http://127.0.0.1:8188".into())
            .trim_end_matches('/')
            .to_string();

        let ws_url = match lookup("COMFYUI_WS_URL") {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => derive_ws_url(&api_url)?,
        };

        let request_timeout_secs: u64 = parse_var(&lookup, "COMFYUI_REQUEST_TIMEOUT_SECS", 30)?;
        let event_capacity: usize =
            parse_var(&lookup, "COMFYUI_EVENT_CAPACITY", EVENT_CHANNEL_CAPACITY)?;
        let reconnect_max_delay_secs: u64 =
            parse_var(&lookup, "COMFYUI_RECONNECT_MAX_DELAY_SECS", 30)?;

        if event_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "COMFYUI_EVENT_CAPACITY",
                value: "0".into(),
            });
        }

        Ok(Self {
            api_url,
            ws_url,
            request_timeout: Duration::from_secs(request_timeout_secs),
            event_capacity,
            reconnect_max_delay: Duration::from_secs(reconnect_max_delay_secs),
        })
    }

    /// Defaults for a server at `api_url`.
    pub fn for_url(api_url: &str) -> Result<Self, ConfigError> {
        let api_url = api_url.to_string();
        Self::from_lookup(move |key| (key == "COMFYUI_URL").then(|| api_url.clone()))
    }
}

/// `http://` becomes `ws://` and `https://` becomes `wss://`.
fn derive_ws_url(api_url: &str) -> Result<String, ConfigError> {
    if let Some(rest) = api_url.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else {
        Err(ConfigError::Invalid {
            key: "COMFYUI_URL",
            value: api_url.to_string(),
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}
