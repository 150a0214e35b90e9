//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`. This module deserializes them
//! into a strongly-typed [`ComfyUIMessage`] enum.

use std::collections::BTreeMap;

use comfyq_core::types::PromptId;
use serde::Deserialize;

/// All known ComfyUI WebSocket message types.
///
/// Deserialized via the adjacently-tagged `"type"` field with
/// associated `"data"` content.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth, etc.).
    #[serde(rename = "status")]
    Status(StatusData),

    /// Per-node progress snapshot for one prompt.
    #[serde(rename = "progress_state")]
    ProgressState(ProgressStateData),

    /// Progress update from a long-running node (e.g. KSampler).
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A prompt has started executing.
    #[serde(rename = "execution_start")]
    ExecutionStart(ExecutionStartData),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// A specific node is currently executing (or execution finished when `node` is `None`).
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// A node has finished and produced output.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// The whole prompt finished without error.
    #[serde(rename = "execution_success")]
    ExecutionSuccess(ExecutionSuccessData),

    /// Execution failed with an error.
    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),
}

impl ComfyUIMessage {
    /// Wire name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::ProgressState(_) => "progress_state",
            Self::Progress(_) => "progress",
            Self::ExecutionStart(_) => "execution_start",
            Self::ExecutionCached(_) => "execution_cached",
            Self::Executing(_) => "executing",
            Self::Executed(_) => "executed",
            Self::ExecutionSuccess(_) => "execution_success",
            Self::ExecutionError(_) => "execution_error",
        }
    }
}

/// Queue status information.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
    /// Session id, only present on the first status message after connect.
    #[serde(default)]
    pub sid: Option<String>,
}

/// Current queue state.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

/// Execution queue statistics.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload for `progress_state` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressStateData {
    pub prompt_id: PromptId,
    /// Progress per node id.
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeProgress>,
}

/// Progress of a single node inside a `progress_state` message.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeProgress {
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// `pending`, `running` or `finished`.
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub display_node_id: Option<String>,
    #[serde(default)]
    pub parent_node_id: Option<String>,
    #[serde(default)]
    pub real_node_id: Option<String>,
}

/// Payload for `progress` messages (step-level progress within a node).
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    /// Current step number.
    pub value: i32,
    /// Total number of steps.
    pub max: i32,
    pub prompt_id: PromptId,
    #[serde(default)]
    pub node: Option<String>,
}

impl ProgressData {
    /// Completion percentage (0-100). Zero when `max` is not positive.
    pub fn percent(&self) -> i16 {
        if self.max > 0 {
            ((self.value as f64 / self.max as f64) * 100.0) as i16
        } else {
            0
        }
    }
}

/// Payload for `execution_start` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: PromptId,
}

/// Payload for `execution_cached` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: PromptId,
    /// Node IDs whose outputs were served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload for `executing` messages.
///
/// When `node` is `None`, execution of the prompt has completed.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    pub prompt_id: PromptId,
}

/// Payload for `executed` messages (node output).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    /// The node that produced this output.
    pub node: String,
    /// Raw output value (images, filenames, etc.).
    pub output: serde_json::Value,
    pub prompt_id: PromptId,
}

/// Payload for `execution_success` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSuccessData {
    pub prompt_id: PromptId,
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: PromptId,
    pub node_id: String,
    pub exception_message: String,
    pub exception_type: String,
}

/// Parse a ComfyUI WebSocket text message into a typed enum.
///
/// Returns `Err` for malformed JSON or unknown `type` values.
/// Callers should log unknown types and continue.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_message() {
        let json = r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":3}},"sid":"s1"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::Status(data) => {
                assert_eq!(data.status.exec_info.queue_remaining, 3);
                assert_eq!(data.sid.as_deref(), Some("s1"));
            }
            other => panic!("Expected Status, got {other:?}"),
        }
    }

    #[test]
    fn parse_status_without_sid() {
        let json = r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":0}}}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::Status(data) => assert!(data.sid.is_none()),
            other => panic!("Expected Status, got {other:?}"),
        }
    }

    #[test]
    fn parse_progress_state_message() {
        let json = r#"{"type":"progress_state","data":{"prompt_id":"abc","nodes":{
            "3":{"value":4.0,"max":20.0,"state":"running","node_id":"3","prompt_id":"abc",
                 "display_node_id":"3","parent_node_id":null,"real_node_id":"3"}}}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::ProgressState(data) => {
                assert_eq!(data.prompt_id, "abc");
                let node = &data.nodes["3"];
                assert_eq!(node.state.as_deref(), Some("running"));
                assert_eq!(node.max, Some(20.0));
                assert!(node.parent_node_id.is_none());
            }
            other => panic!("Expected ProgressState, got {other:?}"),
        }
    }

    #[test]
    fn parse_progress_message() {
        let json = r#"{"type":"progress","data":{"value":5,"max":20,"prompt_id":"abc","node":"3"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::Progress(data) => {
                assert_eq!(data.value, 5);
                assert_eq!(data.max, 20);
                assert_eq!(data.prompt_id, "abc");
                assert_eq!(data.node.as_deref(), Some("3"));
                assert_eq!(data.percent(), 25);
            }
            other => panic!("Expected Progress, got {other:?}"),
        }
    }

    #[test]
    fn progress_percent_with_zero_max() {
        let data = ProgressData {
            value: 3,
            max: 0,
            prompt_id: "abc".into(),
            node: None,
        };
        assert_eq!(data.percent(), 0);
    }

    #[test]
    fn parse_execution_start_message() {
        let json = r#"{"type":"execution_start","data":{"prompt_id":"abc-123"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::ExecutionStart(data) => {
                assert_eq!(data.prompt_id, "abc-123");
            }
            other => panic!("Expected ExecutionStart, got {other:?}"),
        }
    }

    #[test]
    fn parse_execution_cached_without_nodes() {
        let json = r#"{"type":"execution_cached","data":{"prompt_id":"abc"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::ExecutionCached(data) => {
                assert!(data.nodes.is_empty());
            }
            other => panic!("Expected ExecutionCached, got {other:?}"),
        }
    }

    #[test]
    fn parse_executing_finished() {
        let json = r#"{"type":"executing","data":{"node":null,"prompt_id":"xyz"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::Executing(data) => {
                assert!(data.node.is_none());
                assert_eq!(data.prompt_id, "xyz");
            }
            other => panic!("Expected Executing, got {other:?}"),
        }
    }

    #[test]
    fn parse_executed_message() {
        let json = r#"{"type":"executed","data":{"node":"9","output":{"images":[{"filename":"out.png"}]},"prompt_id":"abc"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::Executed(data) => {
                assert_eq!(data.node, "9");
                assert!(data.output.is_object());
            }
            other => panic!("Expected Executed, got {other:?}"),
        }
    }

    #[test]
    fn parse_execution_success_message() {
        let json = r#"{"type":"execution_success","data":{"prompt_id":"abc","timestamp":1700000000}}"#;
        let msg = parse_message(json).unwrap();
        assert_eq!(msg.kind(), "execution_success");
    }

    #[test]
    fn parse_execution_error_message() {
        let json = r#"{"type":"execution_error","data":{"prompt_id":"abc","node_id":"5","exception_message":"out of memory","exception_type":"RuntimeError"}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            ComfyUIMessage::ExecutionError(data) => {
                assert_eq!(data.node_id, "5");
                assert_eq!(data.exception_message, "out of memory");
                assert_eq!(data.exception_type, "RuntimeError");
            }
            other => panic!("Expected ExecutionError, got {other:?}"),
        }
    }

    #[test]
    fn parse_unknown_type_returns_error() {
        let json = r#"{"type":"crystools.monitor","data":{}}"#;
        assert!(parse_message(json).is_err());
    }

    #[test]
    fn parse_invalid_json_returns_error() {
        assert!(parse_message("not json at all").is_err());
    }
}
