//! Job lifecycle events published by the reconciliation engine.
//!
//! Each reconciliation pass compares the previous snapshot with the new
//! one and publishes a [`JobEvent`] per observed transition. Connection
//! events come from the push-channel loop.

use comfyq_core::job::JobStatus;
use comfyq_core::types::PromptId;
use serde::Serialize;

/// Broadcast channel capacity for job events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A state change observed by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// The push channel to the server was established.
    Connected,

    /// The push channel was lost.
    Disconnected,

    /// A job was seen for the first time or changed status.
    StatusChanged {
        prompt_id: PromptId,
        /// `None` when the job was not in the previous snapshot.
        from: Option<JobStatus>,
        to: JobStatus,
    },

    /// A job disappeared from both queue and history.
    Removed {
        prompt_id: PromptId,
        /// Status in the last snapshot that contained it.
        last: JobStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_change_serializes_with_tag() {
        let event = JobEvent::StatusChanged {
            prompt_id: "abc".into(),
            from: None,
            to: JobStatus::Pending,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "status_changed");
        assert_eq!(json["prompt_id"], "abc");
        assert!(json["from"].is_null());
        assert_eq!(json["to"], "pending");
    }

    #[test]
    fn connection_events_are_unit_tags() {
        let json = serde_json::to_value(JobEvent::Connected).unwrap();
        assert_eq!(json, serde_json::json!({"event": "connected"}));
    }
}
