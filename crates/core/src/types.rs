/// ComfyUI prompt identifiers are server-assigned UUID strings.
pub type PromptId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
