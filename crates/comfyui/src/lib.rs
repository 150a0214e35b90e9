//! ComfyUI client and job-state reconciliation.
//!
//! Provides typed push-message parsing, WebSocket connection management,
//! HTTP API wrappers, reconnection logic, and an engine that tracks the
//! jobs submitted to a ComfyUI server by reconciling its queue and
//! history.

pub mod api;
pub mod client;
pub mod config;
pub mod events;
pub mod jobs;
pub mod manager;
pub mod messages;
pub mod processor;
pub mod reconnect;

pub use config::ComfyUIConfig;
pub use jobs::{JobFuture, JobHandle, JobTracker};
pub use manager::ComfyUIManager;
