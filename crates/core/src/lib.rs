//! Shared domain types for tracking jobs on a ComfyUI server.

pub mod job;
pub mod types;
