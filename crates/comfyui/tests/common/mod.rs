//! Shared fixtures for engine integration tests.
//!
//! [`FakeServer`] is an in-memory [`JobTransport`] that counts round trips
//! and can be made slow or failing.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use comfyq_comfyui::api::{
    ComfyUIApiError, DeleteRequest, HistoryEntry, HistoryResponse, HistoryStatus, NodeOutput,
    OutputFile, QueueEntry, QueueResponse,
};
use comfyq_comfyui::jobs::{JobTracker, JobTransport, PushEvent};
use comfyq_comfyui::messages::parse_message;

#[derive(Default)]
struct ServerState {
    pending: Vec<String>,
    running: Vec<String>,
    history: HistoryResponse,
}

#[derive(Default)]
pub struct FakeServer {
    state: Mutex<ServerState>,
    queue_calls: AtomicUsize,
    history_calls: AtomicUsize,
    delay_ms: AtomicUsize,
    failing: AtomicBool,
    deletes: Mutex<Vec<(&'static str, DeleteRequest)>>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A tracker backed by this server.
    pub fn tracker(self: &Arc<Self>) -> Arc<JobTracker> {
        JobTracker::new(Arc::clone(self) as Arc<dyn JobTransport>)
    }

    pub fn set_queue(&self, pending: &[&str], running: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state.pending = pending.iter().map(|s| s.to_string()).collect();
        state.running = running.iter().map(|s| s.to_string()).collect();
    }

    /// Move `prompt_id` out of the queue and into history.
    pub fn finish(&self, prompt_id: &str, entry: HistoryEntry) {
        let mut state = self.state.lock().unwrap();
        state.pending.retain(|id| id != prompt_id);
        state.running.retain(|id| id != prompt_id);
        state.history.insert(prompt_id.to_string(), entry);
    }

    /// Drop `prompt_id` from queue and history without a trace.
    pub fn forget(&self, prompt_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.pending.retain(|id| id != prompt_id);
        state.running.retain(|id| id != prompt_id);
        state.history.remove(prompt_id);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Completed or attempted `GET /queue` calls. One per pass.
    pub fn round_trips(&self) -> usize {
        self.queue_calls.load(Ordering::SeqCst)
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> Vec<(&'static str, DeleteRequest)> {
        self.deletes.lock().unwrap().clone()
    }

    fn check_failing(&self) -> Result<(), ComfyUIApiError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(ComfyUIApiError::ApiError {
                status: 503,
                body: "unavailable".into(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobTransport for FakeServer {
    async fn get_queue(&self) -> Result<QueueResponse, ComfyUIApiError> {
        self.queue_calls.fetch_add(1, Ordering::SeqCst);

        // The queue is read when the request arrives; the delay only holds
        // back the response.
        let response = {
            let state = self.state.lock().unwrap();
            let entries = |ids: &[String]| -> Vec<QueueEntry> {
                ids.iter()
                    .enumerate()
                    .map(|(number, id)| QueueEntry {
                        number: number as i64,
                        prompt_id: id.clone(),
                    })
                    .collect()
            };
            QueueResponse {
                queue_running: entries(&state.running),
                queue_pending: entries(&state.pending),
            }
        };

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        self.check_failing()?;
        Ok(response)
    }

    async fn get_history(&self) -> Result<HistoryResponse, ComfyUIApiError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;
        Ok(self.state.lock().unwrap().history.clone())
    }

    async fn delete_history(&self, request: &DeleteRequest) -> Result<(), ComfyUIApiError> {
        self.check_failing()?;
        self.deletes.lock().unwrap().push(("history", request.clone()));

        let mut state = self.state.lock().unwrap();
        if request.clear {
            state.history.clear();
        }
        for id in &request.delete {
            state.history.remove(id);
        }
        Ok(())
    }

    async fn delete_queued(&self, request: &DeleteRequest) -> Result<(), ComfyUIApiError> {
        self.check_failing()?;
        self.deletes.lock().unwrap().push(("queue", request.clone()));

        let mut state = self.state.lock().unwrap();
        if request.clear {
            state.pending.clear();
        }
        state.pending.retain(|id| !request.delete.contains(id));
        Ok(())
    }
}

/// A successful history entry with one image per `(node, filename)`.
pub fn success_entry(files: &[(&str, &str)]) -> HistoryEntry {
    let mut outputs: BTreeMap<String, NodeOutput> = BTreeMap::new();
    for (node, filename) in files {
        outputs
            .entry(node.to_string())
            .or_default()
            .images
            .push(OutputFile {
                filename: filename.to_string(),
                subfolder: String::new(),
                kind: "output".into(),
            });
    }
    HistoryEntry {
        outputs,
        status: Some(HistoryStatus {
            status_str: "success".into(),
            completed: true,
            messages: vec![],
        }),
    }
}

/// A failed history entry carrying `exception_message`.
pub fn error_entry(exception_message: &str) -> HistoryEntry {
    HistoryEntry {
        outputs: BTreeMap::new(),
        status: Some(HistoryStatus {
            status_str: "error".into(),
            completed: false,
            messages: vec![
                ("execution_start".into(), serde_json::json!({})),
                (
                    "execution_error".into(),
                    serde_json::json!({ "exception_message": exception_message }),
                ),
            ],
        }),
    }
}

/// A push message as the reader would forward it.
pub fn push(json: &str) -> PushEvent {
    PushEvent::Message(parse_message(json).expect("test message should parse"))
}

pub fn progress(prompt_id: &str) -> PushEvent {
    push(&format!(
        r#"{{"type":"progress","data":{{"value":3,"max":20,"prompt_id":"{prompt_id}","node":"3"}}}}"#
    ))
}

pub fn status(queue_remaining: i32) -> PushEvent {
    push(&format!(
        r#"{{"type":"status","data":{{"status":{{"exec_info":{{"queue_remaining":{queue_remaining}}}}}}}}}"#
    ))
}
