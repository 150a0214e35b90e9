//! Reconciliation passes: fetch queue and history, merge them into a new
//! snapshot, publish it, and settle the futures of jobs that finished or
//! vanished.
//!
//! Passes never overlap. Concurrent requests collapse into the pass
//! already in flight (see [`SingleFlight`]).

use std::sync::Arc;

use chrono::Utc;
use comfyq_core::job::{JobRecord, JobStatus};
use comfyq_core::types::{PromptId, Timestamp};
use tokio::sync::broadcast;

use crate::api::{ComfyUIApiError, HistoryEntry, HistoryResponse, QueueResponse};
use crate::events::JobEvent;

use super::registry::{JobRegistry, Snapshot};
use super::single_flight::{Flight, SingleFlight};
use super::transport::JobTransport;
use super::waiters::WaitRegistry;

pub struct Reconciler {
    transport: Arc<dyn JobTransport>,
    registry: Arc<JobRegistry>,
    waiters: Arc<WaitRegistry>,
    flight: SingleFlight,
    events: broadcast::Sender<JobEvent>,
}

impl Reconciler {
    pub fn new(
        transport: Arc<dyn JobTransport>,
        registry: Arc<JobRegistry>,
        waiters: Arc<WaitRegistry>,
        events: broadcast::Sender<JobEvent>,
    ) -> Self {
        Self {
            transport,
            registry,
            waiters,
            flight: SingleFlight::new(),
            events,
        }
    }

    /// Run a pass, or wait for the one already running.
    ///
    /// A caller that joins an in-flight pass gets [`Flight::Joined`] and
    /// must read the registry afterwards; the leader's error, if any, is
    /// not propagated to it.
    pub async fn reconcile(&self) -> Result<Flight, ComfyUIApiError> {
        self.flight.run(|| self.pass()).await
    }

    async fn pass(&self) -> Result<(), ComfyUIApiError> {
        tracing::debug!("Reconciling job state");

        // Either fetch failing leaves the snapshot and all waiters untouched.
        let queue = self.transport.get_queue().await.inspect_err(|e| {
            tracing::error!(error = %e, "Failed to fetch ComfyUI queue");
        })?;
        let history = self.transport.get_history().await.inspect_err(|e| {
            tracing::error!(error = %e, "Failed to fetch ComfyUI history");
        })?;

        let previous = self.registry.snapshot();
        let next = Arc::new(merge_snapshot(&previous, &queue, &history, Utc::now()));
        let transitions = diagnose(&previous, &next);
        let vanished: Vec<PromptId> = transitions
            .iter()
            .filter_map(|event| match event {
                JobEvent::Removed { prompt_id, .. } => Some(prompt_id.clone()),
                _ => None,
            })
            .collect();

        self.registry.replace(Arc::clone(&next));
        let settled = self.waiters.settle(&next, &vanished);

        tracing::debug!(
            jobs = next.len(),
            pending = queue.queue_pending.len(),
            running = queue.queue_running.len(),
            history = history.len(),
            transitions = transitions.len(),
            settled,
            "Reconciled job state",
        );

        for event in transitions {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        Ok(())
    }
}

/// Merge queue and history into a fresh snapshot.
///
/// Later sources win on id collisions: pending, then running, then
/// history. A job that was terminal in `previous` keeps its terminal
/// record even if the server reports it as queued again, and a running
/// job is not demoted back to pending.
pub fn merge_snapshot(
    previous: &Snapshot,
    queue: &QueueResponse,
    history: &HistoryResponse,
    now: Timestamp,
) -> Snapshot {
    let mut next = Snapshot::with_capacity(
        queue.queue_pending.len() + queue.queue_running.len() + history.len(),
    );

    for entry in &queue.queue_pending {
        next.insert(
            entry.prompt_id.clone(),
            JobRecord::queued(entry.prompt_id.clone(), JobStatus::Pending, now),
        );
    }
    for entry in &queue.queue_running {
        next.insert(
            entry.prompt_id.clone(),
            JobRecord::queued(entry.prompt_id.clone(), JobStatus::Running, now),
        );
    }
    for (prompt_id, entry) in history {
        next.insert(prompt_id.clone(), history_record(prompt_id, entry, now));
    }

    for (prompt_id, record) in next.iter_mut() {
        let Some(prior) = previous.get(prompt_id) else {
            continue;
        };
        if !prior.status.can_advance_to(record.status) {
            tracing::warn!(
                prompt_id = %prompt_id,
                from = %prior.status,
                to = %record.status,
                "Ignoring backwards job transition",
            );
            *record = prior.clone();
        }
    }

    next
}

fn history_record(prompt_id: &PromptId, entry: &HistoryEntry, now: Timestamp) -> JobRecord {
    let success = entry.is_success();
    JobRecord {
        prompt_id: prompt_id.clone(),
        status: if success {
            JobStatus::Success
        } else {
            JobStatus::Error
        },
        last_update: now,
        outputs: Some(entry.job_outputs()),
        error_message: if success { None } else { entry.error_message() },
    }
}

/// Transitions between two snapshots, sorted by prompt id.
pub fn diagnose(previous: &Snapshot, next: &Snapshot) -> Vec<JobEvent> {
    let mut events: Vec<JobEvent> = next
        .values()
        .filter_map(|record| match previous.get(&record.prompt_id) {
            Some(prior) if prior.status == record.status => None,
            prior => Some(JobEvent::StatusChanged {
                prompt_id: record.prompt_id.clone(),
                from: prior.map(|p| p.status),
                to: record.status,
            }),
        })
        .collect();

    events.extend(
        previous
            .values()
            .filter(|prior| !next.contains_key(&prior.prompt_id))
            .map(|prior| JobEvent::Removed {
                prompt_id: prior.prompt_id.clone(),
                last: prior.status,
            }),
    );

    events.sort_by(|a, b| event_prompt_id(a).cmp(event_prompt_id(b)));
    events
}

fn event_prompt_id(event: &JobEvent) -> &str {
    match event {
        JobEvent::StatusChanged { prompt_id, .. } | JobEvent::Removed { prompt_id, .. } => {
            prompt_id.as_str()
        }
        JobEvent::Connected | JobEvent::Disconnected => "",
    }
}
