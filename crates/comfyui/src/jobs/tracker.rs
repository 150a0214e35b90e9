//! The job-state reconciliation engine.
//!
//! [`JobTracker`] owns the registry snapshot, the wait registry and the
//! reconciler, and exposes the operations job handles and the
//! notification bridge call into. It is shared as `Arc<JobTracker>`.

use std::sync::Arc;

use chrono::Utc;
use comfyq_core::job::{JobRecord, JobStatus};
use tokio::sync::broadcast;

use crate::api::DeleteRequest;
use crate::events::{JobEvent, EVENT_CHANNEL_CAPACITY};

use super::error::JobManagerError;
use super::future::JobFuture;
use super::reconciler::Reconciler;
use super::registry::{FastPath, JobRegistry};
use super::single_flight::Flight;
use super::transport::JobTransport;
use super::waiters::WaitRegistry;

pub struct JobTracker {
    transport: Arc<dyn JobTransport>,
    registry: Arc<JobRegistry>,
    waiters: Arc<WaitRegistry>,
    reconciler: Reconciler,
    events: broadcast::Sender<JobEvent>,
}

impl JobTracker {
    pub fn new(transport: Arc<dyn JobTransport>) -> Arc<Self> {
        Self::with_event_capacity(transport, EVENT_CHANNEL_CAPACITY)
    }

    /// Like [`new`](Self::new) with a custom job-event channel capacity.
    pub fn with_event_capacity(transport: Arc<dyn JobTransport>, capacity: usize) -> Arc<Self> {
        let (events, _) = broadcast::channel(capacity);
        let registry = Arc::new(JobRegistry::new());
        let waiters = Arc::new(WaitRegistry::new());
        let reconciler = Reconciler::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            Arc::clone(&waiters),
            events.clone(),
        );

        Arc::new(Self {
            transport,
            registry,
            waiters,
            reconciler,
            events,
        })
    }

    /// Subscribe to job transition and connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Publish an event that did not come from a reconciliation pass.
    pub(crate) fn publish(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    /// Current status, or [`JobStatus::None`] if unknown. Never does I/O.
    pub fn status(&self, prompt_id: &str) -> JobStatus {
        self.registry.lookup(prompt_id)
    }

    /// Current record for `prompt_id`, if known.
    pub fn record(&self, prompt_id: &str) -> Option<JobRecord> {
        self.registry.get(prompt_id)
    }

    /// Run a reconciliation pass or wait out the one in flight.
    pub async fn reconcile(&self) -> Result<Flight, JobManagerError> {
        Ok(self.reconciler.reconcile().await?)
    }

    /// Run a pass that starts after this call.
    ///
    /// [`reconcile`](Self::reconcile) may join a pass whose queue fetch
    /// predates a submission made moments ago. This keeps going until it
    /// leads a pass of its own.
    pub async fn refresh(&self) -> Result<(), JobManagerError> {
        while self.reconcile().await? == Flight::Joined {}
        Ok(())
    }

    /// Future of the outputs of `prompt_id`.
    ///
    /// Returns the already registered future if there is one. An id the
    /// registry does not know triggers one reconciliation pass; if it is
    /// still unknown afterwards the call fails with
    /// [`JobManagerError::NotFound`] and nothing is registered.
    pub async fn future(&self, prompt_id: &str) -> Result<JobFuture, JobManagerError> {
        if self.waiters.is_closed() {
            return Err(JobManagerError::ShutDown);
        }
        if let Some(future) = self.waiters.existing(prompt_id) {
            return Ok(future);
        }

        if !self.registry.contains(prompt_id) {
            self.reconcile().await?;
            if !self.registry.contains(prompt_id) {
                return Err(JobManagerError::NotFound(prompt_id.to_string()));
            }
        }

        self.waiters.get_or_register(prompt_id, &self.registry)
    }

    /// Delete `prompt_id` from the pending queue and from history, then
    /// reconcile. A job that is already executing is not interrupted.
    pub async fn release(&self, prompt_id: &str) -> Result<(), JobManagerError> {
        let request = DeleteRequest::ids([prompt_id.to_string()]);
        self.transport.delete_queued(&request).await?;
        self.transport.delete_history(&request).await?;
        tracing::info!(prompt_id, "Released job");

        self.reconcile().await?;
        Ok(())
    }

    /// Clear the entire server history, then reconcile.
    pub async fn clear_history(&self) -> Result<(), JobManagerError> {
        self.transport
            .delete_history(&DeleteRequest::clear_all())
            .await?;
        tracing::info!("Cleared ComfyUI history");

        self.reconcile().await?;
        Ok(())
    }

    /// A push event named `prompt_id` as making progress.
    ///
    /// Known jobs are moved to `Running` in place. Unknown jobs trigger a
    /// full pass so they get a proper record.
    pub async fn touch(&self, prompt_id: &str) -> Result<(), JobManagerError> {
        match self.registry.mark_running(prompt_id, Utc::now()) {
            FastPath::Updated => {
                tracing::debug!(prompt_id, "Job marked running");
                self.publish(JobEvent::StatusChanged {
                    prompt_id: prompt_id.to_string(),
                    from: Some(JobStatus::Pending),
                    to: JobStatus::Running,
                });
            }
            FastPath::Unchanged | FastPath::LostRace => {}
            FastPath::Unknown => {
                tracing::debug!(prompt_id, "Progress for unknown job, reconciling");
                self.reconcile().await?;
            }
        }
        Ok(())
    }

    /// Number of callers still waiting on a future.
    pub fn waiting(&self) -> usize {
        self.waiters.pending_count()
    }

    /// Fail every outstanding future and refuse new waiters.
    pub fn shutdown(&self) {
        let failed = self.waiters.close();
        tracing::info!(failed, "Job tracker shut down");
    }
}
