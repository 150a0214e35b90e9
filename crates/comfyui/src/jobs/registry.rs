//! Atomically published snapshot of every job the server reports.
//!
//! Readers load the current snapshot without locking. A reconciliation
//! pass replaces the whole map at once; readers see either the old or the
//! new snapshot, never a mix.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use comfyq_core::job::{JobRecord, JobStatus};
use comfyq_core::types::{PromptId, Timestamp};

/// One immutable view of all known jobs, keyed by prompt id.
pub type Snapshot = HashMap<PromptId, JobRecord>;

#[derive(Default)]
pub struct JobRegistry {
    current: ArcSwap<Snapshot>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Status of `prompt_id`, or [`JobStatus::None`] if it is not known.
    pub fn lookup(&self, prompt_id: &str) -> JobStatus {
        self.current
            .load()
            .get(prompt_id)
            .map_or(JobStatus::None, |record| record.status)
    }

    /// A copy of the record for `prompt_id`, if known.
    pub fn get(&self, prompt_id: &str) -> Option<JobRecord> {
        self.current.load().get(prompt_id).cloned()
    }

    pub fn contains(&self, prompt_id: &str) -> bool {
        self.current.load().contains_key(prompt_id)
    }

    /// Publish a new snapshot, returning the one it replaced.
    pub fn replace(&self, next: impl Into<Arc<Snapshot>>) -> Arc<Snapshot> {
        self.current.swap(next.into())
    }

    /// Fast-path `Pending -> Running` for a job already in the snapshot.
    ///
    /// Publishes a copy of the current snapshot with the one record
    /// changed, but only if no full replace happened in between. Losing
    /// that race is fine: the replacing pass is at least as fresh.
    pub fn mark_running(&self, prompt_id: &str, now: Timestamp) -> FastPath {
        let current = self.current.load_full();
        let Some(record) = current.get(prompt_id) else {
            return FastPath::Unknown;
        };
        if record.status != JobStatus::Pending {
            return FastPath::Unchanged;
        }

        let mut next = Snapshot::clone(&current);
        if let Some(record) = next.get_mut(prompt_id) {
            record.status = JobStatus::Running;
            record.last_update = now;
        }

        let previous = self.current.compare_and_swap(&current, Arc::new(next));
        if Arc::ptr_eq(&*previous, &current) {
            FastPath::Updated
        } else {
            FastPath::LostRace
        }
    }
}

/// Result of [`JobRegistry::mark_running`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPath {
    /// The record moved from `Pending` to `Running`.
    Updated,
    /// The record was already `Running` or terminal.
    Unchanged,
    /// A full replace was published concurrently; nothing was written.
    LostRace,
    /// The id is not in the current snapshot.
    Unknown,
}
