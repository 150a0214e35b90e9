//! One-shot completion handle for a job's outputs.
//!
//! A [`JobFuture`] is settled at most once, by the reconciler or at
//! creation time for jobs that are already terminal. Clones share the
//! same slot, so every waiter observes the same outcome.

use std::future::IntoFuture;
use std::sync::Arc;

use comfyq_core::job::JobOutput;
use comfyq_core::types::PromptId;
use futures::future::BoxFuture;
use tokio::sync::watch;

use super::error::JobFailure;

/// Outcome of a job as delivered to waiters.
pub type JobResult = Result<Vec<JobOutput>, JobFailure>;

/// Shared, settle-once future of a job's outputs.
#[derive(Clone)]
pub struct JobFuture {
    prompt_id: PromptId,
    slot: Arc<watch::Sender<Option<JobResult>>>,
}

impl JobFuture {
    /// An unresolved future. Settle it with [`resolve`](Self::resolve)
    /// or [`fail`](Self::fail).
    pub fn pending(prompt_id: PromptId) -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            prompt_id,
            slot: Arc::new(slot),
        }
    }

    /// A future that is already settled with `result`.
    pub fn settled(prompt_id: PromptId, result: JobResult) -> Self {
        let (slot, _) = watch::channel(Some(result));
        Self {
            prompt_id,
            slot: Arc::new(slot),
        }
    }

    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    /// Complete with outputs. Returns `false` if already settled.
    pub fn resolve(&self, outputs: Vec<JobOutput>) -> bool {
        self.settle(Ok(outputs))
    }

    /// Complete with a failure. Returns `false` if already settled.
    pub fn fail(&self, failure: JobFailure) -> bool {
        self.settle(Err(failure))
    }

    fn settle(&self, result: JobResult) -> bool {
        let mut result = Some(result);
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = result.take();
            true
        })
    }

    pub fn is_settled(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// The outcome if already settled, without waiting.
    pub fn try_result(&self) -> Option<JobResult> {
        self.slot.borrow().clone()
    }

    /// Whether both handles share the same underlying slot.
    pub fn ptr_eq(&self, other: &JobFuture) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Wait until the future is settled. No timeout is applied; wrap in
    /// `tokio::time::timeout` to impose a deadline.
    pub async fn wait(&self) -> JobResult {
        let mut rx = self.slot.subscribe();
        let settled = match rx.wait_for(Option::is_some).await {
            Ok(settled) => settled.clone(),
            // The sender lives inside `self`, so the channel cannot close
            // while we wait.
            Err(_) => None,
        };
        settled.unwrap_or_else(|| Err(JobFailure::Shutdown(self.prompt_id.clone())))
    }

    /// Block the current thread until settled.
    ///
    /// For callers outside an async runtime; must not be called from a
    /// tokio worker thread.
    pub fn wait_blocking(&self) -> JobResult {
        futures::executor::block_on(self.wait())
    }
}

impl IntoFuture for JobFuture {
    type Output = JobResult;
    type IntoFuture = BoxFuture<'static, JobResult>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

impl std::fmt::Debug for JobFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobFuture")
            .field("prompt_id", &self.prompt_id)
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;

    fn output(name: &str) -> JobOutput {
        JobOutput {
            node: "9".into(),
            filename: name.into(),
            subfolder: String::new(),
            kind: "output".into(),
        }
    }

    #[tokio::test]
    async fn resolve_wakes_waiter() {
        let future = JobFuture::pending("j1".into());
        let waiter = tokio::spawn(future.clone().into_future());

        tokio::task::yield_now().await;
        assert!(future.resolve(vec![output("out.png")]));

        let outputs = waiter.await.unwrap().unwrap();
        assert_eq!(outputs, vec![output("out.png")]);
    }

    #[tokio::test]
    async fn settles_only_once() {
        let future = JobFuture::pending("j1".into());
        assert!(future.fail(JobFailure::UnknownState("j1".into())));
        assert!(!future.resolve(vec![output("late.png")]));

        assert_matches!(future.wait().await, Err(JobFailure::UnknownState(id)) if id == "j1");
    }

    #[tokio::test]
    async fn settled_future_is_ready() {
        let future = JobFuture::settled("j1".into(), Ok(vec![]));
        assert!(future.is_settled());
        let result = tokio::time::timeout(Duration::from_secs(1), future.wait()).await;
        assert_matches!(result, Ok(Ok(outputs)) if outputs.is_empty());
    }

    #[tokio::test]
    async fn pending_future_does_not_complete() {
        let future = JobFuture::pending("j1".into());
        assert!(future.try_result().is_none());
        let result = tokio::time::timeout(Duration::from_millis(20), future.wait()).await;
        assert!(result.is_err());
    }

    #[test]
    fn clones_share_identity() {
        let a = JobFuture::pending("j1".into());
        let b = a.clone();
        let c = JobFuture::pending("j1".into());
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
    }

    #[test]
    fn wait_blocking_outside_runtime() {
        let future = JobFuture::pending("j1".into());
        let settler = future.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            settler.fail(JobFailure::Failed {
                prompt_id: "j1".into(),
                message: None,
            });
        });

        assert_matches!(future.wait_blocking(), Err(JobFailure::Failed { message: None, .. }));
        thread.join().unwrap();
    }
}
