//! Collapse concurrent requests for the same action into one execution.
//!
//! The first caller runs the action. Callers arriving while it runs wait
//! for it to finish and then return [`Flight::Joined`] without running it
//! again and without seeing its result.

use std::future::Future;
use std::sync::Mutex;

use tokio::sync::Notify;

/// How a caller took part in a flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flight {
    /// This caller executed the action.
    Led,
    /// Another caller's execution was in progress; this caller waited it out.
    Joined,
}

#[derive(Default)]
pub struct SingleFlight {
    running: Mutex<bool>,
    finished: Notify,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` unless a run is already in flight, in which case wait
    /// for that run to finish instead.
    ///
    /// Errors from `action` go only to the leading caller.
    pub async fn run<F, Fut, E>(&self, action: F) -> Result<Flight, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        // Registered before the flag check so a finish between the check
        // and the await still wakes us.
        let finished = self.finished.notified();
        tokio::pin!(finished);
        finished.as_mut().enable();

        if !self.try_lead() {
            finished.await;
            return Ok(Flight::Joined);
        }

        let _guard = LeaderGuard { flight: self };
        action().await?;
        Ok(Flight::Led)
    }

    pub fn is_running(&self) -> bool {
        *self.lock()
    }

    fn try_lead(&self) -> bool {
        let mut running = self.lock();
        if *running {
            return false;
        }
        *running = true;
        true
    }

    fn finish(&self) {
        let mut running = self.lock();
        *running = false;
        self.finished.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, bool> {
        // The flag is a plain bool; a poisoned lock still holds a valid value.
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Clears the running flag and wakes waiters when the leader finishes,
/// errors, or is cancelled mid-flight.
struct LeaderGuard<'a> {
    flight: &'a SingleFlight,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        self.flight.finish();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::Barrier;

    use super::*;

    #[tokio::test]
    async fn single_caller_leads() {
        let flight = SingleFlight::new();
        let result: Result<Flight, ()> = flight.run(|| async { Ok(()) }).await;
        assert_eq!(result, Ok(Flight::Led));
        assert!(!flight.is_running());
    }

    #[tokio::test]
    async fn error_goes_to_leader_and_clears_flag() {
        let flight = SingleFlight::new();
        let result = flight.run(|| async { Err::<(), _>("boom") }).await;
        assert_eq!(result, Err("boom"));
        assert!(!flight.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_execution() {
        let flight = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));
        let callers = 8;
        let barrier = Arc::new(Barrier::new(callers));

        let tasks: Vec<_> = (0..callers)
            .map(|_| {
                let flight = Arc::clone(&flight);
                let executions = Arc::clone(&executions);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    flight
                        .run(|| async {
                            executions.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok::<(), ()>(())
                        })
                        .await
                })
            })
            .collect();

        let mut led = 0;
        for task in tasks {
            if task.await.unwrap() == Ok(Flight::Led) {
                led += 1;
            }
        }

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(led, 1);
    }

    #[tokio::test]
    async fn joined_caller_returns_only_after_leader_finishes() {
        let flight = Arc::new(SingleFlight::new());
        let done = Arc::new(AtomicUsize::new(0));

        let leader = {
            let flight = Arc::clone(&flight);
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                flight
                    .run(|| async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        done.store(1, Ordering::SeqCst);
                        Ok::<(), ()>(())
                    })
                    .await
            })
        };

        while !flight.is_running() {
            tokio::task::yield_now().await;
        }

        let joined = flight.run(|| async { Ok::<(), ()>(()) }).await;
        assert_eq!(joined, Ok(Flight::Joined));
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(leader.await.unwrap(), Ok(Flight::Led));
    }

    #[tokio::test]
    async fn cancelled_leader_releases_waiters() {
        let flight = Arc::new(SingleFlight::new());

        let leader = {
            let flight = Arc::clone(&flight);
            tokio::spawn(async move {
                flight
                    .run(|| async {
                        std::future::pending::<()>().await;
                        Ok::<(), ()>(())
                    })
                    .await
            })
        };
        while !flight.is_running() {
            tokio::task::yield_now().await;
        }

        leader.abort();
        let _ = leader.await;

        assert!(!flight.is_running());
        let next: Result<Flight, ()> = flight.run(|| async { Ok(()) }).await;
        assert_eq!(next, Ok(Flight::Led));
    }
}
