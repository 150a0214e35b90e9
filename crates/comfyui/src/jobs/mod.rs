//! Job-state reconciliation engine.
//!
//! The server's queue and history are the source of truth. The engine
//! keeps a snapshot of them in a [`JobRegistry`], refreshes it with
//! non-overlapping reconciliation passes, and settles the [`JobFuture`]s
//! of callers waiting on a job when it finishes or disappears.

pub mod bridge;
pub mod error;
pub mod future;
pub mod handle;
pub mod reconciler;
pub mod registry;
pub mod single_flight;
pub mod tracker;
pub mod transport;
pub mod waiters;

pub use bridge::{NotificationBridge, PushEvent};
pub use error::{JobFailure, JobManagerError};
pub use future::{JobFuture, JobResult};
pub use handle::JobHandle;
pub use registry::{JobRegistry, Snapshot};
pub use single_flight::Flight;
pub use tracker::JobTracker;
pub use transport::JobTransport;
