//! Write side: turning refresh requests into stored entries.
//!
//! - [`worker`] - per-feed check → lock → fetch → parse → write → release,
//!   fanned out over a batch with bounded parallelism
//! - [`dispatcher`] - resolves work items to feeds, runs the worker,
//!   invalidates cached reads and posts the result notification
//! - [`queue`] - transport seam, in-memory queue and consumer loop
//! - [`scheduler`] - periodic publication of stale feeds

mod dispatcher;
mod message;
mod queue;
mod scheduler;
mod worker;

pub use dispatcher::{Dispatcher, Notifier, PipelineError};
pub use message::{RefreshBatch, RefreshNotification, WorkItem};
pub use queue::{
    run_consumer, BatchHandler, Delivery, MemoryQueue, QueueError, QueueStats, QueueTransport,
};
pub use scheduler::{run_scheduler, stale_batch};
pub use worker::{
    BatchReport, FeedReport, RefreshError, RefreshOutcome, RefreshSettings, RefreshWorker,
    SkipReason,
};
