//! HTTP surface: merged stream reads, feed listings, staleness checks and
//! refresh requests.

mod error;
mod handlers;
mod router;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

pub use error::{ApiError, ErrorBody, ErrorCode, ErrorDetail};
pub use router::create_router;

use crate::refresh::{Dispatcher, QueueTransport};
use crate::storage::Database;
use crate::stream::{MergeEngine, ReadCache};

/// Shared state for all handlers.
pub struct AppState {
    pub db: Database,
    pub engine: MergeEngine,
    pub cache: Arc<ReadCache>,
    pub dispatcher: Arc<Dispatcher>,
    pub queue: Arc<dyn QueueTransport>,
    batch_seq: AtomicU64,
}

impl AppState {
    pub fn new(
        db: Database,
        engine: MergeEngine,
        cache: Arc<ReadCache>,
        dispatcher: Arc<Dispatcher>,
        queue: Arc<dyn QueueTransport>,
    ) -> Self {
        Self {
            db,
            engine,
            cache,
            dispatcher,
            queue,
            batch_seq: AtomicU64::new(1),
        }
    }
}
