//! Shared application state for the docpipe server.

use std::sync::Arc;

use docpipe_core::config::Config;
use docpipe_core::events::EventBus;
use docpipe_core::object_store::ObjectStore;
use docpipe_core::pipeline::IngestSender;
use docpipe_core::storage::DbPool;

/// Shared application state accessible by all route handlers.
pub struct AppState {
    /// SQLite connection pool.
    pub db: DbPool,
    /// Loaded service configuration.
    pub config: Config,
    /// Event bus feeding SSE subscribers.
    pub bus: Arc<EventBus>,
    /// Document byte storage.
    pub store: Arc<dyn ObjectStore>,
    /// Publisher side of the ingest queue consumed by the pipeline worker.
    pub ingest: IngestSender,
}
