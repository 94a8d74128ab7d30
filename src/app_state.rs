use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::store::PgStore;
use crate::services::queue::QueueEngine;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PgStore>,
    pub queue: Arc<QueueEngine>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(store: PgStore, queue: QueueEngine, config: AppConfig) -> Self {
        Self {
            store: Arc::new(store),
            queue: Arc::new(queue),
            config: Arc::new(config),
        }
    }
}
