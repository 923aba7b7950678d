use std::sync::Arc;

use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;

use crate::config::AppConfig;
use crate::notify::Notifier;
use crate::storage::{StorageError, TicketRepository};
use crate::tickets::ReplyModeRegistry;

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub fn create_conn(database_url: &str) -> Result<DbPool, StorageError> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder()
        .max_size(10)
        .build(manager)
        .map_err(|e| StorageError::Pool(e.to_string()))
}

/// Shared application state handed to every service.
pub struct AppState {
    pub config: AppConfig,
    pub repo: Arc<dyn TicketRepository>,
    pub notifier: Arc<dyn Notifier>,
    /// Process-local reply-mode registry; short-lived UI state, not persisted.
    pub reply_modes: ReplyModeRegistry,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        repo: Arc<dyn TicketRepository>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            repo,
            notifier,
            reply_modes: ReplyModeRegistry::new(),
        }
    }
}
