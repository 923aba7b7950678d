use std::sync::Arc;

use anyhow::Context;
use dotenvy::dotenv;
use log::{info, warn};

use supportbot::config::AppConfig;
use supportbot::escalation::EscalationService;
use supportbot::notify::LogNotifier;
use supportbot::reminders::ReminderService;
use supportbot::shared::state::AppState;
use supportbot::storage::{MemoryRepository, PgRepository, TicketRepository};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = AppConfig::from_env();

    let repo: Arc<dyn TicketRepository> = if config.database_url.is_empty() {
        warn!("DATABASE_URL not set; using the in-memory repository");
        Arc::new(MemoryRepository::new())
    } else {
        let pg = PgRepository::connect(&config.database_url)
            .context("could not connect to the database")?;
        pg.ensure_schema().context("could not initialize schema")?;
        Arc::new(pg)
    };

    // The real chat transport implements Notifier out of tree; the default
    // wiring just logs every send.
    let state = Arc::new(AppState::new(config, repo, Arc::new(LogNotifier::new())));

    tokio::spawn(EscalationService::new(Arc::clone(&state)).spawn());
    tokio::spawn(ReminderService::new(Arc::clone(&state)).spawn());
    info!(
        "supportbot started (SLA scan every {}s, reminder scan every {}s)",
        state.config.sla.check_interval_secs, state.config.reminders.check_interval_secs
    );

    // The watchers run for the process lifetime; shutdown is abrupt by
    // design since every write is committed before it is acted upon.
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    Ok(())
}
