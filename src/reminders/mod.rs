//! Reminder engine: staged nudges for new users who never opened a ticket.
//! One nudge per user per pass at most; steps are never skipped, and a
//! failed send leaves the step untouched so the next pass retries it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, warn};
use tokio::time::{interval, Duration};

use crate::notify::{self, Notifier};
use crate::shared::models::{MessageContent, User};
use crate::shared::state::AppState;
use crate::storage::{StorageError, TicketRepository};

/// Nudge texts, one per reminder step.
const NUDGES: [&str; 5] = [
    "👋 Hi! You started a chat with our support — just write your question here and we'll help.",
    "Still thinking it over? Describe what you need and an operator will pick it up right away.",
    "A day has passed — we're still here. Send your question whenever it suits you.",
    "Quick reminder: our support answers within working hours, usually in minutes. What can we help with?",
    "Last nudge from us — if anything comes up later, this chat stays open for you.",
];

pub struct ReminderService {
    state: Arc<AppState>,
}

impl ReminderService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn spawn(self) {
        let mut ticker = interval(Duration::from_secs(
            self.state.config.reminders.check_interval_secs,
        ));
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_check(Utc::now()).await {
                error!("reminder worker error: {e}");
            }
        }
    }

    /// One scan pass over unconverted new users.
    pub async fn run_check(&self, now: DateTime<Utc>) -> Result<(), StorageError> {
        let users = self.state.repo.users_due_reminders(now).await?;
        for user in users {
            if let Err(e) = self.check_user(&user, now).await {
                error!("reminder check failed for user {}: {e}", user.user_id);
            }
        }
        Ok(())
    }

    async fn check_user(&self, user: &User, now: DateTime<Utc>) -> Result<(), StorageError> {
        let step = user.reminder_step.max(0) as usize;
        let Some(&threshold) = self
            .state
            .config
            .reminders
            .schedule_minutes
            .get(step)
        else {
            return Ok(());
        };
        let elapsed = (now - user.created_at).num_minutes();
        if elapsed < threshold {
            return Ok(());
        }
        // Defensive re-check: never nudge someone support already answered.
        if self.state.repo.any_support_reply(user.user_id).await? {
            return Ok(());
        }

        let text = NUDGES[step.min(NUDGES.len() - 1)];
        let content = MessageContent::text(text);
        let send = self
            .state
            .notifier
            .deliver_to_client(user.user_id, &content);
        match notify::with_timeout(self.state.config.notify_timeout_secs, send).await {
            Ok(()) => {
                self.state
                    .repo
                    .increment_reminder_step(user.user_id)
                    .await?;
            }
            Err(e) => {
                // Step stays put; the next pass retries the same nudge.
                warn!("could not deliver nudge to user {}: {e}", user.user_id);
            }
        }
        Ok(())
    }
}
