//! SLA escalation engine: a recurring scan over tickets still waiting for
//! any first human reply. Stage advancement is monotonic and idempotent;
//! every tier's notification fires at most once per ticket.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, warn};
use tokio::time::{interval, Duration};

use crate::notify::{self, Notifier, NotifyChannel};
use crate::shared::models::Ticket;
use crate::shared::state::AppState;
use crate::storage::{StorageError, TicketRepository};

pub struct EscalationService {
    state: Arc<AppState>,
}

impl EscalationService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Loop for the process lifetime. Iteration errors are logged and the
    /// next tick proceeds; the loop itself never exits.
    pub async fn spawn(self) {
        let mut ticker = interval(Duration::from_secs(
            self.state.config.sla.check_interval_secs,
        ));
        loop {
            ticker.tick().await;
            let now = Utc::now();
            // The scan simply does not run off-hours. Elapsed time is still
            // wall-clock, so a ticket created right before closing time can
            // escalate immediately at reopening; that is the intended
            // carry-over behavior.
            if !self.state.config.working_hours.contains(now) {
                continue;
            }
            if let Err(e) = self.run_check(now).await {
                error!("SLA watcher error: {e}");
            }
        }
    }

    /// One scan pass. A single ticket's failure does not block the rest.
    pub async fn run_check(&self, now: DateTime<Utc>) -> Result<(), StorageError> {
        let tickets = self.state.repo.tickets_for_sla_check().await?;
        for ticket in tickets {
            if let Err(e) = self.check_ticket(&ticket, now).await {
                error!("SLA check failed for ticket #{}: {e}", ticket.ticket_id);
            }
        }
        Ok(())
    }

    /// Thresholds applied in increasing order, each tier gated by
    /// `sla_stage < target` so it fires at most once over the ticket's life.
    async fn check_ticket(&self, ticket: &Ticket, now: DateTime<Utc>) -> Result<(), StorageError> {
        let minutes = (now - ticket.created_at).num_minutes();
        let sla = &self.state.config.sla;
        let mut stage = ticket.sla_stage;

        if minutes >= sla.warning_minutes && stage < 1 {
            self.send_warning(ticket).await;
            self.state.repo.update_sla_stage(ticket.ticket_id, 1).await?;
            stage = 1;
        }
        if minutes >= sla.admin_minutes && stage < 2 {
            self.send_admin_escalation(ticket, minutes, false).await;
            self.state.repo.update_sla_stage(ticket.ticket_id, 2).await?;
            stage = 2;
        }
        if minutes >= sla.critical_minutes && stage < 3 {
            self.send_admin_escalation(ticket, minutes, true).await;
            self.state.repo.update_sla_stage(ticket.ticket_id, 3).await?;
        }
        Ok(())
    }

    /// Warning tier: the assigned operator's thread, or the general support
    /// channel for an unclaimed ticket. Best effort.
    async fn send_warning(&self, ticket: &Ticket) {
        let support_username = match ticket.assigned_to_support_id {
            Some(id) => self.state.repo.username(id).await.unwrap_or_default(),
            None => None,
        };
        let text = notify::sla_warning_text(
            ticket.ticket_id,
            self.state.config.sla.warning_minutes,
            support_username.as_deref(),
        );
        let send = self.state.notifier.send_plain(
            NotifyChannel::Support {
                thread: ticket.support_thread_id,
            },
            &text,
        );
        if let Err(e) = notify::with_timeout(self.state.config.notify_timeout_secs, send).await {
            warn!(
                "could not send SLA warning for ticket #{}: {e}",
                ticket.ticket_id
            );
        }
    }

    async fn send_admin_escalation(&self, ticket: &Ticket, minutes: i64, critical: bool) {
        let support_username = match ticket.assigned_to_support_id {
            Some(id) => self.state.repo.username(id).await.unwrap_or_default(),
            None => None,
        };
        let client_username = self
            .state
            .repo
            .username(ticket.client_user_id)
            .await
            .unwrap_or_default();
        let text = notify::escalation_text(
            ticket.ticket_id,
            support_username.as_deref(),
            client_username.as_deref(),
            &format!("No reply to the client for {minutes} minutes"),
            &ticket.status,
            critical,
        );
        let send = self
            .state
            .notifier
            .send_plain(NotifyChannel::Admin, &text);
        if let Err(e) = notify::with_timeout(self.state.config.notify_timeout_secs, send).await {
            warn!(
                "could not send SLA escalation for ticket #{}: {e}",
                ticket.ticket_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::notify::{RecordingNotifier, SentNotification};
    use crate::storage::{MemoryRepository, TicketRepository};
    use chrono::Duration as ChronoDuration;

    struct Harness {
        state: Arc<AppState>,
        notifier: Arc<RecordingNotifier>,
        service: EscalationService,
    }

    fn harness() -> Harness {
        let repo = Arc::new(MemoryRepository::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let state = Arc::new(AppState::new(
            AppConfig::default(),
            repo,
            notifier.clone(),
        ));
        Harness {
            service: EscalationService::new(state.clone()),
            state,
            notifier,
        }
    }

    async fn pending_ticket(h: &Harness, client_id: i64) -> (i32, DateTime<Utc>) {
        let (ticket_id, _) = h
            .state
            .repo
            .get_or_create_active_ticket(client_id)
            .await
            .unwrap();
        let created = h
            .state
            .repo
            .get_ticket(ticket_id)
            .await
            .unwrap()
            .unwrap()
            .created_at;
        (ticket_id, created)
    }

    async fn stage_of(h: &Harness, ticket_id: i32) -> i16 {
        h.state
            .repo
            .get_ticket(ticket_id)
            .await
            .unwrap()
            .unwrap()
            .sla_stage
    }

    #[tokio::test]
    async fn test_warning_fires_once() {
        let h = harness();
        let (ticket_id, created) = pending_ticket(&h, 1).await;

        let at_16 = created + ChronoDuration::minutes(16);
        h.service.run_check(at_16).await.unwrap();
        assert_eq!(stage_of(&h, ticket_id).await, 1);
        assert_eq!(h.notifier.sent().len(), 1);
        assert!(matches!(
            &h.notifier.sent()[0],
            SentNotification::Plain {
                channel: NotifyChannel::Support { thread: None },
                text,
            } if text.contains("SLA warning")
        ));

        // Second scan before the admin threshold: nothing new.
        h.service
            .run_check(at_16 + ChronoDuration::minutes(1))
            .await
            .unwrap();
        assert_eq!(stage_of(&h, ticket_id).await, 1);
        assert_eq!(h.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_crossing_several_thresholds_fires_each_tier_once() {
        let h = harness();
        let (ticket_id, created) = pending_ticket(&h, 1).await;

        h.service
            .run_check(created + ChronoDuration::minutes(130))
            .await
            .unwrap();
        assert_eq!(stage_of(&h, ticket_id).await, 3);
        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 3);
        assert!(matches!(
            &sent[0],
            SentNotification::Plain { channel: NotifyChannel::Support { .. }, .. }
        ));
        assert!(matches!(
            &sent[1],
            SentNotification::Plain { channel: NotifyChannel::Admin, text } if !text.contains("CRITICAL")
        ));
        assert!(matches!(
            &sent[2],
            SentNotification::Plain { channel: NotifyChannel::Admin, text } if text.contains("CRITICAL")
        ));

        // Everything already fired; the next pass is silent.
        h.service
            .run_check(created + ChronoDuration::minutes(200))
            .await
            .unwrap();
        assert_eq!(h.notifier.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_stage_advances_sequentially_across_passes() {
        let h = harness();
        let (ticket_id, created) = pending_ticket(&h, 1).await;

        h.service
            .run_check(created + ChronoDuration::minutes(16))
            .await
            .unwrap();
        assert_eq!(stage_of(&h, ticket_id).await, 1);
        h.service
            .run_check(created + ChronoDuration::minutes(31))
            .await
            .unwrap();
        assert_eq!(stage_of(&h, ticket_id).await, 2);
        assert_eq!(h.notifier.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_first_reply_stops_the_clock() {
        let h = harness();
        let (ticket_id, created) = pending_ticket(&h, 1).await;
        h.state
            .repo
            .set_first_reply_if_needed(ticket_id)
            .await
            .unwrap();

        h.service
            .run_check(created + ChronoDuration::minutes(500))
            .await
            .unwrap();
        assert_eq!(stage_of(&h, ticket_id).await, 0);
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_stall_the_scan() {
        let h = harness();
        let (first, created) = pending_ticket(&h, 1).await;
        let (second, _) = pending_ticket(&h, 2).await;

        h.notifier.set_failing(true);
        h.service
            .run_check(created + ChronoDuration::minutes(16))
            .await
            .unwrap();
        // Sends failed, but stages advanced for both tickets and the pass
        // completed.
        assert_eq!(stage_of(&h, first).await, 1);
        assert_eq!(stage_of(&h, second).await, 1);
    }
}
