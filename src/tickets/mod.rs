//! Ticket state machine: status transitions, assignment locking and
//! reply-mode gating. Every lifecycle mutation flows through
//! `TicketService`; the authorization policy lives in one place
//! (`authorize`) instead of being re-checked ad hoc by each caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::notify::{self, MessageHandle, Notifier, NotifyChannel, NotifyError, TicketCard};
use crate::shared::models::{
    ClientType, Direction, MessageContent, MessageWithAuthor, NewMessage, Role, Ticket,
    TicketOverview, TicketStatus,
};
use crate::shared::state::AppState;
use crate::storage::{StorageError, TicketRepository};

#[derive(Debug, thiserror::Error)]
pub enum TicketError {
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("delivery failed: {0}")]
    Delivery(#[from] NotifyError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketAction {
    Take,
    Reply,
    ChangeStatus,
    Escalate,
    ConfirmPayment,
    AttachThread,
    Read,
}

/// Single authorization policy for every public operation.
///
/// An unassigned ticket admits only `Take` (and reads); once assigned, only
/// the assignee may act. A CLOSED ticket admits reads and the explicit
/// status change that reopens it, nothing else.
pub fn authorize(
    action: TicketAction,
    ticket: &Ticket,
    actor_id: i64,
    role: Role,
) -> Result<(), TicketError> {
    if !role.is_operator() {
        return Err(TicketError::InvalidTransition(
            "operator role required".to_string(),
        ));
    }
    if action == TicketAction::Read {
        return Ok(());
    }
    if ticket.status_kind() == TicketStatus::Closed && action != TicketAction::ChangeStatus {
        return Err(TicketError::InvalidTransition(
            "ticket is closed; only history and status are available until it is reopened"
                .to_string(),
        ));
    }
    match ticket.assigned_to_support_id {
        None => {
            if action == TicketAction::Take {
                Ok(())
            } else {
                Err(TicketError::InvalidTransition(
                    "take the ticket first; an unassigned ticket admits no other action"
                        .to_string(),
                ))
            }
        }
        // Claiming an assigned ticket is decided by the compare-and-set,
        // which simply reports failure.
        Some(_) if action == TicketAction::Take => Ok(()),
        Some(assignee) if assignee == actor_id => Ok(()),
        Some(_) => Err(TicketError::InvalidTransition(
            "this ticket is handled by another operator".to_string(),
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyTarget {
    pub ticket_id: i32,
    pub thread_id: Option<i64>,
}

/// Per-operator transient "next message goes to the client" association.
/// Process-local by design: it is a short-lived UI mode, not business state.
#[derive(Default)]
pub struct ReplyModeRegistry {
    inner: Mutex<HashMap<i64, ReplyTarget>>,
}

impl ReplyModeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self, operator_id: i64, ticket_id: i32, thread_id: Option<i64>) {
        self.lock().insert(
            operator_id,
            ReplyTarget {
                ticket_id,
                thread_id,
            },
        );
    }

    pub fn clear(&self, operator_id: i64) {
        self.lock().remove(&operator_id);
    }

    pub fn get(&self, operator_id: i64) -> Option<ReplyTarget> {
        self.lock().get(&operator_id).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, ReplyTarget>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Period statistics for the admin surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SupportStats {
    pub tickets_created: i64,
    pub avg_first_reply_seconds: Option<i64>,
    pub sla_violations: i64,
    pub avg_messages_before_reply: Option<f64>,
}

pub struct TicketService {
    state: Arc<AppState>,
}

impl TicketService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Inbound client message: reuse or create the active ticket, append the
    /// message, and let support know. Card failures are logged, never fatal.
    pub async fn handle_client_message(
        &self,
        client_id: i64,
        username: Option<String>,
        content: MessageContent,
    ) -> Result<(i32, bool), TicketError> {
        let repo = &self.state.repo;
        repo.get_or_create_user(client_id, username, &self.state.config.admin_ids)
            .await?;
        let (ticket_id, is_new) = repo.get_or_create_active_ticket(client_id).await?;
        repo.add_message(NewMessage {
            ticket_id,
            direction: Direction::In,
            author_user_id: Some(client_id),
            content: content.clone(),
        })
        .await?;

        let ticket = self.load_ticket(ticket_id).await?;
        let excerpt = content.excerpt();
        if is_new {
            let card = self.build_card(&ticket, excerpt).await?;
            match self.state.notifier.send_ticket_card(&card, None).await {
                Ok(handle) => repo.set_card_message_id(ticket_id, Some(handle.0)).await?,
                Err(e) => warn!("could not post card for ticket #{ticket_id}: {e}"),
            }
        } else if let Some(thread) = ticket.support_thread_id {
            let text = format!(
                "📩 New message from client (Ticket #{ticket_id}):\n\"{}\"",
                truncate(&excerpt, 500)
            );
            if let Err(e) = self
                .state
                .notifier
                .send_plain(
                    NotifyChannel::Support {
                        thread: Some(thread),
                    },
                    &text,
                )
                .await
            {
                warn!("could not notify thread of ticket #{ticket_id}: {e}");
            }
        } else if let Some(card_id) = ticket.card_message_id {
            let card = self.build_card(&ticket, excerpt).await?;
            if let Err(e) = self
                .state
                .notifier
                .update_card(MessageHandle(card_id), &card)
                .await
            {
                debug!("could not refresh card of ticket #{ticket_id}: {e}");
            }
        }
        Ok((ticket_id, is_new))
    }

    /// Compare-and-set claim. `Ok(false)` means another operator won.
    pub async fn take(&self, ticket_id: i32, actor_id: i64) -> Result<bool, TicketError> {
        self.state.reply_modes.clear(actor_id);
        let ticket = self.load_ticket(ticket_id).await?;
        let role = self.actor_role(actor_id).await?;
        authorize(TicketAction::Take, &ticket, actor_id, role)?;

        let taken = self.state.repo.take_ticket(ticket_id, actor_id).await?;
        if taken {
            info!("ticket #{ticket_id} taken by operator {actor_id}");
            self.refresh_card(ticket_id).await;
        }
        Ok(taken)
    }

    /// Transport callback after a per-ticket topic is created: remember the
    /// thread, move the card into it, and drop the general-chat card
    /// reference (the transport removes that message).
    pub async fn attach_thread(
        &self,
        ticket_id: i32,
        actor_id: i64,
        thread_id: i64,
    ) -> Result<(), TicketError> {
        let ticket = self.load_ticket(ticket_id).await?;
        let role = self.actor_role(actor_id).await?;
        authorize(TicketAction::AttachThread, &ticket, actor_id, role)?;

        self.state.repo.set_thread_id(ticket_id, thread_id).await?;
        let excerpt = self.last_message_excerpt(ticket_id).await?;
        let ticket = self.load_ticket(ticket_id).await?;
        let card = self.build_card(&ticket, excerpt).await?;
        match self
            .state
            .notifier
            .send_ticket_card(&card, Some(thread_id))
            .await
        {
            Ok(handle) => {
                self.state
                    .repo
                    .set_topic_card_message_id(ticket_id, handle.0)
                    .await?;
            }
            Err(e) => warn!("could not post topic card for ticket #{ticket_id}: {e}"),
        }
        if ticket.card_message_id.is_some() {
            self.state.repo.set_card_message_id(ticket_id, None).await?;
        }
        Ok(())
    }

    /// Arm reply-mode: the operator's next message in this thread goes to
    /// the client. Requires WAITING and the ticket's own thread.
    pub async fn enter_reply_mode(
        &self,
        ticket_id: i32,
        actor_id: i64,
        thread_id: Option<i64>,
    ) -> Result<(), TicketError> {
        let ticket = self.load_ticket(ticket_id).await?;
        let role = self.actor_role(actor_id).await?;
        authorize(TicketAction::Reply, &ticket, actor_id, role)?;
        if ticket.status_kind() != TicketStatus::Waiting {
            return Err(TicketError::InvalidTransition(
                "take the ticket first; replies are available while it is WAITING".to_string(),
            ));
        }
        if thread_id != ticket.support_thread_id {
            return Err(TicketError::InvalidTransition(
                "reply mode must be entered from the ticket's own thread".to_string(),
            ));
        }
        self.state
            .reply_modes
            .enter(actor_id, ticket_id, thread_id);
        Ok(())
    }

    /// An operator message arrived in the support chat. Routes it to the
    /// client when the operator is in reply-mode for this thread; returns
    /// `Ok(None)` when the message is not a client-directed reply.
    ///
    /// Delivery and confirmation failures are surfaced: the operator must
    /// know the client did not receive the reply.
    pub async fn reply(
        &self,
        actor_id: i64,
        thread_id: Option<i64>,
        content: MessageContent,
    ) -> Result<Option<i32>, TicketError> {
        let Some(target) = self.state.reply_modes.get(actor_id) else {
            return Ok(None);
        };
        let role = self.actor_role(actor_id).await?;
        if !role.is_operator() {
            self.state.reply_modes.clear(actor_id);
            return Ok(None);
        }
        let Some(ticket) = self.state.repo.get_ticket(target.ticket_id).await? else {
            self.state.reply_modes.clear(actor_id);
            return Err(TicketError::NotFound("ticket"));
        };
        // Physically in a different thread than the armed ticket: not a
        // reply, leave the mode armed.
        if thread_id != ticket.support_thread_id {
            return Ok(None);
        }
        match ticket.status_kind() {
            TicketStatus::Closed => {
                return Err(TicketError::InvalidTransition(
                    "ticket is closed; replies to the client are unavailable".to_string(),
                ))
            }
            TicketStatus::Open => {
                return Err(TicketError::InvalidTransition(
                    "take the ticket first; only then can you answer the client".to_string(),
                ))
            }
            TicketStatus::Waiting => {}
        }
        if ticket.assigned_to_support_id != Some(actor_id) {
            return Err(TicketError::InvalidTransition(
                "this ticket is handled by another operator".to_string(),
            ));
        }

        self.state
            .repo
            .add_message(NewMessage {
                ticket_id: ticket.ticket_id,
                direction: Direction::Out,
                author_user_id: Some(actor_id),
                content: content.clone(),
            })
            .await?;
        self.state
            .repo
            .set_first_reply_if_needed(ticket.ticket_id)
            .await?;

        let timeout = self.state.config.notify_timeout_secs;
        notify::with_timeout(
            timeout,
            self.state
                .notifier
                .deliver_to_client(ticket.client_user_id, &content),
        )
        .await?;
        notify::with_timeout(
            timeout,
            self.state.notifier.send_plain(
                NotifyChannel::Support { thread: thread_id },
                "✅ Reply delivered to the client",
            ),
        )
        .await?;
        Ok(Some(ticket.ticket_id))
    }

    /// Explicit status change; the only path that may move a CLOSED ticket
    /// back to OPEN or WAITING.
    pub async fn change_status(
        &self,
        ticket_id: i32,
        actor_id: i64,
        new_status: &str,
    ) -> Result<TicketStatus, TicketError> {
        let status: TicketStatus = new_status
            .parse()
            .map_err(TicketError::InvalidTransition)?;
        let ticket = self.load_ticket(ticket_id).await?;
        let role = self.actor_role(actor_id).await?;
        authorize(TicketAction::ChangeStatus, &ticket, actor_id, role)?;
        self.state.reply_modes.clear(actor_id);

        self.state
            .repo
            .update_ticket_status(ticket_id, status)
            .await?;
        info!(
            "ticket #{ticket_id}: status {} -> {status} (operator {actor_id})",
            ticket.status
        );
        self.refresh_card(ticket_id).await;
        Ok(status)
    }

    /// Manual escalation to the admin channel. Surfaced on failure so the
    /// operator knows the escalation did not go out.
    pub async fn escalate(&self, ticket_id: i32, actor_id: i64) -> Result<(), TicketError> {
        let ticket = self.load_ticket(ticket_id).await?;
        let role = self.actor_role(actor_id).await?;
        authorize(TicketAction::Escalate, &ticket, actor_id, role)?;
        self.state.reply_modes.clear(actor_id);

        let support_username = self.state.repo.username(actor_id).await?;
        let client_username = self.state.repo.username(ticket.client_user_id).await?;
        let last = self.last_message_excerpt(ticket_id).await?;
        let text = notify::escalation_text(
            ticket_id,
            support_username.as_deref(),
            client_username.as_deref(),
            &last,
            &ticket.status,
            false,
        );
        notify::with_timeout(
            self.state.config.notify_timeout_secs,
            self.state.notifier.send_plain(NotifyChannel::Admin, &text),
        )
        .await?;
        Ok(())
    }

    /// Payment confirmed by the assignee: the client becomes an existing
    /// customer. Consumes the finalized lead reference for the log trail;
    /// the lead pipeline itself lives outside this crate.
    pub async fn confirm_payment(
        &self,
        ticket_id: i32,
        actor_id: i64,
        lead_ref: Option<i64>,
    ) -> Result<(), TicketError> {
        let ticket = self.load_ticket(ticket_id).await?;
        let role = self.actor_role(actor_id).await?;
        authorize(TicketAction::ConfirmPayment, &ticket, actor_id, role)?;
        if ticket.status_kind() != TicketStatus::Waiting {
            return Err(TicketError::InvalidTransition(
                "payment can only be confirmed while the ticket is in progress (WAITING)"
                    .to_string(),
            ));
        }
        self.state.reply_modes.clear(actor_id);

        self.state.repo.mark_user_paid(ticket.client_user_id).await?;
        info!(
            "ticket #{ticket_id}: payment confirmed for client {} (lead {lead_ref:?})",
            ticket.client_user_id
        );
        self.refresh_card(ticket_id).await;

        notify::with_timeout(
            self.state.config.notify_timeout_secs,
            self.state.notifier.send_plain(
                NotifyChannel::Support {
                    thread: ticket.support_thread_id,
                },
                "💰 Payment confirmed. The client is now an existing customer.",
            ),
        )
        .await?;
        if let Err(e) = self
            .state
            .notifier
            .deliver_to_client(
                ticket.client_user_id,
                &MessageContent::text("✅ Payment received, thank you! Support stays with you."),
            )
            .await
        {
            warn!(
                "could not confirm payment to client {} (ticket #{ticket_id}): {e}",
                ticket.client_user_id
            );
        }
        Ok(())
    }

    /// Read-only history; allowed in any status, including CLOSED.
    pub async fn history(
        &self,
        ticket_id: i32,
        limit: i64,
    ) -> Result<Vec<MessageWithAuthor>, TicketError> {
        self.load_ticket(ticket_id).await?;
        Ok(self.state.repo.ticket_messages(ticket_id, limit).await?)
    }

    pub async fn list_by_status(&self, status: &str) -> Result<Vec<TicketOverview>, TicketError> {
        let status: TicketStatus = status.parse().map_err(TicketError::InvalidTransition)?;
        Ok(self.state.repo.tickets_by_status(status).await?)
    }

    /// WAITING tickets assigned to the operator, oldest first.
    pub async fn operator_workload(&self, support_id: i64) -> Result<Vec<Ticket>, TicketError> {
        Ok(self.state.repo.support_active_tickets(support_id).await?)
    }

    pub async fn find_by_thread(&self, thread_id: i64) -> Result<Option<Ticket>, TicketError> {
        Ok(self.state.repo.ticket_by_thread(thread_id).await?)
    }

    /// Admin-only role assignment.
    pub async fn assign_role(
        &self,
        actor_id: i64,
        target_id: i64,
        role: &str,
    ) -> Result<(), TicketError> {
        if self.actor_role(actor_id).await? != Role::Admin {
            return Err(TicketError::InvalidTransition(
                "admin role required".to_string(),
            ));
        }
        let role: Role = role.parse().map_err(TicketError::InvalidTransition)?;
        self.state.repo.set_role(target_id, role).await?;
        info!("role of user {target_id} set to {role} by admin {actor_id}");
        Ok(())
    }

    pub async fn stats(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<SupportStats, TicketError> {
        let repo = &self.state.repo;
        Ok(SupportStats {
            tickets_created: repo.tickets_created_between(from, to).await?,
            avg_first_reply_seconds: repo.avg_first_reply_seconds(from, to).await?,
            sla_violations: repo
                .sla_violations(from, to, self.state.config.sla.report_minutes)
                .await?,
            avg_messages_before_reply: repo.avg_messages_before_reply(from, to).await?,
        })
    }

    /// Re-render the ticket card wherever it currently lives (topic card
    /// preferred over the general-chat card). Best effort.
    pub async fn refresh_card(&self, ticket_id: i32) {
        let result = self.try_refresh_card(ticket_id).await;
        if let Err(e) = result {
            debug!("could not refresh card of ticket #{ticket_id}: {e}");
        }
    }

    async fn try_refresh_card(&self, ticket_id: i32) -> Result<(), TicketError> {
        let Some(ticket) = self.state.repo.get_ticket(ticket_id).await? else {
            return Ok(());
        };
        let handle = match (ticket.support_thread_id, ticket.topic_card_message_id) {
            (Some(_), Some(card_id)) => MessageHandle(card_id),
            _ => match ticket.card_message_id {
                Some(card_id) => MessageHandle(card_id),
                None => return Ok(()),
            },
        };
        let excerpt = self.last_message_excerpt(ticket_id).await?;
        let card = self.build_card(&ticket, excerpt).await?;
        self.state.notifier.update_card(handle, &card).await?;
        Ok(())
    }

    async fn build_card(
        &self,
        ticket: &Ticket,
        last_message: String,
    ) -> Result<TicketCard, TicketError> {
        let client = self.state.repo.get_user(ticket.client_user_id).await?;
        let (username, client_type) = match client {
            Some(user) => (user.username.clone(), user.client_kind()),
            None => (None, ClientType::New),
        };
        Ok(TicketCard::from_ticket(
            ticket,
            username,
            client_type,
            last_message,
        ))
    }

    async fn last_message_excerpt(&self, ticket_id: i32) -> Result<String, TicketError> {
        let messages = self.state.repo.ticket_messages(ticket_id, 1).await?;
        Ok(messages
            .last()
            .map(|m| match m.message.text.as_deref() {
                Some(t) if !t.is_empty() => t.to_string(),
                _ => "(media)".to_string(),
            })
            .unwrap_or_else(|| "(no messages)".to_string()))
    }

    async fn load_ticket(&self, ticket_id: i32) -> Result<Ticket, TicketError> {
        self.state
            .repo
            .get_ticket(ticket_id)
            .await?
            .ok_or(TicketError::NotFound("ticket"))
    }

    async fn actor_role(&self, actor_id: i64) -> Result<Role, TicketError> {
        match self.state.repo.get_user(actor_id).await? {
            Some(user) => Ok(user.role_kind()),
            // Bootstrap admins act before their first stored contact.
            None if self.state.config.admin_ids.contains(&actor_id) => Ok(Role::Admin),
            None => Ok(Role::Client),
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::notify::{RecordingNotifier, SentNotification};
    use crate::storage::MemoryRepository;

    const CLIENT: i64 = 1001;
    const OP_A: i64 = 2001;
    const OP_B: i64 = 2002;

    struct Harness {
        state: Arc<AppState>,
        notifier: Arc<RecordingNotifier>,
        service: TicketService,
    }

    async fn harness() -> Harness {
        let repo = Arc::new(MemoryRepository::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let state = Arc::new(AppState::new(
            AppConfig::default(),
            repo.clone(),
            notifier.clone(),
        ));
        for op in [OP_A, OP_B] {
            state.repo.set_role(op, Role::Support).await.unwrap();
        }
        Harness {
            service: TicketService::new(state.clone()),
            state,
            notifier,
        }
    }

    async fn open_ticket(h: &Harness) -> i32 {
        let (ticket_id, is_new) = h
            .service
            .handle_client_message(CLIENT, Some("client".into()), MessageContent::text("help!"))
            .await
            .unwrap();
        assert!(is_new);
        ticket_id
    }

    #[tokio::test]
    async fn test_first_message_opens_ticket_second_reuses_it() {
        let h = harness().await;
        let ticket_id = open_ticket(&h).await;

        let ticket = h.state.repo.get_ticket(ticket_id).await.unwrap().unwrap();
        assert_eq!(ticket.status, "OPEN");
        assert!(ticket.assigned_to_support_id.is_none());
        assert!(matches!(
            h.notifier.sent().as_slice(),
            [SentNotification::Card { thread: None, .. }]
        ));

        let (second_id, is_new) = h
            .service
            .handle_client_message(CLIENT, None, MessageContent::text("still there?"))
            .await
            .unwrap();
        assert_eq!(second_id, ticket_id);
        assert!(!is_new);
    }

    #[tokio::test]
    async fn test_take_is_first_writer_wins() {
        let h = harness().await;
        let ticket_id = open_ticket(&h).await;

        assert!(h.service.take(ticket_id, OP_A).await.unwrap());
        let ticket = h.state.repo.get_ticket(ticket_id).await.unwrap().unwrap();
        assert_eq!(ticket.status, "WAITING");
        assert_eq!(ticket.assigned_to_support_id, Some(OP_A));

        assert!(!h.service.take(ticket_id, OP_B).await.unwrap());
        let ticket = h.state.repo.get_ticket(ticket_id).await.unwrap().unwrap();
        assert_eq!(ticket.assigned_to_support_id, Some(OP_A));
    }

    #[tokio::test]
    async fn test_take_requires_operator_role() {
        let h = harness().await;
        let ticket_id = open_ticket(&h).await;
        let err = h.service.take(ticket_id, CLIENT).await.unwrap_err();
        assert!(matches!(err, TicketError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_unassigned_ticket_admits_only_take() {
        let h = harness().await;
        let ticket_id = open_ticket(&h).await;
        let err = h
            .service
            .change_status(ticket_id, OP_A, "CLOSED")
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::InvalidTransition(_)));
        let err = h.service.escalate(ticket_id, OP_A).await.unwrap_err();
        assert!(matches!(err, TicketError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_reply_mode_requires_waiting_and_matching_thread() {
        let h = harness().await;
        let ticket_id = open_ticket(&h).await;

        // OPEN: no replies before the ticket is taken.
        let err = h
            .service
            .enter_reply_mode(ticket_id, OP_A, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::InvalidTransition(_)));

        h.service.take(ticket_id, OP_A).await.unwrap();
        h.service.attach_thread(ticket_id, OP_A, 555).await.unwrap();

        // Wrong thread.
        let err = h
            .service
            .enter_reply_mode(ticket_id, OP_A, Some(777))
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::InvalidTransition(_)));

        h.service
            .enter_reply_mode(ticket_id, OP_A, Some(555))
            .await
            .unwrap();
        assert_eq!(
            h.state.reply_modes.get(OP_A),
            Some(ReplyTarget {
                ticket_id,
                thread_id: Some(555)
            })
        );
    }

    #[tokio::test]
    async fn test_reply_stamps_first_reply_and_delivers() {
        let h = harness().await;
        let ticket_id = open_ticket(&h).await;
        h.service.take(ticket_id, OP_A).await.unwrap();
        h.service
            .enter_reply_mode(ticket_id, OP_A, None)
            .await
            .unwrap();
        h.notifier.clear();

        let replied = h
            .service
            .reply(OP_A, None, MessageContent::text("on it"))
            .await
            .unwrap();
        assert_eq!(replied, Some(ticket_id));

        let ticket = h.state.repo.get_ticket(ticket_id).await.unwrap().unwrap();
        assert!(ticket.first_reply_at.is_some());
        assert_eq!(ticket.sla_stage, 0);

        let sent = h.notifier.sent();
        assert!(sent.iter().any(|n| matches!(
            n,
            SentNotification::Client { user_id, text } if *user_id == CLIENT && text == "on it"
        )));
        assert!(sent.iter().any(|n| matches!(
            n,
            SentNotification::Plain { text, .. } if text.contains("delivered")
        )));

        let history = h.service.history(ticket_id, 30).await.unwrap();
        assert_eq!(history.last().unwrap().message.direction, "OUT");
    }

    #[tokio::test]
    async fn test_reply_without_mode_is_ignored() {
        let h = harness().await;
        let ticket_id = open_ticket(&h).await;
        h.service.take(ticket_id, OP_A).await.unwrap();
        let replied = h
            .service
            .reply(OP_A, None, MessageContent::text("stray note"))
            .await
            .unwrap();
        assert_eq!(replied, None);
    }

    #[tokio::test]
    async fn test_reply_delivery_failure_is_surfaced() {
        let h = harness().await;
        let ticket_id = open_ticket(&h).await;
        h.service.take(ticket_id, OP_A).await.unwrap();
        h.service
            .enter_reply_mode(ticket_id, OP_A, None)
            .await
            .unwrap();

        h.notifier.set_failing(true);
        let err = h
            .service
            .reply(OP_A, None, MessageContent::text("lost"))
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::Delivery(_)));
    }

    #[tokio::test]
    async fn test_reply_mode_cleared_by_other_actions() {
        let h = harness().await;
        let ticket_id = open_ticket(&h).await;
        h.service.take(ticket_id, OP_A).await.unwrap();
        h.service
            .enter_reply_mode(ticket_id, OP_A, None)
            .await
            .unwrap();
        assert!(h.state.reply_modes.get(OP_A).is_some());

        h.service
            .change_status(ticket_id, OP_A, "CLOSED")
            .await
            .unwrap();
        assert!(h.state.reply_modes.get(OP_A).is_none());
    }

    #[tokio::test]
    async fn test_change_status_rejects_unknown_value() {
        let h = harness().await;
        let ticket_id = open_ticket(&h).await;
        h.service.take(ticket_id, OP_A).await.unwrap();
        let err = h
            .service
            .change_status(ticket_id, OP_A, "RESOLVED")
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_close_and_reopen() {
        let h = harness().await;
        let ticket_id = open_ticket(&h).await;
        h.service.take(ticket_id, OP_A).await.unwrap();

        h.service
            .change_status(ticket_id, OP_A, "CLOSED")
            .await
            .unwrap();
        let ticket = h.state.repo.get_ticket(ticket_id).await.unwrap().unwrap();
        assert!(ticket.closed_at.is_some());

        // CLOSED admits nothing but reads and the explicit status change.
        let err = h.service.escalate(ticket_id, OP_A).await.unwrap_err();
        assert!(matches!(err, TicketError::InvalidTransition(_)));
        assert!(h.service.history(ticket_id, 10).await.is_ok());

        h.service
            .change_status(ticket_id, OP_A, "WAITING")
            .await
            .unwrap();
        let ticket = h.state.repo.get_ticket(ticket_id).await.unwrap().unwrap();
        assert!(ticket.closed_at.is_none());
        assert_eq!(ticket.status, "WAITING");
    }

    #[tokio::test]
    async fn test_only_assignee_acts_on_assigned_ticket() {
        let h = harness().await;
        let ticket_id = open_ticket(&h).await;
        h.service.take(ticket_id, OP_A).await.unwrap();

        let err = h
            .service
            .change_status(ticket_id, OP_B, "CLOSED")
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::InvalidTransition(_)));

        let err = h
            .service
            .enter_reply_mode(ticket_id, OP_B, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_escalate_sends_to_admin_channel() {
        let h = harness().await;
        let ticket_id = open_ticket(&h).await;
        h.service.take(ticket_id, OP_A).await.unwrap();
        h.notifier.clear();

        h.service.escalate(ticket_id, OP_A).await.unwrap();
        let sent = h.notifier.sent();
        assert!(sent.iter().any(|n| matches!(
            n,
            SentNotification::Plain { channel: NotifyChannel::Admin, text }
                if text.contains(&format!("Ticket #{ticket_id}"))
        )));
    }

    #[tokio::test]
    async fn test_confirm_payment_promotes_client() {
        let h = harness().await;
        let ticket_id = open_ticket(&h).await;
        h.service.take(ticket_id, OP_A).await.unwrap();

        h.service
            .confirm_payment(ticket_id, OP_A, Some(31))
            .await
            .unwrap();
        let client = h.state.repo.get_user(CLIENT).await.unwrap().unwrap();
        assert!(client.is_paid);
        assert_eq!(client.client_type, "existing");

        // Not available once the ticket left WAITING.
        h.service
            .change_status(ticket_id, OP_A, "CLOSED")
            .await
            .unwrap();
        let err = h
            .service
            .confirm_payment(ticket_id, OP_A, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_assign_role_is_admin_only() {
        let h = harness().await;
        let err = h.service.assign_role(OP_A, 3001, "support").await.unwrap_err();
        assert!(matches!(err, TicketError::InvalidTransition(_)));

        h.state.repo.set_role(OP_A, Role::Admin).await.unwrap();
        h.service.assign_role(OP_A, 3001, "support").await.unwrap();
        let user = h.state.repo.get_user(3001).await.unwrap().unwrap();
        assert_eq!(user.role, "support");
    }

    #[tokio::test]
    async fn test_find_by_thread_and_workload() {
        let h = harness().await;
        let ticket_id = open_ticket(&h).await;
        h.service.take(ticket_id, OP_A).await.unwrap();
        h.service.attach_thread(ticket_id, OP_A, 99).await.unwrap();

        let found = h.service.find_by_thread(99).await.unwrap().unwrap();
        assert_eq!(found.ticket_id, ticket_id);

        let workload = h.service.operator_workload(OP_A).await.unwrap();
        assert_eq!(workload.len(), 1);
        assert!(h.service.operator_workload(OP_B).await.unwrap().is_empty());
    }
}
