//! Notification dispatcher contract. The core formats cards and escalation
//! texts and hands them to a `Notifier`; transports (chat APIs, webhooks)
//! live outside this crate and implement the trait.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use log::{debug, info};
use serde::Serialize;

use crate::shared::models::{ClientType, MessageContent, Ticket};

/// Opaque reference to a sent card, used for later edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MessageHandle(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyChannel {
    /// Support group; `thread` targets a per-ticket topic when present.
    Support { thread: Option<i64> },
    /// Admin escalation channel.
    Admin,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

/// Serializable snapshot of a ticket, rendered into the support-chat card.
#[derive(Debug, Clone, Serialize)]
pub struct TicketCard {
    pub ticket_id: i32,
    pub status: String,
    pub client_user_id: i64,
    pub client_username: Option<String>,
    pub client_type: ClientType,
    pub created_at: DateTime<Utc>,
    pub taken_at: Option<DateTime<Utc>>,
    pub last_message: String,
    pub is_taken: bool,
}

impl TicketCard {
    pub fn from_ticket(
        ticket: &Ticket,
        client_username: Option<String>,
        client_type: ClientType,
        last_message: String,
    ) -> Self {
        Self {
            ticket_id: ticket.ticket_id,
            status: ticket.status.clone(),
            client_user_id: ticket.client_user_id,
            client_username,
            client_type,
            created_at: ticket.created_at,
            taken_at: ticket.taken_at,
            last_message,
            is_taken: ticket.assigned_to_support_id.is_some(),
        }
    }

    pub fn client_type_label(&self) -> &'static str {
        match self.client_type {
            ClientType::New => "New",
            ClientType::Lead => "Lead",
            ClientType::Existing => "Existing",
        }
    }

    /// Card text; timestamps rendered in the display offset.
    pub fn render(&self, offset: FixedOffset) -> String {
        let last = truncate(&self.last_message, 200);
        format!(
            "🎫 Ticket #{} | {}\nType: {}\nClient: @{} ({})\nCreated: {}\nTaken: {}\nLast message:\n\"{}\"",
            self.ticket_id,
            self.status,
            self.client_type_label(),
            self.client_username.as_deref().unwrap_or("—"),
            self.client_user_id,
            fmt_local(Some(self.created_at), offset),
            fmt_local(self.taken_at, offset),
            last,
        )
    }
}

fn fmt_local(ts: Option<DateTime<Utc>>, offset: FixedOffset) -> String {
    match ts {
        Some(ts) => ts
            .with_timezone(&offset)
            .format("%d.%m.%Y %H:%M")
            .to_string(),
        None => "—".to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}

/// First SLA tier: nudge whoever holds the ticket.
pub fn sla_warning_text(
    ticket_id: i32,
    warning_minutes: i64,
    support_username: Option<&str>,
) -> String {
    let owner = match support_username {
        Some(name) => format!("\nAssigned: @{name}"),
        None => String::new(),
    };
    format!(
        "⚠️ SLA warning\nTicket #{ticket_id}\n\nNo reply to the client for more than {warning_minutes} minutes.{owner}\nPlease answer the client."
    )
}

/// Admin-tier escalation card (also used for the manual escalate action).
pub fn escalation_text(
    ticket_id: i32,
    support_username: Option<&str>,
    client_username: Option<&str>,
    last_message: &str,
    status: &str,
    critical: bool,
) -> String {
    let header = if critical {
        format!("⛔ CRITICAL SLA escalation Ticket #{ticket_id}")
    } else {
        format!("⛔ Escalation Ticket #{ticket_id}")
    };
    format!(
        "{header}\nSupport: @{}\nClient: @{}\nLast client message: \"{}\"\nStatus: {}",
        support_username.unwrap_or("—"),
        client_username.unwrap_or("—"),
        truncate(last_message, 300),
        status,
    )
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Post a ticket card to the support group (or a ticket topic) and
    /// return a handle for later edits.
    async fn send_ticket_card(
        &self,
        card: &TicketCard,
        thread: Option<i64>,
    ) -> Result<MessageHandle, NotifyError>;

    /// Edit a previously posted card in place.
    async fn update_card(&self, handle: MessageHandle, card: &TicketCard)
        -> Result<(), NotifyError>;

    async fn send_plain(&self, channel: NotifyChannel, text: &str) -> Result<(), NotifyError>;

    /// Deliver an operator reply or a nudge to the client's private chat.
    async fn deliver_to_client(
        &self,
        user_id: i64,
        content: &MessageContent,
    ) -> Result<(), NotifyError>;
}

/// Bound a single send so one stuck delivery cannot stall a scan pass.
pub async fn with_timeout<T, F>(secs: u64, fut: F) -> Result<T, NotifyError>
where
    F: Future<Output = Result<T, NotifyError>>,
{
    let dur = Duration::from_secs(secs);
    match tokio::time::timeout(dur, fut).await {
        Ok(res) => res,
        Err(_) => Err(NotifyError::Timeout(dur)),
    }
}

/// Default dispatcher: logs every send and always succeeds. Keeps the binary
/// runnable while the real transport is wired in from the outside.
#[derive(Default)]
pub struct LogNotifier {
    next_handle: AtomicI64,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_ticket_card(
        &self,
        card: &TicketCard,
        thread: Option<i64>,
    ) -> Result<MessageHandle, NotifyError> {
        let handle = MessageHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        info!(
            "card -> support (thread {:?}): ticket #{} [{}]",
            thread, card.ticket_id, card.status
        );
        debug!(
            "card payload: {}",
            serde_json::to_string(card).unwrap_or_default()
        );
        Ok(handle)
    }

    async fn update_card(
        &self,
        handle: MessageHandle,
        card: &TicketCard,
    ) -> Result<(), NotifyError> {
        info!(
            "card update {:?}: ticket #{} [{}]",
            handle, card.ticket_id, card.status
        );
        Ok(())
    }

    async fn send_plain(&self, channel: NotifyChannel, text: &str) -> Result<(), NotifyError> {
        info!("plain -> {:?}: {}", channel, text.replace('\n', " | "));
        Ok(())
    }

    async fn deliver_to_client(
        &self,
        user_id: i64,
        content: &MessageContent,
    ) -> Result<(), NotifyError> {
        info!("client {} <- {}", user_id, content.excerpt());
        Ok(())
    }
}

/// Everything a `RecordingNotifier` observed, in send order.
#[derive(Debug, Clone, PartialEq)]
pub enum SentNotification {
    Card {
        ticket_id: i32,
        thread: Option<i64>,
    },
    CardUpdate {
        ticket_id: i32,
        handle: MessageHandle,
    },
    Plain {
        channel: NotifyChannel,
        text: String,
    },
    Client {
        user_id: i64,
        text: String,
    },
}

/// Test dispatcher: records sends; can be flipped to fail deliveries.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
    next_handle: AtomicI64,
    fail_sends: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// When set, every send returns a delivery error.
    pub fn set_failing(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }

    fn record(&self, notification: SentNotification) -> Result<(), NotifyError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(NotifyError::Delivery("simulated failure".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification);
        Ok(())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_ticket_card(
        &self,
        card: &TicketCard,
        thread: Option<i64>,
    ) -> Result<MessageHandle, NotifyError> {
        self.record(SentNotification::Card {
            ticket_id: card.ticket_id,
            thread,
        })?;
        Ok(MessageHandle(
            self.next_handle.fetch_add(1, Ordering::Relaxed) + 1,
        ))
    }

    async fn update_card(
        &self,
        handle: MessageHandle,
        card: &TicketCard,
    ) -> Result<(), NotifyError> {
        self.record(SentNotification::CardUpdate {
            ticket_id: card.ticket_id,
            handle,
        })
    }

    async fn send_plain(&self, channel: NotifyChannel, text: &str) -> Result<(), NotifyError> {
        self.record(SentNotification::Plain {
            channel,
            text: text.to_string(),
        })
    }

    async fn deliver_to_client(
        &self,
        user_id: i64,
        content: &MessageContent,
    ) -> Result<(), NotifyError> {
        self.record(SentNotification::Client {
            user_id,
            text: content.excerpt(),
        })
    }
}
