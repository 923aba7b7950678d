pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::shared::models::{
    ClientType, MessageWithAuthor, NewMessage, Role, Ticket, TicketOverview, TicketStatus, User,
};

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("connection pool error: {0}")]
    Pool(String),
    #[error("database error: {0}")]
    Database(String),
}

impl From<diesel::result::Error> for StorageError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => Self::NotFound("row".to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Persistence contract for the ticket core.
///
/// Two operations carry atomicity requirements the implementations must
/// honor: `get_or_create_active_ticket` (read-check-insert must never yield
/// two active tickets for one client) and `take_ticket` (compare-and-set on
/// the assignee; exactly one of two concurrent callers wins). Everything
/// else is plain read/write, last writer wins.
#[async_trait]
pub trait TicketRepository: Send + Sync {
    // --- users ---

    /// Upsert on contact: refreshes username and last_seen for a known user,
    /// creates a new one otherwise. Ids present in `admin_ids` are created
    /// with the admin role.
    async fn get_or_create_user(
        &self,
        user_id: i64,
        username: Option<String>,
        admin_ids: &[i64],
    ) -> Result<User>;

    async fn get_user(&self, user_id: i64) -> Result<Option<User>>;

    /// Insert-or-update the role (admin surface).
    async fn set_role(&self, user_id: i64, role: Role) -> Result<()>;

    /// Advance client_type. The advance is monotonic: new -> lead ->
    /// existing; a regressive write is silently dropped.
    async fn set_client_type(&self, user_id: i64, client_type: ClientType) -> Result<()>;

    /// Mark the user paid and advance them to `existing`.
    async fn mark_user_paid(&self, user_id: i64) -> Result<()>;

    async fn username(&self, user_id: i64) -> Result<Option<String>>;

    /// Candidates for the nudge scan: client_type `new`, reminder_step < 5,
    /// created within the last 7 days, no tickets ever created.
    async fn users_due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<User>>;

    /// True if any OUT-direction message exists on any of the user's tickets.
    async fn any_support_reply(&self, user_id: i64) -> Result<bool>;

    /// reminder_step += 1, exactly.
    async fn increment_reminder_step(&self, user_id: i64) -> Result<()>;

    // --- tickets ---

    /// Returns the existing OPEN/WAITING ticket for the client, or creates a
    /// fresh OPEN unassigned one. `(ticket_id, is_new)`.
    async fn get_or_create_active_ticket(&self, client_id: i64) -> Result<(i32, bool)>;

    async fn get_ticket(&self, ticket_id: i32) -> Result<Option<Ticket>>;

    async fn active_ticket_for_client(&self, client_id: i64) -> Result<Option<Ticket>>;

    /// Compare-and-set claim: succeeds only while the assignee is null, and
    /// then also stamps taken_at and moves the status to WAITING.
    async fn take_ticket(&self, ticket_id: i32, support_id: i64) -> Result<bool>;

    /// first_reply_at = COALESCE(first_reply_at, now); resets sla_stage to 0.
    /// Idempotent.
    async fn set_first_reply_if_needed(&self, ticket_id: i32) -> Result<()>;

    /// CLOSED stamps closed_at; any other status clears it (re-open).
    async fn update_ticket_status(&self, ticket_id: i32, status: TicketStatus) -> Result<()>;

    /// Tickets still waiting for any first human reply (first_reply_at null,
    /// status OPEN or WAITING).
    async fn tickets_for_sla_check(&self) -> Result<Vec<Ticket>>;

    /// Raises sla_stage to `stage`; never lowers it.
    async fn update_sla_stage(&self, ticket_id: i32, stage: i16) -> Result<()>;

    async fn tickets_by_status(&self, status: TicketStatus) -> Result<Vec<TicketOverview>>;

    /// WAITING tickets assigned to the operator, oldest taken first.
    async fn support_active_tickets(&self, support_id: i64) -> Result<Vec<Ticket>>;

    async fn ticket_by_thread(&self, thread_id: i64) -> Result<Option<Ticket>>;

    async fn set_thread_id(&self, ticket_id: i32, thread_id: i64) -> Result<()>;

    /// General-chat card reference; `None` clears it after the card is torn
    /// down.
    async fn set_card_message_id(&self, ticket_id: i32, message_id: Option<i64>) -> Result<()>;

    async fn set_topic_card_message_id(&self, ticket_id: i32, message_id: i64) -> Result<()>;

    // --- messages ---

    async fn add_message(&self, message: NewMessage) -> Result<()>;

    /// Last `limit` messages of the ticket, returned oldest first.
    async fn ticket_messages(&self, ticket_id: i32, limit: i64) -> Result<Vec<MessageWithAuthor>>;

    // --- stats ---

    async fn tickets_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64>;

    async fn avg_first_reply_seconds(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<i64>>;

    /// Tickets whose first reply exceeded `sla_minutes`.
    async fn sla_violations(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        sla_minutes: i64,
    ) -> Result<i64>;

    /// Average number of client (IN) messages sent before the first support
    /// reply, over tickets that did get one.
    async fn avg_messages_before_reply(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<f64>>;
}
