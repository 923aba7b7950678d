use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::shared::schema::{ticket_messages, tickets, users};

/// Ticket lifecycle status. Stored uppercase in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Open,
    Waiting,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Waiting => "WAITING",
            Self::Closed => "CLOSED",
        }
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "OPEN" => Ok(Self::Open),
            "WAITING" => Ok(Self::Waiting),
            "CLOSED" => Ok(Self::Closed),
            other => Err(format!("unknown ticket status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Support,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Support => "support",
            Self::Admin => "admin",
        }
    }

    /// Operators are the users allowed to act on tickets.
    pub fn is_operator(&self) -> bool {
        matches!(self, Self::Support | Self::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "client" => Ok(Self::Client),
            "support" => Ok(Self::Support),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Client lifecycle type. Advances new -> lead -> existing and never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    New,
    Lead,
    Existing,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Lead => "lead",
            Self::Existing => "existing",
        }
    }

    /// Ordering used to enforce the monotonic advance.
    pub fn rank(&self) -> u8 {
        match self {
            Self::New => 0,
            Self::Lead => 1,
            Self::Existing => 2,
        }
    }
}

impl std::fmt::Display for ClientType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClientType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "new" => Ok(Self::New),
            "lead" => Ok(Self::Lead),
            "existing" => Ok(Self::Existing),
            other => Err(format!("unknown client type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "IN",
            Self::Out => "OUT",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "IN" => Ok(Self::In),
            "OUT" => Ok(Self::Out),
            other => Err(format!("unknown message direction: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, QueryableByName, Insertable, AsChangeset)]
#[diesel(table_name = users)]
pub struct User {
    pub user_id: i64,
    pub username: Option<String>,
    pub role: String,
    pub client_type: String,
    pub is_blocked: bool,
    pub is_paid: bool,
    pub reminder_step: i16,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl User {
    pub fn role_kind(&self) -> Role {
        self.role.parse().unwrap_or(Role::Client)
    }

    pub fn client_kind(&self) -> ClientType {
        self.client_type.parse().unwrap_or(ClientType::New)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, QueryableByName, Insertable, AsChangeset)]
#[diesel(table_name = tickets)]
pub struct Ticket {
    pub ticket_id: i32,
    pub client_user_id: i64,
    pub status: String,
    pub assigned_to_support_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub taken_at: Option<DateTime<Utc>>,
    pub first_reply_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub sla_stage: i16,
    pub support_thread_id: Option<i64>,
    pub card_message_id: Option<i64>,
    pub topic_card_message_id: Option<i64>,
}

impl Ticket {
    pub fn status_kind(&self) -> TicketStatus {
        self.status.parse().unwrap_or(TicketStatus::Open)
    }

    /// OPEN or WAITING — not yet closed.
    pub fn is_active(&self) -> bool {
        matches!(self.status_kind(), TicketStatus::Open | TicketStatus::Waiting)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = ticket_messages)]
pub struct TicketMessage {
    pub message_id: i32,
    pub ticket_id: i32,
    pub direction: String,
    pub author_user_id: Option<i64>,
    pub text: Option<String>,
    pub media_type: Option<String>,
    pub media_file_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only message payload as received from a transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageContent {
    pub text: Option<String>,
    pub media_type: Option<String>,
    pub media_file_id: Option<String>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Short display form for cards and history ("(media)" placeholder when empty).
    pub fn excerpt(&self) -> String {
        match self.text.as_deref() {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => "(media)".to_string(),
        }
    }
}

/// New message row; the repository stamps message_id and created_at.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub ticket_id: i32,
    pub direction: Direction,
    pub author_user_id: Option<i64>,
    pub content: MessageContent,
}

/// Ticket listing row with both usernames resolved, for operator overviews.
#[derive(Debug, Clone, Serialize)]
pub struct TicketOverview {
    pub ticket_id: i32,
    pub status: String,
    pub client_user_id: i64,
    pub assigned_to_support_id: Option<i64>,
    pub client_username: Option<String>,
    pub support_username: Option<String>,
}

/// History row: message plus its author's username, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct MessageWithAuthor {
    pub message: TicketMessage,
    pub username: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in ["OPEN", "WAITING", "CLOSED"] {
            let parsed: TicketStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert!("RESOLVED".parse::<TicketStatus>().is_err());
        assert_eq!("waiting".parse::<TicketStatus>().unwrap(), TicketStatus::Waiting);
    }

    #[test]
    fn test_client_type_rank_is_monotonic() {
        assert!(ClientType::New.rank() < ClientType::Lead.rank());
        assert!(ClientType::Lead.rank() < ClientType::Existing.rank());
    }

    #[test]
    fn test_role_operator() {
        assert!(Role::Support.is_operator());
        assert!(Role::Admin.is_operator());
        assert!(!Role::Client.is_operator());
    }

    #[test]
    fn test_excerpt_placeholder() {
        let media_only = MessageContent {
            media_type: Some("photo".into()),
            media_file_id: Some("abc".into()),
            ..MessageContent::default()
        };
        assert_eq!(media_only.excerpt(), "(media)");
        assert_eq!(MessageContent::text("hi").excerpt(), "hi");
    }
}
