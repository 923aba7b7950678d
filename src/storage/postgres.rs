//! Diesel-backed repository. Blocking database work runs on the blocking
//! pool so the scan loops and request handlers never stall on a connection.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::{BigInt, Integer, Text, Timestamptz};

use crate::shared::models::{
    ClientType, MessageContent, MessageWithAuthor, NewMessage, Role, Ticket, TicketMessage,
    TicketOverview, TicketStatus, User,
};
use crate::shared::schema::{ticket_messages, tickets, users};
use crate::shared::state::{create_conn, DbPool};
use crate::storage::{Result, StorageError, TicketRepository};

const SCHEMA_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
        user_id BIGINT PRIMARY KEY,
        username TEXT,
        role TEXT NOT NULL DEFAULT 'client',
        client_type TEXT NOT NULL DEFAULT 'new',
        is_blocked BOOLEAN NOT NULL DEFAULT FALSE,
        is_paid BOOLEAN NOT NULL DEFAULT FALSE,
        reminder_step SMALLINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        last_seen TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE TABLE IF NOT EXISTS tickets (
        ticket_id SERIAL PRIMARY KEY,
        client_user_id BIGINT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
        status TEXT NOT NULL DEFAULT 'OPEN',
        assigned_to_support_id BIGINT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        taken_at TIMESTAMPTZ,
        first_reply_at TIMESTAMPTZ,
        closed_at TIMESTAMPTZ,
        sla_stage SMALLINT NOT NULL DEFAULT 0,
        support_thread_id BIGINT,
        card_message_id BIGINT,
        topic_card_message_id BIGINT
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_tickets_active_client
        ON tickets (client_user_id) WHERE status IN ('OPEN', 'WAITING');
    CREATE INDEX IF NOT EXISTS idx_tickets_sla_pending
        ON tickets (created_at) WHERE first_reply_at IS NULL;

    CREATE TABLE IF NOT EXISTS ticket_messages (
        message_id SERIAL PRIMARY KEY,
        ticket_id INTEGER NOT NULL REFERENCES tickets(ticket_id) ON DELETE CASCADE,
        direction TEXT NOT NULL,
        author_user_id BIGINT,
        text TEXT,
        media_type TEXT,
        media_file_id TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE INDEX IF NOT EXISTS idx_ticket_messages_ticket
        ON ticket_messages (ticket_id, created_at);
"#;

pub struct PgRepository {
    pool: DbPool,
}

impl PgRepository {
    pub fn connect(database_url: &str) -> Result<Self> {
        Ok(Self {
            pool: create_conn(database_url)?,
        })
    }

    pub fn with_pool(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes on startup; safe to run repeatedly.
    pub fn ensure_schema(&self) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| StorageError::Pool(e.to_string()))?;
        diesel::connection::SimpleConnection::batch_execute(&mut *conn, SCHEMA_SQL)
            .map_err(|e| StorageError::Database(e.to_string()))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| StorageError::Pool(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StorageError::Database(format!("blocking task failed: {e}")))?
    }
}

#[derive(QueryableByName)]
struct TicketIdRow {
    #[diesel(sql_type = Integer)]
    ticket_id: i32,
}

#[derive(QueryableByName)]
struct PresentRow {
    #[diesel(sql_type = diesel::sql_types::Bool)]
    present: bool,
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    total: i64,
}

#[derive(QueryableByName)]
struct AvgRow {
    #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Double>)]
    avg: Option<f64>,
}

#[derive(QueryableByName)]
struct OverviewRow {
    #[diesel(sql_type = Integer)]
    ticket_id: i32,
    #[diesel(sql_type = Text)]
    status: String,
    #[diesel(sql_type = BigInt)]
    client_user_id: i64,
    #[diesel(sql_type = diesel::sql_types::Nullable<BigInt>)]
    assigned_to_support_id: Option<i64>,
    #[diesel(sql_type = diesel::sql_types::Nullable<Text>)]
    client_username: Option<String>,
    #[diesel(sql_type = diesel::sql_types::Nullable<Text>)]
    support_username: Option<String>,
}

#[derive(QueryableByName)]
struct MessageRow {
    #[diesel(sql_type = Integer)]
    message_id: i32,
    #[diesel(sql_type = Integer)]
    ticket_id: i32,
    #[diesel(sql_type = Text)]
    direction: String,
    #[diesel(sql_type = diesel::sql_types::Nullable<BigInt>)]
    author_user_id: Option<i64>,
    #[diesel(sql_type = diesel::sql_types::Nullable<Text>)]
    text: Option<String>,
    #[diesel(sql_type = diesel::sql_types::Nullable<Text>)]
    media_type: Option<String>,
    #[diesel(sql_type = diesel::sql_types::Nullable<Text>)]
    media_file_id: Option<String>,
    #[diesel(sql_type = Timestamptz)]
    created_at: DateTime<Utc>,
    #[diesel(sql_type = diesel::sql_types::Nullable<Text>)]
    username: Option<String>,
}

impl From<MessageRow> for MessageWithAuthor {
    fn from(row: MessageRow) -> Self {
        Self {
            message: TicketMessage {
                message_id: row.message_id,
                ticket_id: row.ticket_id,
                direction: row.direction,
                author_user_id: row.author_user_id,
                text: row.text,
                media_type: row.media_type,
                media_file_id: row.media_file_id,
                created_at: row.created_at,
            },
            username: row.username,
        }
    }
}

#[async_trait]
impl TicketRepository for PgRepository {
    async fn get_or_create_user(
        &self,
        uid: i64,
        name: Option<String>,
        admin_ids: &[i64],
    ) -> Result<User> {
        let is_bootstrap_admin = admin_ids.contains(&uid);
        self.blocking(move |conn| {
            let existing: Option<User> = users::table
                .filter(users::user_id.eq(uid))
                .first(conn)
                .optional()?;

            if existing.is_some() {
                diesel::update(users::table.filter(users::user_id.eq(uid)))
                    .set(users::last_seen.eq(Utc::now()))
                    .execute(conn)?;
                if let Some(name) = name {
                    diesel::update(users::table.filter(users::user_id.eq(uid)))
                        .set(users::username.eq(name))
                        .execute(conn)?;
                }
                return Ok(users::table.filter(users::user_id.eq(uid)).first(conn)?);
            }

            let role = if is_bootstrap_admin {
                Role::Admin
            } else {
                Role::Client
            };
            let now = Utc::now();
            let user = User {
                user_id: uid,
                username: name,
                role: role.to_string(),
                client_type: ClientType::New.to_string(),
                is_blocked: false,
                is_paid: false,
                reminder_step: 0,
                created_at: now,
                last_seen: now,
            };
            // A concurrent first contact may have inserted already.
            diesel::insert_into(users::table)
                .values(&user)
                .on_conflict(users::user_id)
                .do_nothing()
                .execute(conn)?;
            Ok(users::table.filter(users::user_id.eq(uid)).first(conn)?)
        })
        .await
    }

    async fn get_user(&self, uid: i64) -> Result<Option<User>> {
        self.blocking(move |conn| {
            Ok(users::table
                .filter(users::user_id.eq(uid))
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn set_role(&self, uid: i64, role: Role) -> Result<()> {
        self.blocking(move |conn| {
            let now = Utc::now();
            let user = User {
                user_id: uid,
                username: None,
                role: role.to_string(),
                client_type: ClientType::New.to_string(),
                is_blocked: false,
                is_paid: false,
                reminder_step: 0,
                created_at: now,
                last_seen: now,
            };
            diesel::insert_into(users::table)
                .values(&user)
                .on_conflict(users::user_id)
                .do_update()
                .set(users::role.eq(role.to_string()))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn set_client_type(&self, uid: i64, client_type: ClientType) -> Result<()> {
        self.blocking(move |conn| {
            // Guarded advance: new -> lead -> existing only.
            let allowed_from: Vec<&str> = match client_type {
                ClientType::New => vec![],
                ClientType::Lead => vec!["new"],
                ClientType::Existing => vec!["new", "lead"],
            };
            if allowed_from.is_empty() {
                return Ok(());
            }
            diesel::update(
                users::table
                    .filter(users::user_id.eq(uid))
                    .filter(users::client_type.eq_any(allowed_from)),
            )
            .set(users::client_type.eq(client_type.to_string()))
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn mark_user_paid(&self, uid: i64) -> Result<()> {
        self.blocking(move |conn| {
            diesel::update(users::table.filter(users::user_id.eq(uid)))
                .set((
                    users::is_paid.eq(true),
                    users::client_type.eq(ClientType::Existing.to_string()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn username(&self, uid: i64) -> Result<Option<String>> {
        self.blocking(move |conn| {
            Ok(users::table
                .filter(users::user_id.eq(uid))
                .select(users::username)
                .first::<Option<String>>(conn)
                .optional()?
                .flatten())
        })
        .await
    }

    async fn users_due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<User>> {
        self.blocking(move |conn| {
            let cutoff = now - Duration::days(7);
            Ok(sql_query(
                "SELECT u.* FROM users u \
                 WHERE u.client_type = 'new' \
                   AND u.reminder_step < 5 \
                   AND u.created_at > $1 \
                   AND NOT EXISTS ( \
                       SELECT 1 FROM tickets t WHERE t.client_user_id = u.user_id \
                   ) \
                 ORDER BY u.user_id",
            )
            .bind::<Timestamptz, _>(cutoff)
            .load::<User>(conn)?)
        })
        .await
    }

    async fn any_support_reply(&self, uid: i64) -> Result<bool> {
        self.blocking(move |conn| {
            let row: PresentRow = sql_query(
                "SELECT EXISTS ( \
                     SELECT 1 FROM ticket_messages m \
                     JOIN tickets t ON t.ticket_id = m.ticket_id \
                     WHERE t.client_user_id = $1 AND m.direction = 'OUT' \
                 ) AS present",
            )
            .bind::<BigInt, _>(uid)
            .get_result(conn)?;
            Ok(row.present)
        })
        .await
    }

    async fn increment_reminder_step(&self, uid: i64) -> Result<()> {
        self.blocking(move |conn| {
            diesel::update(users::table.filter(users::user_id.eq(uid)))
                .set(users::reminder_step.eq(users::reminder_step + 1))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn get_or_create_active_ticket(&self, client_id: i64) -> Result<(i32, bool)> {
        self.blocking(move |conn| {
            let existing: Option<i32> = tickets::table
                .filter(tickets::client_user_id.eq(client_id))
                .filter(tickets::status.eq_any(["OPEN", "WAITING"]))
                .select(tickets::ticket_id)
                .first(conn)
                .optional()?;
            if let Some(ticket_id) = existing {
                return Ok((ticket_id, false));
            }

            // The partial unique index on active tickets makes the insert
            // race-safe; a concurrent creator wins the conflict and we read
            // their row back.
            let inserted: Option<TicketIdRow> = sql_query(
                "INSERT INTO tickets (client_user_id, status) VALUES ($1, 'OPEN') \
                 ON CONFLICT (client_user_id) WHERE status IN ('OPEN', 'WAITING') \
                 DO NOTHING \
                 RETURNING ticket_id",
            )
            .bind::<BigInt, _>(client_id)
            .get_result(conn)
            .optional()?;

            if let Some(row) = inserted {
                return Ok((row.ticket_id, true));
            }
            let ticket_id: i32 = tickets::table
                .filter(tickets::client_user_id.eq(client_id))
                .filter(tickets::status.eq_any(["OPEN", "WAITING"]))
                .select(tickets::ticket_id)
                .first(conn)?;
            Ok((ticket_id, false))
        })
        .await
    }

    async fn get_ticket(&self, tid: i32) -> Result<Option<Ticket>> {
        self.blocking(move |conn| {
            Ok(tickets::table
                .filter(tickets::ticket_id.eq(tid))
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn active_ticket_for_client(&self, client_id: i64) -> Result<Option<Ticket>> {
        self.blocking(move |conn| {
            Ok(tickets::table
                .filter(tickets::client_user_id.eq(client_id))
                .filter(tickets::status.eq_any(["OPEN", "WAITING"]))
                .order(tickets::created_at.desc())
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn take_ticket(&self, tid: i32, support_id: i64) -> Result<bool> {
        self.blocking(move |conn| {
            // Single guarded UPDATE: the row count is the compare-and-set
            // verdict, so two concurrent claims cannot both succeed.
            let updated = diesel::update(
                tickets::table
                    .filter(tickets::ticket_id.eq(tid))
                    .filter(tickets::assigned_to_support_id.is_null()),
            )
            .set((
                tickets::assigned_to_support_id.eq(support_id),
                tickets::taken_at.eq(Utc::now()),
                tickets::status.eq(TicketStatus::Waiting.to_string()),
            ))
            .execute(conn)?;
            Ok(updated == 1)
        })
        .await
    }

    async fn set_first_reply_if_needed(&self, tid: i32) -> Result<()> {
        self.blocking(move |conn| {
            sql_query(
                "UPDATE tickets \
                 SET first_reply_at = COALESCE(first_reply_at, NOW()), sla_stage = 0 \
                 WHERE ticket_id = $1",
            )
            .bind::<Integer, _>(tid)
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn update_ticket_status(&self, tid: i32, status: TicketStatus) -> Result<()> {
        self.blocking(move |conn| {
            match status {
                TicketStatus::Closed => {
                    diesel::update(tickets::table.filter(tickets::ticket_id.eq(tid)))
                        .set((
                            tickets::status.eq(status.to_string()),
                            tickets::closed_at.eq(Utc::now()),
                        ))
                        .execute(conn)?;
                }
                _ => {
                    diesel::update(tickets::table.filter(tickets::ticket_id.eq(tid)))
                        .set((
                            tickets::status.eq(status.to_string()),
                            tickets::closed_at.eq(None::<DateTime<Utc>>),
                        ))
                        .execute(conn)?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn tickets_for_sla_check(&self) -> Result<Vec<Ticket>> {
        self.blocking(move |conn| {
            Ok(tickets::table
                .filter(tickets::first_reply_at.is_null())
                .filter(tickets::status.eq_any(["OPEN", "WAITING"]))
                .order(tickets::ticket_id.asc())
                .load(conn)?)
        })
        .await
    }

    async fn update_sla_stage(&self, tid: i32, stage: i16) -> Result<()> {
        self.blocking(move |conn| {
            diesel::update(
                tickets::table
                    .filter(tickets::ticket_id.eq(tid))
                    .filter(tickets::sla_stage.lt(stage)),
            )
            .set(tickets::sla_stage.eq(stage))
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn tickets_by_status(&self, status: TicketStatus) -> Result<Vec<TicketOverview>> {
        self.blocking(move |conn| {
            let rows: Vec<OverviewRow> = sql_query(
                "SELECT t.ticket_id, t.status, t.client_user_id, t.assigned_to_support_id, \
                        uc.username AS client_username, us.username AS support_username \
                 FROM tickets t \
                 LEFT JOIN users uc ON uc.user_id = t.client_user_id \
                 LEFT JOIN users us ON us.user_id = t.assigned_to_support_id \
                 WHERE t.status = $1 \
                 ORDER BY t.created_at ASC",
            )
            .bind::<Text, _>(status.to_string())
            .load(conn)?;
            Ok(rows
                .into_iter()
                .map(|r| TicketOverview {
                    ticket_id: r.ticket_id,
                    status: r.status,
                    client_user_id: r.client_user_id,
                    assigned_to_support_id: r.assigned_to_support_id,
                    client_username: r.client_username,
                    support_username: r.support_username,
                })
                .collect())
        })
        .await
    }

    async fn support_active_tickets(&self, support_id: i64) -> Result<Vec<Ticket>> {
        self.blocking(move |conn| {
            Ok(tickets::table
                .filter(tickets::assigned_to_support_id.eq(support_id))
                .filter(tickets::status.eq(TicketStatus::Waiting.to_string()))
                .order(tickets::taken_at.asc())
                .load(conn)?)
        })
        .await
    }

    async fn ticket_by_thread(&self, thread_id: i64) -> Result<Option<Ticket>> {
        self.blocking(move |conn| {
            Ok(tickets::table
                .filter(tickets::support_thread_id.eq(thread_id))
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn set_thread_id(&self, tid: i32, thread_id: i64) -> Result<()> {
        self.blocking(move |conn| {
            diesel::update(tickets::table.filter(tickets::ticket_id.eq(tid)))
                .set(tickets::support_thread_id.eq(thread_id))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn set_card_message_id(&self, tid: i32, message_id: Option<i64>) -> Result<()> {
        self.blocking(move |conn| {
            diesel::update(tickets::table.filter(tickets::ticket_id.eq(tid)))
                .set(tickets::card_message_id.eq(message_id))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn set_topic_card_message_id(&self, tid: i32, message_id: i64) -> Result<()> {
        self.blocking(move |conn| {
            diesel::update(tickets::table.filter(tickets::ticket_id.eq(tid)))
                .set(tickets::topic_card_message_id.eq(message_id))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn add_message(&self, message: NewMessage) -> Result<()> {
        self.blocking(move |conn| {
            let MessageContent {
                text,
                media_type,
                media_file_id,
            } = message.content;
            diesel::insert_into(ticket_messages::table)
                .values((
                    ticket_messages::ticket_id.eq(message.ticket_id),
                    ticket_messages::direction.eq(message.direction.to_string()),
                    ticket_messages::author_user_id.eq(message.author_user_id),
                    ticket_messages::text.eq(text),
                    ticket_messages::media_type.eq(media_type),
                    ticket_messages::media_file_id.eq(media_file_id),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn ticket_messages(&self, tid: i32, limit: i64) -> Result<Vec<MessageWithAuthor>> {
        self.blocking(move |conn| {
            let rows: Vec<MessageRow> = sql_query(
                "SELECT m.message_id, m.ticket_id, m.direction, m.author_user_id, \
                        m.text, m.media_type, m.media_file_id, m.created_at, u.username \
                 FROM ticket_messages m \
                 LEFT JOIN users u ON u.user_id = m.author_user_id \
                 WHERE m.ticket_id = $1 \
                 ORDER BY m.created_at DESC, m.message_id DESC \
                 LIMIT $2",
            )
            .bind::<Integer, _>(tid)
            .bind::<BigInt, _>(limit)
            .load(conn)?;
            let mut history: Vec<MessageWithAuthor> =
                rows.into_iter().map(MessageWithAuthor::from).collect();
            history.reverse();
            Ok(history)
        })
        .await
    }

    async fn tickets_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64> {
        self.blocking(move |conn| {
            Ok(tickets::table
                .filter(tickets::created_at.between(from, to))
                .count()
                .get_result(conn)?)
        })
        .await
    }

    async fn avg_first_reply_seconds(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        self.blocking(move |conn| {
            let row: AvgRow = sql_query(
                "SELECT AVG(EXTRACT(EPOCH FROM (first_reply_at - created_at)))::float8 AS avg \
                 FROM tickets \
                 WHERE first_reply_at IS NOT NULL AND created_at BETWEEN $1 AND $2",
            )
            .bind::<Timestamptz, _>(from)
            .bind::<Timestamptz, _>(to)
            .get_result(conn)?;
            Ok(row.avg.map(|secs| secs as i64))
        })
        .await
    }

    async fn sla_violations(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        sla_minutes: i64,
    ) -> Result<i64> {
        self.blocking(move |conn| {
            let row: CountRow = sql_query(
                "SELECT COUNT(*) AS total \
                 FROM tickets \
                 WHERE first_reply_at IS NOT NULL \
                   AND created_at BETWEEN $1 AND $2 \
                   AND (first_reply_at - created_at) > ($3 * INTERVAL '1 minute')",
            )
            .bind::<Timestamptz, _>(from)
            .bind::<Timestamptz, _>(to)
            .bind::<BigInt, _>(sla_minutes)
            .get_result(conn)?;
            Ok(row.total)
        })
        .await
    }

    async fn avg_messages_before_reply(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        self.blocking(move |conn| {
            let row: AvgRow = sql_query(
                "SELECT AVG(msg_count)::float8 AS avg FROM ( \
                     SELECT t.ticket_id, COUNT(m.*) AS msg_count \
                     FROM tickets t \
                     LEFT JOIN ticket_messages m \
                         ON m.ticket_id = t.ticket_id \
                        AND m.direction = 'IN' \
                        AND m.created_at <= t.first_reply_at \
                     WHERE t.first_reply_at IS NOT NULL \
                       AND t.created_at BETWEEN $1 AND $2 \
                     GROUP BY t.ticket_id \
                 ) sub",
            )
            .bind::<Timestamptz, _>(from)
            .bind::<Timestamptz, _>(to)
            .get_result(conn)?;
            Ok(row.avg)
        })
        .await
    }
}
