//! In-memory repository: the whole store sits behind one mutex, which makes
//! the get-or-create and take-ticket atomicity requirements trivial. Used by
//! the test suite and as the fallback backend when no DATABASE_URL is set.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::shared::models::{
    ClientType, MessageWithAuthor, NewMessage, Role, Ticket, TicketMessage, TicketOverview,
    TicketStatus, User,
};
use crate::storage::{Result, TicketRepository};

#[derive(Default)]
struct Store {
    users: HashMap<i64, User>,
    tickets: HashMap<i32, Ticket>,
    messages: Vec<TicketMessage>,
    next_ticket_id: i32,
    next_message_id: i32,
}

#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<Store>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        // A poisoned lock means a panicked test thread; the data is still
        // consistent for our append/overwrite patterns.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn username_of(store: &Store, user_id: Option<i64>) -> Option<String> {
    user_id
        .and_then(|id| store.users.get(&id))
        .and_then(|u| u.username.clone())
}

#[async_trait]
impl TicketRepository for MemoryRepository {
    async fn get_or_create_user(
        &self,
        user_id: i64,
        username: Option<String>,
        admin_ids: &[i64],
    ) -> Result<User> {
        let mut store = self.lock();
        let now = Utc::now();
        if let Some(user) = store.users.get_mut(&user_id) {
            if username.is_some() {
                user.username = username;
            }
            user.last_seen = now;
            return Ok(user.clone());
        }
        let role = if admin_ids.contains(&user_id) {
            Role::Admin
        } else {
            Role::Client
        };
        let user = User {
            user_id,
            username,
            role: role.to_string(),
            client_type: ClientType::New.to_string(),
            is_blocked: false,
            is_paid: false,
            reminder_step: 0,
            created_at: now,
            last_seen: now,
        };
        store.users.insert(user_id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        Ok(self.lock().users.get(&user_id).cloned())
    }

    async fn set_role(&self, user_id: i64, role: Role) -> Result<()> {
        let mut store = self.lock();
        let now = Utc::now();
        store
            .users
            .entry(user_id)
            .and_modify(|u| u.role = role.to_string())
            .or_insert_with(|| User {
                user_id,
                username: None,
                role: role.to_string(),
                client_type: ClientType::New.to_string(),
                is_blocked: false,
                is_paid: false,
                reminder_step: 0,
                created_at: now,
                last_seen: now,
            });
        Ok(())
    }

    async fn set_client_type(&self, user_id: i64, client_type: ClientType) -> Result<()> {
        let mut store = self.lock();
        if let Some(user) = store.users.get_mut(&user_id) {
            if client_type.rank() > user.client_kind().rank() {
                user.client_type = client_type.to_string();
            }
        }
        Ok(())
    }

    async fn mark_user_paid(&self, user_id: i64) -> Result<()> {
        let mut store = self.lock();
        if let Some(user) = store.users.get_mut(&user_id) {
            user.is_paid = true;
            if ClientType::Existing.rank() > user.client_kind().rank() {
                user.client_type = ClientType::Existing.to_string();
            }
        }
        Ok(())
    }

    async fn username(&self, user_id: i64) -> Result<Option<String>> {
        Ok(self
            .lock()
            .users
            .get(&user_id)
            .and_then(|u| u.username.clone()))
    }

    async fn users_due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<User>> {
        let store = self.lock();
        let cutoff = now - Duration::days(7);
        let mut due: Vec<User> = store
            .users
            .values()
            .filter(|u| {
                u.client_kind() == ClientType::New
                    && u.reminder_step < 5
                    && u.created_at > cutoff
                    && !store
                        .tickets
                        .values()
                        .any(|t| t.client_user_id == u.user_id)
            })
            .cloned()
            .collect();
        due.sort_by_key(|u| u.user_id);
        Ok(due)
    }

    async fn any_support_reply(&self, user_id: i64) -> Result<bool> {
        let store = self.lock();
        Ok(store.messages.iter().any(|m| {
            m.direction == "OUT"
                && store
                    .tickets
                    .get(&m.ticket_id)
                    .is_some_and(|t| t.client_user_id == user_id)
        }))
    }

    async fn increment_reminder_step(&self, user_id: i64) -> Result<()> {
        let mut store = self.lock();
        if let Some(user) = store.users.get_mut(&user_id) {
            user.reminder_step += 1;
        }
        Ok(())
    }

    async fn get_or_create_active_ticket(&self, client_id: i64) -> Result<(i32, bool)> {
        let mut store = self.lock();
        if let Some(existing) = store
            .tickets
            .values()
            .find(|t| t.client_user_id == client_id && t.is_active())
        {
            return Ok((existing.ticket_id, false));
        }
        store.next_ticket_id += 1;
        let ticket_id = store.next_ticket_id;
        let ticket = Ticket {
            ticket_id,
            client_user_id: client_id,
            status: TicketStatus::Open.to_string(),
            assigned_to_support_id: None,
            created_at: Utc::now(),
            taken_at: None,
            first_reply_at: None,
            closed_at: None,
            sla_stage: 0,
            support_thread_id: None,
            card_message_id: None,
            topic_card_message_id: None,
        };
        store.tickets.insert(ticket_id, ticket);
        Ok((ticket_id, true))
    }

    async fn get_ticket(&self, ticket_id: i32) -> Result<Option<Ticket>> {
        Ok(self.lock().tickets.get(&ticket_id).cloned())
    }

    async fn active_ticket_for_client(&self, client_id: i64) -> Result<Option<Ticket>> {
        let store = self.lock();
        let mut active: Vec<&Ticket> = store
            .tickets
            .values()
            .filter(|t| t.client_user_id == client_id && t.is_active())
            .collect();
        active.sort_by_key(|t| std::cmp::Reverse(t.created_at));
        Ok(active.first().map(|t| (*t).clone()))
    }

    async fn take_ticket(&self, ticket_id: i32, support_id: i64) -> Result<bool> {
        let mut store = self.lock();
        let Some(ticket) = store.tickets.get_mut(&ticket_id) else {
            return Ok(false);
        };
        if ticket.assigned_to_support_id.is_some() {
            return Ok(false);
        }
        ticket.assigned_to_support_id = Some(support_id);
        ticket.taken_at = Some(Utc::now());
        ticket.status = TicketStatus::Waiting.to_string();
        Ok(true)
    }

    async fn set_first_reply_if_needed(&self, ticket_id: i32) -> Result<()> {
        let mut store = self.lock();
        if let Some(ticket) = store.tickets.get_mut(&ticket_id) {
            if ticket.first_reply_at.is_none() {
                ticket.first_reply_at = Some(Utc::now());
            }
            ticket.sla_stage = 0;
        }
        Ok(())
    }

    async fn update_ticket_status(&self, ticket_id: i32, status: TicketStatus) -> Result<()> {
        let mut store = self.lock();
        if let Some(ticket) = store.tickets.get_mut(&ticket_id) {
            ticket.status = status.to_string();
            ticket.closed_at = match status {
                TicketStatus::Closed => Some(Utc::now()),
                _ => None,
            };
        }
        Ok(())
    }

    async fn tickets_for_sla_check(&self) -> Result<Vec<Ticket>> {
        let store = self.lock();
        let mut pending: Vec<Ticket> = store
            .tickets
            .values()
            .filter(|t| t.first_reply_at.is_none() && t.is_active())
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.ticket_id);
        Ok(pending)
    }

    async fn update_sla_stage(&self, ticket_id: i32, stage: i16) -> Result<()> {
        let mut store = self.lock();
        if let Some(ticket) = store.tickets.get_mut(&ticket_id) {
            if stage > ticket.sla_stage {
                ticket.sla_stage = stage;
            }
        }
        Ok(())
    }

    async fn tickets_by_status(&self, status: TicketStatus) -> Result<Vec<TicketOverview>> {
        let store = self.lock();
        let mut rows: Vec<&Ticket> = store
            .tickets
            .values()
            .filter(|t| t.status_kind() == status)
            .collect();
        rows.sort_by_key(|t| (t.created_at, t.ticket_id));
        Ok(rows
            .into_iter()
            .map(|t| TicketOverview {
                ticket_id: t.ticket_id,
                status: t.status.clone(),
                client_user_id: t.client_user_id,
                assigned_to_support_id: t.assigned_to_support_id,
                client_username: username_of(&store, Some(t.client_user_id)),
                support_username: username_of(&store, t.assigned_to_support_id),
            })
            .collect())
    }

    async fn support_active_tickets(&self, support_id: i64) -> Result<Vec<Ticket>> {
        let store = self.lock();
        let mut rows: Vec<Ticket> = store
            .tickets
            .values()
            .filter(|t| {
                t.assigned_to_support_id == Some(support_id)
                    && t.status_kind() == TicketStatus::Waiting
            })
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.taken_at);
        Ok(rows)
    }

    async fn ticket_by_thread(&self, thread_id: i64) -> Result<Option<Ticket>> {
        Ok(self
            .lock()
            .tickets
            .values()
            .find(|t| t.support_thread_id == Some(thread_id))
            .cloned())
    }

    async fn set_thread_id(&self, ticket_id: i32, thread_id: i64) -> Result<()> {
        let mut store = self.lock();
        if let Some(ticket) = store.tickets.get_mut(&ticket_id) {
            ticket.support_thread_id = Some(thread_id);
        }
        Ok(())
    }

    async fn set_card_message_id(&self, ticket_id: i32, message_id: Option<i64>) -> Result<()> {
        let mut store = self.lock();
        if let Some(ticket) = store.tickets.get_mut(&ticket_id) {
            ticket.card_message_id = message_id;
        }
        Ok(())
    }

    async fn set_topic_card_message_id(&self, ticket_id: i32, message_id: i64) -> Result<()> {
        let mut store = self.lock();
        if let Some(ticket) = store.tickets.get_mut(&ticket_id) {
            ticket.topic_card_message_id = Some(message_id);
        }
        Ok(())
    }

    async fn add_message(&self, message: NewMessage) -> Result<()> {
        let mut store = self.lock();
        store.next_message_id += 1;
        let row = TicketMessage {
            message_id: store.next_message_id,
            ticket_id: message.ticket_id,
            direction: message.direction.to_string(),
            author_user_id: message.author_user_id,
            text: message.content.text,
            media_type: message.content.media_type,
            media_file_id: message.content.media_file_id,
            created_at: Utc::now(),
        };
        store.messages.push(row);
        Ok(())
    }

    async fn ticket_messages(&self, ticket_id: i32, limit: i64) -> Result<Vec<MessageWithAuthor>> {
        let store = self.lock();
        let mut rows: Vec<&TicketMessage> = store
            .messages
            .iter()
            .filter(|m| m.ticket_id == ticket_id)
            .collect();
        rows.sort_by_key(|m| (m.created_at, m.message_id));
        let skip = rows.len().saturating_sub(limit.max(0) as usize);
        Ok(rows
            .into_iter()
            .skip(skip)
            .map(|m| MessageWithAuthor {
                message: m.clone(),
                username: username_of(&store, m.author_user_id),
            })
            .collect())
    }

    async fn tickets_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64> {
        let store = self.lock();
        Ok(store
            .tickets
            .values()
            .filter(|t| t.created_at >= from && t.created_at <= to)
            .count() as i64)
    }

    async fn avg_first_reply_seconds(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let store = self.lock();
        let samples: Vec<i64> = store
            .tickets
            .values()
            .filter(|t| t.created_at >= from && t.created_at <= to)
            .filter_map(|t| {
                t.first_reply_at
                    .map(|reply| (reply - t.created_at).num_seconds())
            })
            .collect();
        if samples.is_empty() {
            return Ok(None);
        }
        Ok(Some(samples.iter().sum::<i64>() / samples.len() as i64))
    }

    async fn sla_violations(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        sla_minutes: i64,
    ) -> Result<i64> {
        let store = self.lock();
        Ok(store
            .tickets
            .values()
            .filter(|t| t.created_at >= from && t.created_at <= to)
            .filter(|t| {
                t.first_reply_at
                    .is_some_and(|reply| (reply - t.created_at).num_minutes() > sla_minutes)
            })
            .count() as i64)
    }

    async fn avg_messages_before_reply(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        let store = self.lock();
        let counts: Vec<usize> = store
            .tickets
            .values()
            .filter(|t| t.created_at >= from && t.created_at <= to)
            .filter_map(|t| {
                let reply_at = t.first_reply_at?;
                Some(
                    store
                        .messages
                        .iter()
                        .filter(|m| {
                            m.ticket_id == t.ticket_id
                                && m.direction == "IN"
                                && m.created_at <= reply_at
                        })
                        .count(),
                )
            })
            .collect();
        if counts.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            counts.iter().sum::<usize>() as f64 / counts.len() as f64,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::Direction;
    use crate::shared::models::MessageContent;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_single_active_ticket_per_client() {
        let repo = MemoryRepository::new();
        let (first, is_new) = repo.get_or_create_active_ticket(42).await.unwrap();
        assert!(is_new);
        let (second, is_new) = repo.get_or_create_active_ticket(42).await.unwrap();
        assert!(!is_new);
        assert_eq!(first, second);

        repo.update_ticket_status(first, TicketStatus::Closed)
            .await
            .unwrap();
        let (third, is_new) = repo.get_or_create_active_ticket(42).await.unwrap();
        assert!(is_new);
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_yields_one_ticket() {
        let repo = Arc::new(MemoryRepository::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let repo = Arc::clone(&repo);
            handles.push(tokio::spawn(async move {
                repo.get_or_create_active_ticket(7).await.unwrap()
            }));
        }
        let mut created = 0;
        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            let (id, is_new) = handle.await.unwrap();
            ids.insert(id);
            if is_new {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn test_take_ticket_is_compare_and_set() {
        let repo = Arc::new(MemoryRepository::new());
        let (ticket_id, _) = repo.get_or_create_active_ticket(1).await.unwrap();

        let a = {
            let repo = Arc::clone(&repo);
            tokio::spawn(async move { repo.take_ticket(ticket_id, 100).await.unwrap() })
        };
        let b = {
            let repo = Arc::clone(&repo);
            tokio::spawn(async move { repo.take_ticket(ticket_id, 200).await.unwrap() })
        };
        let (won_a, won_b) = (a.await.unwrap(), b.await.unwrap());
        assert!(won_a ^ won_b, "exactly one concurrent take must win");

        let ticket = repo.get_ticket(ticket_id).await.unwrap().unwrap();
        assert_eq!(ticket.status, "WAITING");
        assert!(ticket.taken_at.is_some());
        let winner = ticket.assigned_to_support_id.unwrap();
        assert!(winner == 100 || winner == 200);
    }

    #[tokio::test]
    async fn test_first_reply_idempotent_and_resets_stage() {
        let repo = MemoryRepository::new();
        let (ticket_id, _) = repo.get_or_create_active_ticket(5).await.unwrap();
        repo.update_sla_stage(ticket_id, 2).await.unwrap();

        repo.set_first_reply_if_needed(ticket_id).await.unwrap();
        let first = repo.get_ticket(ticket_id).await.unwrap().unwrap();
        assert_eq!(first.sla_stage, 0);
        let stamp = first.first_reply_at.unwrap();

        repo.set_first_reply_if_needed(ticket_id).await.unwrap();
        let second = repo.get_ticket(ticket_id).await.unwrap().unwrap();
        assert_eq!(second.first_reply_at.unwrap(), stamp);
    }

    #[tokio::test]
    async fn test_sla_stage_never_lowers() {
        let repo = MemoryRepository::new();
        let (ticket_id, _) = repo.get_or_create_active_ticket(5).await.unwrap();
        repo.update_sla_stage(ticket_id, 2).await.unwrap();
        repo.update_sla_stage(ticket_id, 1).await.unwrap();
        let ticket = repo.get_ticket(ticket_id).await.unwrap().unwrap();
        assert_eq!(ticket.sla_stage, 2);
    }

    #[tokio::test]
    async fn test_client_type_never_regresses() {
        let repo = MemoryRepository::new();
        repo.get_or_create_user(9, Some("ada".into()), &[])
            .await
            .unwrap();
        repo.set_client_type(9, ClientType::Existing).await.unwrap();
        repo.set_client_type(9, ClientType::Lead).await.unwrap();
        let user = repo.get_user(9).await.unwrap().unwrap();
        assert_eq!(user.client_type, "existing");
    }

    #[tokio::test]
    async fn test_reopen_clears_closed_at() {
        let repo = MemoryRepository::new();
        let (ticket_id, _) = repo.get_or_create_active_ticket(3).await.unwrap();
        repo.update_ticket_status(ticket_id, TicketStatus::Closed)
            .await
            .unwrap();
        assert!(repo
            .get_ticket(ticket_id)
            .await
            .unwrap()
            .unwrap()
            .closed_at
            .is_some());
        repo.update_ticket_status(ticket_id, TicketStatus::Open)
            .await
            .unwrap();
        assert!(repo
            .get_ticket(ticket_id)
            .await
            .unwrap()
            .unwrap()
            .closed_at
            .is_none());
    }

    #[tokio::test]
    async fn test_reminder_candidates_exclude_ticket_owners() {
        let repo = MemoryRepository::new();
        repo.get_or_create_user(1, Some("quiet".into()), &[])
            .await
            .unwrap();
        repo.get_or_create_user(2, Some("asked".into()), &[])
            .await
            .unwrap();
        repo.get_or_create_active_ticket(2).await.unwrap();

        let due = repo.users_due_reminders(Utc::now()).await.unwrap();
        let ids: Vec<i64> = due.iter().map(|u| u.user_id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn test_history_order_and_limit() {
        let repo = MemoryRepository::new();
        repo.get_or_create_user(1, Some("c".into()), &[]).await.unwrap();
        let (ticket_id, _) = repo.get_or_create_active_ticket(1).await.unwrap();
        for i in 0..5 {
            repo.add_message(NewMessage {
                ticket_id,
                direction: Direction::In,
                author_user_id: Some(1),
                content: MessageContent::text(format!("m{i}")),
            })
            .await
            .unwrap();
        }
        let history = repo.ticket_messages(ticket_id, 3).await.unwrap();
        let texts: Vec<&str> = history
            .iter()
            .map(|m| m.message.text.as_deref().unwrap())
            .collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
    }
}
