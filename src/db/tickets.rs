use super::{current_unix_timestamp, Db};
use serde::Serialize;
use sqlx::FromRow;

pub const TICKET_OPEN: &str = "open";
pub const TICKET_ANSWERED: &str = "answered";
pub const TICKET_CLOSED: &str = "closed";

const TICKET_COLUMNS: &str = "id, user_id, title, status, created_at, updated_at, closed_at";
const TITLE_MAX_CHARS: usize = 60;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Ticket {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub closed_at: Option<i64>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TicketMessage {
    pub id: i64,
    pub ticket_id: i64,
    pub user_id: Option<i64>,
    pub is_from_admin: bool,
    pub text: String,
    pub created_at: i64,
}

pub fn is_valid_ticket_status(status: &str) -> bool {
    matches!(status, TICKET_OPEN | TICKET_ANSWERED | TICKET_CLOSED)
}

fn title_from_text(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    if first_line.chars().count() > TITLE_MAX_CHARS {
        format!(
            "{}...",
            first_line.chars().take(TITLE_MAX_CHARS - 3).collect::<String>()
        )
    } else if first_line.is_empty() {
        "Обращение".to_string()
    } else {
        first_line.to_string()
    }
}

impl Db {
    /// Новое обращение; заголовок берётся из первой строки текста.
    pub async fn create_ticket(&self, user_id: i64, text: &str) -> Result<Ticket, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "INSERT INTO tickets (user_id, title, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(title_from_text(text))
        .bind(TICKET_OPEN)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let ticket_id = result.last_insert_rowid();

        sqlx::query(
            "INSERT INTO ticket_messages (ticket_id, user_id, is_from_admin, text, created_at) VALUES (?, ?, 0, ?, ?)",
        )
        .bind(ticket_id)
        .bind(user_id)
        .bind(text)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_ticket(ticket_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("только что создали тикет"))
    }

    /// Последнее незакрытое обращение пользователя.
    pub async fn find_open_ticket(&self, user_id: i64) -> Result<Option<Ticket>, anyhow::Error> {
        let row = sqlx::query_as::<_, Ticket>(&format!(
            "SELECT {} FROM tickets WHERE user_id = ? AND status != ? ORDER BY id DESC LIMIT 1",
            TICKET_COLUMNS
        ))
        .bind(user_id)
        .bind(TICKET_CLOSED)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Сообщение в тикет. Ответ админа переводит тикет в `answered`,
    /// сообщение пользователя снова в `open`.
    pub async fn add_ticket_message(
        &self,
        ticket_id: i64,
        user_id: Option<i64>,
        is_from_admin: bool,
        text: &str,
    ) -> Result<Option<TicketMessage>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let next_status = if is_from_admin {
            TICKET_ANSWERED
        } else {
            TICKET_OPEN
        };
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE tickets SET status = ?, updated_at = ?, closed_at = NULL WHERE id = ?",
        )
        .bind(next_status)
        .bind(now)
        .bind(ticket_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Ok(None);
        }

        let inserted = sqlx::query(
            "INSERT INTO ticket_messages (ticket_id, user_id, is_from_admin, text, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(ticket_id)
        .bind(user_id)
        .bind(is_from_admin)
        .bind(text)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let message = sqlx::query_as::<_, TicketMessage>(
            "SELECT id, ticket_id, user_id, is_from_admin, text, created_at FROM ticket_messages WHERE id = ?",
        )
        .bind(inserted.last_insert_rowid())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(message))
    }

    pub async fn get_ticket(&self, id: i64) -> Result<Option<Ticket>, anyhow::Error> {
        let row = sqlx::query_as::<_, Ticket>(&format!(
            "SELECT {} FROM tickets WHERE id = ?",
            TICKET_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_ticket_messages(
        &self,
        ticket_id: i64,
    ) -> Result<Vec<TicketMessage>, anyhow::Error> {
        let rows = sqlx::query_as::<_, TicketMessage>(
            "SELECT id, ticket_id, user_id, is_from_admin, text, created_at
             FROM ticket_messages WHERE ticket_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(ticket_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_tickets(
        &self,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Ticket>, anyhow::Error> {
        let rows = sqlx::query_as::<_, Ticket>(&format!(
            "SELECT {} FROM tickets WHERE (? IS NULL OR status = ?) ORDER BY updated_at DESC, id DESC LIMIT ? OFFSET ?",
            TICKET_COLUMNS
        ))
        .bind(status)
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count_tickets(&self, status: Option<&str>) -> Result<i64, anyhow::Error> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM tickets WHERE (? IS NULL OR status = ?)",
        )
        .bind(status)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    pub async fn set_ticket_status(
        &self,
        id: i64,
        status: &str,
    ) -> Result<Option<Ticket>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let closed_at = (status == TICKET_CLOSED).then_some(now);
        let result = sqlx::query(
            "UPDATE tickets SET status = ?, updated_at = ?, closed_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(now)
        .bind(closed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_ticket(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewUser;

    #[tokio::test]
    async fn ticket_status_follows_conversation() {
        let db = Db::open_in_memory().await.unwrap();
        let (user, _) = db
            .get_or_create_user(&NewUser {
                telegram_id: 7,
                ..Default::default()
            })
            .await
            .unwrap();

        let ticket = db
            .create_ticket(user.id, "Не работает VPN\nподробности ниже")
            .await
            .unwrap();
        assert_eq!(ticket.title, "Не работает VPN");
        assert_eq!(ticket.status, TICKET_OPEN);

        db.add_ticket_message(ticket.id, None, true, "Перезапустите приложение")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(db.get_ticket(ticket.id).await.unwrap().unwrap().status, TICKET_ANSWERED);

        let closed = db.set_ticket_status(ticket.id, TICKET_CLOSED).await.unwrap().unwrap();
        assert!(closed.closed_at.is_some());
        assert!(db.find_open_ticket(user.id).await.unwrap().is_none());

        let messages = db.list_ticket_messages(ticket.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[1].is_from_admin);
        assert_eq!(db.count_tickets(Some(TICKET_CLOSED)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn message_to_missing_ticket_is_none() {
        let db = Db::open_in_memory().await.unwrap();
        assert!(db.add_ticket_message(5, None, true, "hi").await.unwrap().is_none());
    }

    #[test]
    fn long_titles_are_truncated() {
        let title = title_from_text(&"я".repeat(100));
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS);
        assert!(title.ends_with("..."));
        assert_eq!(title_from_text("  \n"), "Обращение");
    }
}
