use super::{current_unix_timestamp, Db};
use serde::Serialize;
use sqlx::FromRow;

const PINNED_COLUMNS: &str =
    "id, content, media_type, media_file_id, is_active, created_by, created_at, updated_at";

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PinnedMessage {
    pub id: i64,
    pub content: String,
    pub media_type: Option<String>,
    pub media_file_id: Option<String>,
    pub is_active: bool,
    pub created_by: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Db {
    pub async fn create_pinned_message(
        &self,
        content: &str,
        media_type: Option<&str>,
        media_file_id: Option<&str>,
        created_by: Option<i64>,
    ) -> Result<PinnedMessage, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let result = sqlx::query(
            "INSERT INTO pinned_messages (content, media_type, media_file_id, is_active, created_by, created_at, updated_at)
             VALUES (?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(content)
        .bind(media_type)
        .bind(media_file_id)
        .bind(created_by)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.get_pinned_message(result.last_insert_rowid())
            .await?
            .ok_or_else(|| anyhow::anyhow!("только что создали закреп"))
    }

    pub async fn get_pinned_message(&self, id: i64) -> Result<Option<PinnedMessage>, anyhow::Error> {
        let row = sqlx::query_as::<_, PinnedMessage>(&format!(
            "SELECT {} FROM pinned_messages WHERE id = ?",
            PINNED_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_active_pinned_message(&self) -> Result<Option<PinnedMessage>, anyhow::Error> {
        let row = sqlx::query_as::<_, PinnedMessage>(&format!(
            "SELECT {} FROM pinned_messages WHERE is_active = 1 ORDER BY updated_at DESC LIMIT 1",
            PINNED_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_pinned_messages(&self) -> Result<Vec<PinnedMessage>, anyhow::Error> {
        let rows = sqlx::query_as::<_, PinnedMessage>(&format!(
            "SELECT {} FROM pinned_messages ORDER BY id DESC",
            PINNED_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Активирует закреп; остальные деактивируются в той же транзакции.
    pub async fn activate_pinned_message(
        &self,
        id: i64,
    ) -> Result<Option<PinnedMessage>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;
        let exists = sqlx::query_scalar::<_, i64>("SELECT 1 FROM pinned_messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }
        sqlx::query("UPDATE pinned_messages SET is_active = 0, updated_at = ? WHERE is_active = 1 AND id != ?")
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE pinned_messages SET is_active = 1, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.get_pinned_message(id).await
    }

    pub async fn deactivate_pinned_message(&self, id: i64) -> Result<bool, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let result = sqlx::query(
            "UPDATE pinned_messages SET is_active = 0, updated_at = ? WHERE id = ? AND is_active = 1",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_pinned_message(&self, id: i64) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("DELETE FROM pinned_messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn at_most_one_active_pinned_message() {
        let db = Db::open_in_memory().await.unwrap();
        let first = db.create_pinned_message("first", None, None, None).await.unwrap();
        let second = db.create_pinned_message("second", None, None, Some(1)).await.unwrap();
        assert!(db.get_active_pinned_message().await.unwrap().is_none());

        db.activate_pinned_message(first.id).await.unwrap().unwrap();
        db.activate_pinned_message(second.id).await.unwrap().unwrap();

        let active: Vec<_> = db
            .list_pinned_messages()
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.is_active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);

        assert!(db.deactivate_pinned_message(second.id).await.unwrap());
        assert!(db.get_active_pinned_message().await.unwrap().is_none());
        assert!(db.activate_pinned_message(999).await.unwrap().is_none());
    }
}
