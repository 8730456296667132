use super::{current_unix_timestamp, Db};
use serde::Serialize;
use sqlx::FromRow;

const BROADCAST_COLUMNS: &str = "id, target, message_text, total_count, sent_count, failed_count, skipped_count, status, created_by, created_at, completed_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl BroadcastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastStatus::Queued => "queued",
            BroadcastStatus::InProgress => "in_progress",
            BroadcastStatus::Completed => "completed",
            BroadcastStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BroadcastRecord {
    pub id: i64,
    pub target: String,
    pub message_text: String,
    pub total_count: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    pub skipped_count: i64,
    pub status: String,
    pub created_by: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl Db {
    pub async fn create_broadcast(
        &self,
        target: &str,
        message_text: &str,
        created_by: Option<&str>,
    ) -> Result<BroadcastRecord, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let result = sqlx::query(
            "INSERT INTO broadcast_history (target, message_text, status, created_by, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(target)
        .bind(message_text)
        .bind(BroadcastStatus::Queued.as_str())
        .bind(created_by)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.get_broadcast(result.last_insert_rowid())
            .await?
            .ok_or_else(|| anyhow::anyhow!("только что создали рассылку"))
    }

    pub async fn mark_broadcast_in_progress(&self, id: i64, total: i64) -> Result<(), anyhow::Error> {
        sqlx::query("UPDATE broadcast_history SET status = ?, total_count = ? WHERE id = ?")
            .bind(BroadcastStatus::InProgress.as_str())
            .bind(total)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn finish_broadcast(
        &self,
        id: i64,
        status: BroadcastStatus,
        sent: i64,
        failed: i64,
        skipped: i64,
    ) -> Result<(), anyhow::Error> {
        let now = current_unix_timestamp()?;
        sqlx::query(
            "UPDATE broadcast_history
             SET status = ?, sent_count = ?, failed_count = ?, skipped_count = ?, completed_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(sent)
        .bind(failed)
        .bind(skipped)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_broadcast(&self, id: i64) -> Result<Option<BroadcastRecord>, anyhow::Error> {
        let row = sqlx::query_as::<_, BroadcastRecord>(&format!(
            "SELECT {} FROM broadcast_history WHERE id = ?",
            BROADCAST_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_broadcasts(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<BroadcastRecord>, anyhow::Error> {
        let rows = sqlx::query_as::<_, BroadcastRecord>(&format!(
            "SELECT {} FROM broadcast_history ORDER BY id DESC LIMIT ? OFFSET ?",
            BROADCAST_COLUMNS
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count_broadcasts(&self) -> Result<i64, anyhow::Error> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM broadcast_history")
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_lifecycle() {
        let db = Db::open_in_memory().await.unwrap();
        let record = db.create_broadcast("all", "Привет", Some("admin")).await.unwrap();
        assert_eq!(record.status, "queued");

        db.mark_broadcast_in_progress(record.id, 3).await.unwrap();
        db.finish_broadcast(record.id, BroadcastStatus::Completed, 1, 1, 1)
            .await
            .unwrap();

        let stored = db.get_broadcast(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "completed");
        assert_eq!(stored.total_count, 3);
        assert_eq!(stored.skipped_count, 1);
        assert!(stored.completed_at.is_some());
        assert_eq!(db.count_broadcasts().await.unwrap(), 1);
    }
}
