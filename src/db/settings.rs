use super::{current_unix_timestamp, Db};
use std::collections::HashMap;

impl Db {
    pub async fn list_setting_overrides(&self) -> Result<HashMap<String, String>, anyhow::Error> {
        let rows = sqlx::query_as::<_, (String, String)>("SELECT key, value FROM system_settings")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn upsert_setting(&self, key: &str, value: &str) -> Result<(), anyhow::Error> {
        let now = current_unix_timestamp()?;
        sqlx::query(
            "INSERT INTO system_settings (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_setting(&self, key: &str) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("DELETE FROM system_settings WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_replaces_value() {
        let db = Db::open_in_memory().await.unwrap();
        db.upsert_setting("trial_enabled", "false").await.unwrap();
        db.upsert_setting("trial_enabled", "true").await.unwrap();
        let overrides = db.list_setting_overrides().await.unwrap();
        assert_eq!(overrides.get("trial_enabled").map(String::as_str), Some("true"));

        assert!(db.delete_setting("trial_enabled").await.unwrap());
        assert!(!db.delete_setting("trial_enabled").await.unwrap());
    }
}
