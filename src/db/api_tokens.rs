use super::{current_unix_timestamp, decode_string_list, encode_string_list, Db};
use serde::Serialize;
use sqlx::FromRow;

const TOKEN_COLUMNS: &str = "id, name, token_hash, token_prefix, permissions, is_active, created_by, created_at, expires_at, last_used_at, last_used_ip";

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ApiToken {
    pub id: i64,
    pub name: String,
    #[serde(skip)]
    pub token_hash: String,
    pub token_prefix: String,
    #[serde(skip)]
    pub permissions: String,
    pub is_active: bool,
    pub created_by: Option<String>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub last_used_at: Option<i64>,
    pub last_used_ip: Option<String>,
}

impl ApiToken {
    pub fn permission_list(&self) -> Vec<String> {
        decode_string_list(&self.permissions)
    }

    pub fn is_usable_at(&self, now: i64) -> bool {
        self.is_active && self.expires_at.is_none_or(|expires| expires > now)
    }
}

impl Db {
    pub async fn create_api_token(
        &self,
        name: &str,
        token_hash: &str,
        token_prefix: &str,
        permissions: &[String],
        expires_at: Option<i64>,
        created_by: Option<&str>,
    ) -> Result<ApiToken, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let result = sqlx::query(
            "INSERT INTO api_tokens (name, token_hash, token_prefix, permissions, is_active, created_by, created_at, expires_at)
             VALUES (?, ?, ?, ?, 1, ?, ?, ?)",
        )
        .bind(name.trim())
        .bind(token_hash)
        .bind(token_prefix)
        .bind(encode_string_list(permissions))
        .bind(created_by)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        self.get_api_token(result.last_insert_rowid())
            .await?
            .ok_or_else(|| anyhow::anyhow!("только что создали токен"))
    }

    pub async fn get_api_token(&self, id: i64) -> Result<Option<ApiToken>, anyhow::Error> {
        let row = sqlx::query_as::<_, ApiToken>(&format!(
            "SELECT {} FROM api_tokens WHERE id = ?",
            TOKEN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_api_tokens(&self) -> Result<Vec<ApiToken>, anyhow::Error> {
        let rows = sqlx::query_as::<_, ApiToken>(&format!(
            "SELECT {} FROM api_tokens ORDER BY id DESC",
            TOKEN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Активный и не истёкший токен по хешу.
    pub async fn find_active_api_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<ApiToken>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let row = sqlx::query_as::<_, ApiToken>(&format!(
            "SELECT {} FROM api_tokens WHERE token_hash = ?",
            TOKEN_COLUMNS
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.filter(|token| token.is_usable_at(now)))
    }

    pub async fn touch_api_token(&self, id: i64, ip: Option<&str>) -> Result<(), anyhow::Error> {
        let now = current_unix_timestamp()?;
        sqlx::query(
            "UPDATE api_tokens SET last_used_at = ?, last_used_ip = COALESCE(?, last_used_ip) WHERE id = ?",
        )
        .bind(now)
        .bind(ip)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn revoke_api_token(&self, id: i64) -> Result<Option<ApiToken>, anyhow::Error> {
        let result = sqlx::query("UPDATE api_tokens SET is_active = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_api_token(id).await
    }

    pub async fn delete_api_token(&self, id: i64) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("DELETE FROM api_tokens WHERE id = ?")
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
    async fn revoked_and_expired_tokens_are_not_found() {
        let db = Db::open_in_memory().await.unwrap();
        let perms = vec!["users:read".to_string()];
        let live = db
            .create_api_token("panel", "hash-live", "vsa_abcdefgh", &perms, None, None)
            .await
            .unwrap();
        db.create_api_token("old", "hash-old", "vsa_12345678", &perms, Some(1), None)
            .await
            .unwrap();

        let found = db.find_active_api_token("hash-live").await.unwrap().unwrap();
        assert_eq!(found.permission_list(), perms);
        assert!(db.find_active_api_token("hash-old").await.unwrap().is_none());

        db.revoke_api_token(live.id).await.unwrap().unwrap();
        assert!(db.find_active_api_token("hash-live").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn touch_records_last_use() {
        let db = Db::open_in_memory().await.unwrap();
        let token = db
            .create_api_token("panel", "h", "vsa_x", &[], None, Some("admin"))
            .await
            .unwrap();
        db.touch_api_token(token.id, Some("10.0.0.1")).await.unwrap();
        let stored = db.get_api_token(token.id).await.unwrap().unwrap();
        assert!(stored.last_used_at.is_some());
        assert_eq!(stored.last_used_ip.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn serialized_token_hides_hash() {
        let token = ApiToken {
            id: 1,
            name: "panel".to_string(),
            token_hash: "secret".to_string(),
            token_prefix: "vsa_x".to_string(),
            permissions: "[]".to_string(),
            is_active: true,
            created_by: None,
            created_at: 0,
            expires_at: None,
            last_used_at: None,
            last_used_ip: None,
        };
        let json = serde_json::to_string(&token).unwrap();
        assert!(!json.contains("secret"));
    }
}
