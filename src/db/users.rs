use super::{current_unix_timestamp, is_unique_violation, Db};
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite};

pub const USER_STATUS_ACTIVE: &str = "active";
pub const USER_STATUS_BLOCKED: &str = "blocked";
pub const USER_STATUS_DELETED: &str = "deleted";

const USER_COLUMNS: &str = "id, telegram_id, username, first_name, last_name, language, status, balance_kopeks, referral_code, referred_by_id, has_had_paid_subscription, has_had_subscription, created_at, updated_at, last_activity_at";

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub id: i64,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language: String,
    pub status: String,
    pub balance_kopeks: i64,
    pub referral_code: Option<String>,
    pub referred_by_id: Option<i64>,
    pub has_had_paid_subscription: bool,
    /// Когда-либо была любая подписка, включая триал и бонус кампании.
    pub has_had_subscription: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_activity_at: Option<i64>,
}

impl User {
    pub fn display_name(&self) -> String {
        let full_name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !full_name.is_empty() {
            return full_name;
        }
        self.username
            .as_ref()
            .map(|username| format!("@{}", username))
            .unwrap_or_else(|| format!("id {}", self.telegram_id))
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewUser<'a> {
    pub telegram_id: i64,
    pub username: Option<&'a str>,
    pub first_name: Option<&'a str>,
    pub last_name: Option<&'a str>,
    pub language: Option<&'a str>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserUpdate {
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserFilter {
    pub search: Option<String>,
    pub status: Option<String>,
}

/// Получатель рассылки.
#[derive(Debug, Clone, FromRow)]
pub struct AudienceMember {
    pub user_id: i64,
    pub telegram_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    All,
    Active,
    Trial,
    Expired,
    NoSubscription,
}

impl Audience {
    pub fn as_str(&self) -> &'static str {
        match self {
            Audience::All => "all",
            Audience::Active => "active",
            Audience::Trial => "trial",
            Audience::Expired => "expired",
            Audience::NoSubscription => "no_subscription",
        }
    }

    fn where_clause(&self) -> &'static str {
        match self {
            Audience::All => "",
            Audience::Active => {
                " AND EXISTS (SELECT 1 FROM subscriptions s WHERE s.user_id = u.id AND s.status = 'active' AND s.is_trial = 0)"
            }
            Audience::Trial => {
                " AND EXISTS (SELECT 1 FROM subscriptions s WHERE s.user_id = u.id AND s.status = 'active' AND s.is_trial = 1)"
            }
            Audience::Expired => {
                " AND EXISTS (SELECT 1 FROM subscriptions s WHERE s.user_id = u.id AND s.status = 'expired')"
            }
            Audience::NoSubscription => {
                " AND NOT EXISTS (SELECT 1 FROM subscriptions s WHERE s.user_id = u.id)"
            }
        }
    }
}

impl std::str::FromStr for Audience {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Audience::All),
            "active" => Ok(Audience::Active),
            "trial" => Ok(Audience::Trial),
            "expired" => Ok(Audience::Expired),
            "no_subscription" => Ok(Audience::NoSubscription),
            other => Err(anyhow::anyhow!("Неизвестная аудитория: {}", other)),
        }
    }
}

fn generate_referral_code() -> String {
    format!("ref{}", Alphanumeric.sample_string(&mut rand::rng(), 8))
}

fn push_user_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &UserFilter) {
    if let Some(status) = filter.status.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND status = ").push_bind(status.to_string());
    }
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        if let Ok(numeric) = search.parse::<i64>() {
            qb.push(" AND (telegram_id = ")
                .push_bind(numeric)
                .push(" OR id = ")
                .push_bind(numeric)
                .push(")");
        } else {
            let pattern = format!("%{}%", search.trim_start_matches('@').to_lowercase());
            qb.push(" AND (lower(username) LIKE ")
                .push_bind(pattern.clone())
                .push(" OR lower(first_name) LIKE ")
                .push_bind(pattern.clone())
                .push(" OR lower(last_name) LIKE ")
                .push_bind(pattern)
                .push(")");
        }
    }
}

impl Db {
    /// Возвращает пользователя и флаг «создан только что». Для существующего
    /// обновляет профиль и время активности.
    pub async fn get_or_create_user(
        &self,
        new_user: &NewUser<'_>,
    ) -> Result<(User, bool), anyhow::Error> {
        let now = current_unix_timestamp()?;

        if let Some(existing) = self.get_user_by_telegram_id(new_user.telegram_id).await? {
            sqlx::query(
                "UPDATE users
                 SET username = ?, first_name = COALESCE(?, first_name), last_name = ?, last_activity_at = ?, updated_at = ?
                 WHERE id = ?",
            )
            .bind(new_user.username)
            .bind(new_user.first_name)
            .bind(new_user.last_name)
            .bind(now)
            .bind(now)
            .bind(existing.id)
            .execute(&self.pool)
            .await?;
            let user = self
                .get_user(existing.id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("пользователь пропал во время обновления"))?;
            return Ok((user, false));
        }

        for _ in 0..8 {
            let referral_code = generate_referral_code();
            let result = sqlx::query(
                "INSERT INTO users (telegram_id, username, first_name, last_name, language, referral_code, created_at, updated_at, last_activity_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(new_user.telegram_id)
            .bind(new_user.username)
            .bind(new_user.first_name)
            .bind(new_user.last_name)
            .bind(new_user.language.unwrap_or("ru"))
            .bind(&referral_code)
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await;

            match result {
                Ok(done) => {
                    let user = self
                        .get_user(done.last_insert_rowid())
                        .await?
                        .ok_or_else(|| anyhow::anyhow!("только что создали пользователя"))?;
                    return Ok((user, true));
                }
                Err(err) if is_unique_violation(&err) => {
                    // Гонка по telegram_id: пользователь появился параллельно.
                    if let Some(user) = self.get_user_by_telegram_id(new_user.telegram_id).await? {
                        return Ok((user, false));
                    }
                    continue;
                }
                Err(err) => {
                    return Err(anyhow::anyhow!("Не удалось создать пользователя: {}", err));
                }
            }
        }

        Err(anyhow::anyhow!("Не удалось сгенерировать уникальный реферальный код"))
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>, anyhow::Error> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE id = ?",
            USER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn get_user_by_telegram_id(
        &self,
        telegram_id: i64,
    ) -> Result<Option<User>, anyhow::Error> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE telegram_id = ?",
            USER_COLUMNS
        ))
        .bind(telegram_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn get_user_by_referral_code(
        &self,
        code: &str,
    ) -> Result<Option<User>, anyhow::Error> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE referral_code = ?",
            USER_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    /// Привязывает реферера один раз. Самого себя пригласить нельзя.
    pub async fn set_referrer(&self, user_id: i64, referrer_id: i64) -> Result<bool, anyhow::Error> {
        if user_id == referrer_id {
            return Ok(false);
        }
        let now = current_unix_timestamp()?;
        let result = sqlx::query(
            "UPDATE users SET referred_by_id = ?, updated_at = ? WHERE id = ? AND referred_by_id IS NULL",
        )
        .bind(referrer_id)
        .bind(now)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_users(
        &self,
        filter: &UserFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<User>, anyhow::Error> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM users WHERE 1 = 1",
            USER_COLUMNS
        ));
        push_user_filter(&mut qb, filter);
        qb.push(" ORDER BY id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let rows = qb.build_query_as::<User>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    pub async fn count_users(&self, filter: &UserFilter) -> Result<i64, anyhow::Error> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM users WHERE 1 = 1");
        push_user_filter(&mut qb, filter);
        let total = qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }

    pub async fn update_user(
        &self,
        id: i64,
        update: &UserUpdate,
    ) -> Result<Option<User>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let result = sqlx::query(
            "UPDATE users
             SET username = COALESCE(?, username),
                 first_name = COALESCE(?, first_name),
                 last_name = COALESCE(?, last_name),
                 language = COALESCE(?, language),
                 status = COALESCE(?, status),
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(update.username.as_deref())
        .bind(update.first_name.as_deref())
        .bind(update.last_name.as_deref())
        .bind(update.language.as_deref())
        .bind(update.status.as_deref())
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_user(id).await
    }

    pub async fn delete_user(&self, id: i64) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Помечает пользователя заблокировавшим бота (после ошибки доставки).
    pub async fn mark_user_blocked(&self, user_id: i64) -> Result<(), anyhow::Error> {
        let now = current_unix_timestamp()?;
        sqlx::query("UPDATE users SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
            .bind(USER_STATUS_BLOCKED)
            .bind(now)
            .bind(user_id)
            .bind(USER_STATUS_ACTIVE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_audience(&self, audience: Audience) -> Result<Vec<AudienceMember>, anyhow::Error> {
        let rows = sqlx::query_as::<_, AudienceMember>(&format!(
            "SELECT u.id AS user_id, u.telegram_id FROM users u WHERE u.status = '{}'{} ORDER BY u.id",
            USER_STATUS_ACTIVE,
            audience.where_clause()
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(telegram_id: i64) -> NewUser<'static> {
        NewUser {
            telegram_id,
            username: Some("alice"),
            first_name: Some("Alice"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent_per_telegram_id() {
        let db = Db::open_in_memory().await.unwrap();
        let (first, created) = db.get_or_create_user(&new_user(100)).await.unwrap();
        assert!(created);
        assert!(first.referral_code.as_deref().is_some_and(|c| c.starts_with("ref")));

        let (second, created) = db.get_or_create_user(&new_user(100)).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(first.referral_code, second.referral_code);
    }

    #[tokio::test]
    async fn referrer_is_set_once_and_never_self() {
        let db = Db::open_in_memory().await.unwrap();
        let (referrer, _) = db.get_or_create_user(&new_user(1)).await.unwrap();
        let (other, _) = db.get_or_create_user(&new_user(2)).await.unwrap();
        let (user, _) = db.get_or_create_user(&new_user(3)).await.unwrap();

        assert!(!db.set_referrer(user.id, user.id).await.unwrap());
        assert!(db.set_referrer(user.id, referrer.id).await.unwrap());
        assert!(!db.set_referrer(user.id, other.id).await.unwrap());

        let stored = db.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(stored.referred_by_id, Some(referrer.id));
    }

    #[tokio::test]
    async fn list_and_count_respect_filters() {
        let db = Db::open_in_memory().await.unwrap();
        db.get_or_create_user(&new_user(10)).await.unwrap();
        db.get_or_create_user(&NewUser {
            telegram_id: 11,
            username: Some("bob"),
            ..Default::default()
        })
        .await
        .unwrap();

        let filter = UserFilter {
            search: Some("@BOB".to_string()),
            status: None,
        };
        let found = db.list_users(&filter, 50, 0).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].telegram_id, 11);
        assert_eq!(db.count_users(&filter).await.unwrap(), 1);

        let by_id = UserFilter {
            search: Some("10".to_string()),
            status: Some(USER_STATUS_ACTIVE.to_string()),
        };
        assert_eq!(db.count_users(&by_id).await.unwrap(), 1);
        assert_eq!(db.count_users(&UserFilter::default()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn update_missing_user_returns_none() {
        let db = Db::open_in_memory().await.unwrap();
        let update = UserUpdate {
            status: Some(USER_STATUS_BLOCKED.to_string()),
            ..Default::default()
        };
        assert!(db.update_user(42, &update).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn audience_excludes_blocked_users() {
        let db = Db::open_in_memory().await.unwrap();
        let (a, _) = db.get_or_create_user(&new_user(1)).await.unwrap();
        let (b, _) = db.get_or_create_user(&new_user(2)).await.unwrap();
        db.mark_user_blocked(b.id).await.unwrap();

        let all = db.list_audience(Audience::All).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].user_id, a.id);
        let without = db.list_audience(Audience::NoSubscription).await.unwrap();
        assert_eq!(without.len(), 1);
    }

    #[test]
    fn display_name_falls_back_to_username() {
        let user = User {
            id: 1,
            telegram_id: 5,
            username: Some("neo".to_string()),
            first_name: Some("  ".to_string()),
            last_name: None,
            language: "ru".to_string(),
            status: USER_STATUS_ACTIVE.to_string(),
            balance_kopeks: 0,
            referral_code: None,
            referred_by_id: None,
            has_had_paid_subscription: false,
            has_had_subscription: false,
            created_at: 0,
            updated_at: 0,
            last_activity_at: None,
        };
        assert_eq!(user.display_name(), "@neo");
    }
}
