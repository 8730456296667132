use super::transactions::apply_balance_change;
use super::{
    current_unix_timestamp, decode_string_list, encode_string_list, BalanceChange, BalanceError, Db,
    Tariff, TransactionType,
};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection};
use thiserror::Error;

pub const SUB_STATUS_ACTIVE: &str = "active";
pub const SUB_STATUS_EXPIRED: &str = "expired";
pub const SUB_STATUS_DISABLED: &str = "disabled";

/// Верхняя граница срока подписки и продления, в днях.
pub const MAX_SUBSCRIPTION_DAYS: i64 = 36_500;

const SECONDS_PER_DAY: i64 = 86_400;
const SUBSCRIPTION_COLUMNS: &str = "id, user_id, status, is_trial, start_date, end_date, traffic_limit_gb, traffic_used_gb, device_limit, connected_squads, tariff_id, subscription_url, autopay_enabled, created_at, updated_at";

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    pub status: String,
    pub is_trial: bool,
    pub start_date: i64,
    pub end_date: i64,
    pub traffic_limit_gb: i64,
    pub traffic_used_gb: f64,
    pub device_limit: i64,
    #[serde(skip)]
    pub connected_squads: String,
    pub tariff_id: Option<i64>,
    pub subscription_url: Option<String>,
    pub autopay_enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Subscription {
    pub fn squads(&self) -> Vec<String> {
        decode_string_list(&self.connected_squads)
    }

    pub fn is_active_at(&self, now: i64) -> bool {
        self.status == SUB_STATUS_ACTIVE && self.end_date > now
    }

    pub fn days_left(&self, now: i64) -> i64 {
        ((self.end_date - now).max(0) + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSubscription {
    pub user_id: i64,
    #[serde(default)]
    pub is_trial: bool,
    pub duration_days: i64,
    #[serde(default)]
    pub traffic_limit_gb: i64,
    #[serde(default = "default_device_limit")]
    pub device_limit: i64,
    #[serde(default)]
    pub squads: Vec<String>,
    #[serde(default)]
    pub tariff_id: Option<i64>,
    #[serde(default)]
    pub subscription_url: Option<String>,
}

fn default_device_limit() -> i64 {
    1
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionUpdate {
    pub status: Option<String>,
    pub end_date: Option<i64>,
    pub traffic_limit_gb: Option<i64>,
    pub traffic_used_gb: Option<f64>,
    pub device_limit: Option<i64>,
    pub autopay_enabled: Option<bool>,
    pub subscription_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum PurchaseError {
    #[error("Тариф не найден")]
    TariffNotFound,
    #[error("Тариф недоступен для покупки")]
    TariffInactive,
    #[error(transparent)]
    Balance(#[from] BalanceError),
    #[error("Ошибка БД: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub(super) async fn fetch_subscription_by_user(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> Result<Option<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(&format!(
        "SELECT {} FROM subscriptions WHERE user_id = ?",
        SUBSCRIPTION_COLUMNS
    ))
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await
}

pub(super) async fn insert_subscription(
    conn: &mut SqliteConnection,
    new: &NewSubscription,
    now: i64,
) -> Result<i64, anyhow::Error> {
    let end_date = period_end(now, new.duration_days.max(0))?;
    let result = sqlx::query(
        "INSERT INTO subscriptions (user_id, status, is_trial, start_date, end_date, traffic_limit_gb, device_limit, connected_squads, tariff_id, subscription_url, created_at, updated_at)
         VALUES (?, 'active', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(new.user_id)
    .bind(new.is_trial)
    .bind(now)
    .bind(end_date)
    .bind(new.traffic_limit_gb)
    .bind(new.device_limit)
    .bind(encode_string_list(&new.squads))
    .bind(new.tariff_id)
    .bind(new.subscription_url.as_deref())
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    sqlx::query("UPDATE users SET has_had_subscription = 1 WHERE id = ?")
        .bind(new.user_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.last_insert_rowid())
}

fn period_end(start: i64, days: i64) -> Result<i64, anyhow::Error> {
    if !(0..=MAX_SUBSCRIPTION_DAYS).contains(&days) {
        anyhow::bail!("Срок подписки вне допустимого диапазона: {} дн.", days);
    }
    days.checked_mul(SECONDS_PER_DAY)
        .and_then(|seconds| start.checked_add(seconds))
        .ok_or_else(|| anyhow::anyhow!("Дата окончания подписки вне допустимого диапазона"))
}

/// Новый конец периода: от max(сейчас, текущий конец).
fn extended_end_date(current_end: i64, now: i64, days: i64) -> Result<i64, anyhow::Error> {
    period_end(current_end.max(now), days)
}

impl Db {
    /// `None`, если у пользователя уже есть подписка.
    pub async fn create_subscription(
        &self,
        new: &NewSubscription,
    ) -> Result<Option<Subscription>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;
        if fetch_subscription_by_user(&mut tx, new.user_id).await?.is_some() {
            return Ok(None);
        }
        insert_subscription(&mut tx, new, now).await?;
        let created = fetch_subscription_by_user(&mut tx, new.user_id).await?;
        tx.commit().await?;
        Ok(created)
    }

    /// Триал только для тех, у кого подписки никогда не было.
    pub async fn create_trial_subscription(
        &self,
        new: &NewSubscription,
    ) -> Result<Option<Subscription>, anyhow::Error> {
        let user = self.get_user(new.user_id).await?;
        if user.is_none_or(|user| user.has_had_subscription || user.has_had_paid_subscription) {
            return Ok(None);
        }
        let trial = NewSubscription {
            is_trial: true,
            ..new.clone()
        };
        self.create_subscription(&trial).await
    }

    pub async fn get_subscription(&self, id: i64) -> Result<Option<Subscription>, anyhow::Error> {
        let row = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {} FROM subscriptions WHERE id = ?",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_subscription_by_user(
        &self,
        user_id: i64,
    ) -> Result<Option<Subscription>, anyhow::Error> {
        let mut conn = self.pool.acquire().await?;
        Ok(fetch_subscription_by_user(&mut conn, user_id).await?)
    }

    pub async fn list_subscriptions(
        &self,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Subscription>, anyhow::Error> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM subscriptions WHERE 1 = 1",
            SUBSCRIPTION_COLUMNS
        ));
        if let Some(status) = status.filter(|s| !s.is_empty()) {
            qb.push(" AND status = ").push_bind(status.to_string());
        }
        qb.push(" ORDER BY end_date DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let rows = qb
            .build_query_as::<Subscription>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn count_subscriptions(&self, status: Option<&str>) -> Result<i64, anyhow::Error> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM subscriptions WHERE (? IS NULL OR status = ?)",
        )
        .bind(status)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    pub async fn update_subscription(
        &self,
        id: i64,
        update: &SubscriptionUpdate,
    ) -> Result<Option<Subscription>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let result = sqlx::query(
            "UPDATE subscriptions
             SET status = COALESCE(?, status),
                 end_date = COALESCE(?, end_date),
                 traffic_limit_gb = COALESCE(?, traffic_limit_gb),
                 traffic_used_gb = COALESCE(?, traffic_used_gb),
                 device_limit = COALESCE(?, device_limit),
                 autopay_enabled = COALESCE(?, autopay_enabled),
                 subscription_url = COALESCE(?, subscription_url),
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(update.status.as_deref())
        .bind(update.end_date)
        .bind(update.traffic_limit_gb)
        .bind(update.traffic_used_gb)
        .bind(update.device_limit)
        .bind(update.autopay_enabled)
        .bind(update.subscription_url.as_deref())
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_subscription(id).await
    }

    /// Продлевает подписку и снова делает её активной.
    pub async fn extend_subscription(
        &self,
        id: i64,
        days: i64,
    ) -> Result<Option<Subscription>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let Some(current) = self.get_subscription(id).await? else {
            return Ok(None);
        };
        let end_date = extended_end_date(current.end_date, now, days)?;
        sqlx::query(
            "UPDATE subscriptions SET end_date = ?, status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(end_date)
        .bind(SUB_STATUS_ACTIVE)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get_subscription(id).await
    }

    pub async fn add_subscription_squad(
        &self,
        id: i64,
        squad: &str,
    ) -> Result<Option<Subscription>, anyhow::Error> {
        let Some(current) = self.get_subscription(id).await? else {
            return Ok(None);
        };
        let mut squads = current.squads();
        if !squads.iter().any(|existing| existing == squad) {
            squads.push(squad.to_string());
        }
        self.store_squads(id, &squads).await?;
        self.get_subscription(id).await
    }

    pub async fn remove_subscription_squad(
        &self,
        id: i64,
        squad: &str,
    ) -> Result<Option<Subscription>, anyhow::Error> {
        let Some(current) = self.get_subscription(id).await? else {
            return Ok(None);
        };
        let squads: Vec<String> = current
            .squads()
            .into_iter()
            .filter(|existing| existing != squad)
            .collect();
        self.store_squads(id, &squads).await?;
        self.get_subscription(id).await
    }

    async fn store_squads(&self, id: i64, squads: &[String]) -> Result<(), anyhow::Error> {
        let now = current_unix_timestamp()?;
        sqlx::query("UPDATE subscriptions SET connected_squads = ?, updated_at = ? WHERE id = ?")
            .bind(encode_string_list(squads))
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_subscription(&self, id: i64) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Переводит просроченные активные подписки в `expired`.
    pub async fn expire_overdue_subscriptions(&self, now: i64) -> Result<u64, anyhow::Error> {
        let result = sqlx::query(
            "UPDATE subscriptions SET status = ?, updated_at = ? WHERE status = ? AND end_date <= ?",
        )
        .bind(SUB_STATUS_EXPIRED)
        .bind(now)
        .bind(SUB_STATUS_ACTIVE)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Покупка тарифа с баланса: списание, создание или продление подписки.
    pub async fn purchase_tariff(
        &self,
        user_id: i64,
        tariff: &Tariff,
        subscription_url: Option<String>,
    ) -> Result<Subscription, PurchaseError> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;

        // Тариф мог быть удалён или выключен, пока пользователь смотрел список.
        let is_active = sqlx::query_scalar::<_, bool>("SELECT is_active FROM tariffs WHERE id = ?")
            .bind(tariff.id)
            .fetch_optional(&mut *tx)
            .await?;
        match is_active {
            None => return Err(PurchaseError::TariffNotFound),
            Some(false) => return Err(PurchaseError::TariffInactive),
            Some(true) => {}
        }

        if tariff.price_kopeks > 0 {
            let description = format!("Оплата тарифа «{}»", tariff.name);
            let charge =
                BalanceChange::new(user_id, tariff.price_kopeks, TransactionType::SubscriptionPayment)
                    .description(&description);
            apply_balance_change(&mut tx, &charge, now).await?;
        }

        match fetch_subscription_by_user(&mut tx, user_id).await? {
            Some(existing) => {
                let end_date = if existing.is_trial {
                    period_end(now, tariff.period_days)?
                } else {
                    extended_end_date(existing.end_date, now, tariff.period_days)?
                };
                sqlx::query(
                    "UPDATE subscriptions
                     SET status = ?, is_trial = 0, end_date = ?, traffic_limit_gb = ?, device_limit = ?,
                         connected_squads = ?, tariff_id = ?, subscription_url = COALESCE(subscription_url, ?), updated_at = ?
                     WHERE id = ?",
                )
                .bind(SUB_STATUS_ACTIVE)
                .bind(end_date)
                .bind(tariff.traffic_limit_gb)
                .bind(tariff.device_limit)
                .bind(&tariff.allowed_squads)
                .bind(tariff.id)
                .bind(subscription_url.as_deref())
                .bind(now)
                .bind(existing.id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                let new = NewSubscription {
                    user_id,
                    is_trial: false,
                    duration_days: tariff.period_days,
                    traffic_limit_gb: tariff.traffic_limit_gb,
                    device_limit: tariff.device_limit,
                    squads: tariff.squads(),
                    tariff_id: Some(tariff.id),
                    subscription_url,
                };
                insert_subscription(&mut tx, &new, now).await?;
            }
        }

        sqlx::query("UPDATE users SET has_had_paid_subscription = 1 WHERE id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        let subscription = fetch_subscription_by_user(&mut tx, user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("подписка пропала после покупки"))?;
        tx.commit().await?;

        tracing::info!(
            user_id = user_id,
            tariff_id = tariff.id,
            end_date = subscription.end_date,
            "Tariff purchased"
        );
        Ok(subscription)
    }
}
