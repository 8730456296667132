use super::subscriptions::{fetch_subscription_by_user, insert_subscription};
use super::transactions::apply_balance_change;
use super::{
    current_unix_timestamp, BalanceChange, Db, NewSubscription, TransactionType,
    MAX_SUBSCRIPTION_DAYS,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const BONUS_NONE: &str = "none";
pub const BONUS_BALANCE: &str = "balance";
pub const BONUS_SUBSCRIPTION: &str = "subscription";

const CAMPAIGN_COLUMNS: &str = "id, name, start_parameter, bonus_type, balance_bonus_kopeks, subscription_days, subscription_traffic_gb, subscription_device_limit, is_active, created_at, updated_at";

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    pub start_parameter: String,
    pub bonus_type: String,
    pub balance_bonus_kopeks: i64,
    pub subscription_days: i64,
    pub subscription_traffic_gb: i64,
    pub subscription_device_limit: i64,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CampaignInput {
    pub name: String,
    pub start_parameter: String,
    #[serde(default = "default_bonus_type")]
    pub bonus_type: String,
    #[serde(default)]
    pub balance_bonus_kopeks: i64,
    #[serde(default)]
    pub subscription_days: i64,
    #[serde(default)]
    pub subscription_traffic_gb: i64,
    #[serde(default = "default_device_limit")]
    pub subscription_device_limit: i64,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_bonus_type() -> String {
    BONUS_NONE.to_string()
}

fn default_device_limit() -> i64 {
    1
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CampaignUpdate {
    pub name: Option<String>,
    pub bonus_type: Option<String>,
    pub balance_bonus_kopeks: Option<i64>,
    pub subscription_days: Option<i64>,
    pub subscription_traffic_gb: Option<i64>,
    pub subscription_device_limit: Option<i64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignStats {
    pub campaign_id: i64,
    pub registrations: i64,
    pub balance_issued_kopeks: i64,
    pub subscription_days_issued: i64,
    pub depositors: i64,
    pub deposits_total_kopeks: i64,
}

/// Что получил пользователь при регистрации по кампании.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CampaignBonus {
    None,
    Balance(i64),
    Subscription(i64),
}

fn is_valid_bonus_type(bonus_type: &str) -> bool {
    matches!(bonus_type, BONUS_NONE | BONUS_BALANCE | BONUS_SUBSCRIPTION)
}

/// Deep-link payload Telegram пропускает только из `[A-Za-z0-9_-]`, до 64 символов.
fn is_valid_start_parameter(param: &str) -> bool {
    !param.is_empty()
        && param.len() <= 64
        && param
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && !param.starts_with("ref")
}

impl CampaignInput {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Название кампании не может быть пустым".to_string());
        }
        if !is_valid_start_parameter(&self.start_parameter) {
            return Err(
                "start_parameter: 1-64 символа [A-Za-z0-9_-], не начинается с ref".to_string(),
            );
        }
        validate_bonus(
            Some(&self.bonus_type),
            Some(self.balance_bonus_kopeks),
            Some(self.subscription_days),
        )
    }
}

impl CampaignUpdate {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return Err("Название кампании не может быть пустым".to_string());
        }
        validate_bonus(
            self.bonus_type.as_deref(),
            self.balance_bonus_kopeks,
            self.subscription_days,
        )
    }
}

fn validate_bonus(
    bonus_type: Option<&str>,
    balance_bonus_kopeks: Option<i64>,
    subscription_days: Option<i64>,
) -> Result<(), String> {
    if bonus_type.is_some_and(|t| !is_valid_bonus_type(t)) {
        return Err("bonus_type: none | balance | subscription".to_string());
    }
    if balance_bonus_kopeks.is_some_and(|v| v < 0) {
        return Err("balance_bonus_kopeks не может быть отрицательным".to_string());
    }
    if subscription_days.is_some_and(|v| !(0..=MAX_SUBSCRIPTION_DAYS).contains(&v)) {
        return Err(format!("subscription_days должен быть от 0 до {}", MAX_SUBSCRIPTION_DAYS));
    }
    Ok(())
}

impl Db {
    pub async fn create_campaign(&self, input: &CampaignInput) -> Result<Campaign, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let result = sqlx::query(
            "INSERT INTO campaigns (name, start_parameter, bonus_type, balance_bonus_kopeks, subscription_days, subscription_traffic_gb, subscription_device_limit, is_active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(input.name.trim())
        .bind(&input.start_parameter)
        .bind(&input.bonus_type)
        .bind(input.balance_bonus_kopeks)
        .bind(input.subscription_days)
        .bind(input.subscription_traffic_gb)
        .bind(input.subscription_device_limit)
        .bind(input.is_active)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.get_campaign(result.last_insert_rowid())
            .await?
            .ok_or_else(|| anyhow::anyhow!("только что создали кампанию"))
    }

    pub async fn get_campaign(&self, id: i64) -> Result<Option<Campaign>, anyhow::Error> {
        let row = sqlx::query_as::<_, Campaign>(&format!(
            "SELECT {} FROM campaigns WHERE id = ?",
            CAMPAIGN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Только активные кампании.
    pub async fn get_campaign_by_start_parameter(
        &self,
        param: &str,
    ) -> Result<Option<Campaign>, anyhow::Error> {
        let row = sqlx::query_as::<_, Campaign>(&format!(
            "SELECT {} FROM campaigns WHERE start_parameter = ? AND is_active = 1",
            CAMPAIGN_COLUMNS
        ))
        .bind(param)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_campaigns(&self, limit: i64, offset: i64) -> Result<Vec<Campaign>, anyhow::Error> {
        let rows = sqlx::query_as::<_, Campaign>(&format!(
            "SELECT {} FROM campaigns ORDER BY id DESC LIMIT ? OFFSET ?",
            CAMPAIGN_COLUMNS
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count_campaigns(&self) -> Result<i64, anyhow::Error> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM campaigns")
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }

    pub async fn update_campaign(
        &self,
        id: i64,
        update: &CampaignUpdate,
    ) -> Result<Option<Campaign>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let result = sqlx::query(
            "UPDATE campaigns
             SET name = COALESCE(?, name),
                 bonus_type = COALESCE(?, bonus_type),
                 balance_bonus_kopeks = COALESCE(?, balance_bonus_kopeks),
                 subscription_days = COALESCE(?, subscription_days),
                 subscription_traffic_gb = COALESCE(?, subscription_traffic_gb),
                 subscription_device_limit = COALESCE(?, subscription_device_limit),
                 is_active = COALESCE(?, is_active),
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(update.name.as_deref().map(str::trim))
        .bind(update.bonus_type.as_deref())
        .bind(update.balance_bonus_kopeks)
        .bind(update.subscription_days)
        .bind(update.subscription_traffic_gb)
        .bind(update.subscription_device_limit)
        .bind(update.is_active)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_campaign(id).await
    }

    pub async fn delete_campaign(&self, id: i64) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("DELETE FROM campaigns WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Регистрирует пользователя в кампании и выдаёт бонус. Повторная
    /// регистрация (в этой или другой кампании) ничего не делает: `None`.
    pub async fn register_campaign_user(
        &self,
        campaign: &Campaign,
        user_id: i64,
    ) -> Result<Option<CampaignBonus>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;

        let mut bonus = match campaign.bonus_type.as_str() {
            BONUS_BALANCE if campaign.balance_bonus_kopeks > 0 => {
                CampaignBonus::Balance(campaign.balance_bonus_kopeks)
            }
            BONUS_SUBSCRIPTION if campaign.subscription_days > 0 => {
                CampaignBonus::Subscription(campaign.subscription_days)
            }
            _ => CampaignBonus::None,
        };
        if matches!(bonus, CampaignBonus::Subscription(_))
            && fetch_subscription_by_user(&mut tx, user_id).await?.is_some()
        {
            bonus = CampaignBonus::None;
        }

        let (balance_kopeks, days) = match bonus {
            CampaignBonus::Balance(amount) => (amount, 0),
            CampaignBonus::Subscription(days) => (0, days),
            CampaignBonus::None => (0, 0),
        };
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO campaign_registrations (campaign_id, user_id, bonus_type, balance_bonus_kopeks, subscription_days, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(campaign.id)
        .bind(user_id)
        .bind(&campaign.bonus_type)
        .bind(balance_kopeks)
        .bind(days)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Ok(None);
        }

        match bonus {
            CampaignBonus::Balance(amount) => {
                let description = format!("Бонус кампании «{}»", campaign.name);
                let change = BalanceChange::new(user_id, amount, TransactionType::CampaignBonus)
                    .description(&description);
                apply_balance_change(&mut tx, &change, now).await?;
            }
            CampaignBonus::Subscription(days) => {
                let new = NewSubscription {
                    user_id,
                    is_trial: true,
                    duration_days: days,
                    traffic_limit_gb: campaign.subscription_traffic_gb,
                    device_limit: campaign.subscription_device_limit.max(1),
                    squads: Vec::new(),
                    tariff_id: None,
                    subscription_url: None,
                };
                insert_subscription(&mut tx, &new, now).await?;
            }
            CampaignBonus::None => {}
        }
        tx.commit().await?;

        tracing::info!(
            campaign_id = campaign.id,
            user_id = user_id,
            bonus = ?bonus,
            "User registered via campaign"
        );
        Ok(Some(bonus))
    }

    pub async fn campaign_stats(&self, campaign_id: i64) -> Result<CampaignStats, anyhow::Error> {
        let (registrations, balance_issued_kopeks, subscription_days_issued) =
            sqlx::query_as::<_, (i64, i64, i64)>(
                "SELECT COUNT(*), COALESCE(SUM(balance_bonus_kopeks), 0), COALESCE(SUM(subscription_days), 0)
                 FROM campaign_registrations WHERE campaign_id = ?",
            )
            .bind(campaign_id)
            .fetch_one(&self.pool)
            .await?;

        let (depositors, deposits_total_kopeks) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(DISTINCT t.user_id), COALESCE(SUM(t.amount_kopeks), 0)
             FROM transactions t
             JOIN campaign_registrations r ON r.user_id = t.user_id
             WHERE r.campaign_id = ? AND t.tx_type = 'deposit' AND t.is_completed = 1",
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(CampaignStats {
            campaign_id,
            registrations,
            balance_issued_kopeks,
            subscription_days_issued,
            depositors,
            deposits_total_kopeks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewUser;

    fn input(param: &str, bonus_type: &str) -> CampaignInput {
        CampaignInput {
            name: "Осень".to_string(),
            start_parameter: param.to_string(),
            bonus_type: bonus_type.to_string(),
            balance_bonus_kopeks: 5_000,
            subscription_days: 3,
            subscription_traffic_gb: 10,
            subscription_device_limit: 1,
            is_active: true,
        }
    }

    async fn user(db: &Db, telegram_id: i64) -> i64 {
        db.get_or_create_user(&NewUser {
            telegram_id,
            ..Default::default()
        })
        .await
        .unwrap()
        .0
        .id
    }

    #[tokio::test]
    async fn balance_bonus_is_given_once() {
        let db = Db::open_in_memory().await.unwrap();
        let campaign = db.create_campaign(&input("autumn", BONUS_BALANCE)).await.unwrap();
        let user_id = user(&db, 10).await;

        let found = db
            .get_campaign_by_start_parameter("autumn")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            db.register_campaign_user(&found, user_id).await.unwrap(),
            Some(CampaignBonus::Balance(5_000))
        );
        assert_eq!(db.register_campaign_user(&found, user_id).await.unwrap(), None);
        assert_eq!(db.get_user(user_id).await.unwrap().unwrap().balance_kopeks, 5_000);

        let stats = db.campaign_stats(campaign.id).await.unwrap();
        assert_eq!(stats.registrations, 1);
        assert_eq!(stats.balance_issued_kopeks, 5_000);
    }

    #[tokio::test]
    async fn subscription_bonus_creates_trial() {
        let db = Db::open_in_memory().await.unwrap();
        let campaign = db.create_campaign(&input("promo", BONUS_SUBSCRIPTION)).await.unwrap();
        let user_id = user(&db, 11).await;

        db.register_campaign_user(&campaign, user_id).await.unwrap();
        let sub = db.get_subscription_by_user(user_id).await.unwrap().unwrap();
        assert!(sub.is_trial);
        assert_eq!(sub.traffic_limit_gb, 10);
        assert_eq!(db.campaign_stats(campaign.id).await.unwrap().subscription_days_issued, 3);
    }

    #[tokio::test]
    async fn inactive_campaign_is_not_found_by_parameter() {
        let db = Db::open_in_memory().await.unwrap();
        let mut data = input("off", BONUS_NONE);
        data.is_active = false;
        db.create_campaign(&data).await.unwrap();
        assert!(db.get_campaign_by_start_parameter("off").await.unwrap().is_none());
    }

    #[test]
    fn start_parameter_validation() {
        assert!(input("spring_2025", BONUS_NONE).validate().is_ok());
        assert!(input("ref123", BONUS_NONE).validate().is_err());
        assert!(input("with space", BONUS_NONE).validate().is_err());
        assert!(input("ok", "gift").validate().is_err());
    }
}
