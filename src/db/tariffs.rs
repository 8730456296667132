use super::{
    current_unix_timestamp, decode_string_list, encode_string_list, Db, MAX_SUBSCRIPTION_DAYS,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

const TARIFF_COLUMNS: &str = "id, name, description, period_days, price_kopeks, traffic_limit_gb, device_limit, allowed_squads, is_active, display_order, created_at, updated_at";

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Tariff {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub period_days: i64,
    pub price_kopeks: i64,
    pub traffic_limit_gb: i64,
    pub device_limit: i64,
    #[serde(skip)]
    pub allowed_squads: String,
    pub is_active: bool,
    pub display_order: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Tariff {
    pub fn squads(&self) -> Vec<String> {
        decode_string_list(&self.allowed_squads)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TariffInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub period_days: i64,
    pub price_kopeks: i64,
    #[serde(default)]
    pub traffic_limit_gb: i64,
    #[serde(default = "default_device_limit")]
    pub device_limit: i64,
    #[serde(default)]
    pub allowed_squads: Vec<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub display_order: i64,
}

fn default_device_limit() -> i64 {
    1
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TariffUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub period_days: Option<i64>,
    pub price_kopeks: Option<i64>,
    pub traffic_limit_gb: Option<i64>,
    pub device_limit: Option<i64>,
    pub allowed_squads: Option<Vec<String>>,
    pub is_active: Option<bool>,
    pub display_order: Option<i64>,
}

impl TariffInput {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Название тарифа не может быть пустым".to_string());
        }
        validate_numbers(
            Some(self.period_days),
            Some(self.price_kopeks),
            Some(self.traffic_limit_gb),
            Some(self.device_limit),
        )
    }
}

impl TariffUpdate {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return Err("Название тарифа не может быть пустым".to_string());
        }
        validate_numbers(
            self.period_days,
            self.price_kopeks,
            self.traffic_limit_gb,
            self.device_limit,
        )
    }
}

fn validate_numbers(
    period_days: Option<i64>,
    price_kopeks: Option<i64>,
    traffic_limit_gb: Option<i64>,
    device_limit: Option<i64>,
) -> Result<(), String> {
    if period_days.is_some_and(|days| !(1..=MAX_SUBSCRIPTION_DAYS).contains(&days)) {
        return Err(format!("period_days должен быть от 1 до {}", MAX_SUBSCRIPTION_DAYS));
    }
    if price_kopeks.is_some_and(|price| price < 0) {
        return Err("price_kopeks не может быть отрицательной".to_string());
    }
    if traffic_limit_gb.is_some_and(|limit| limit < 0) {
        return Err("traffic_limit_gb не может быть отрицательным".to_string());
    }
    if device_limit.is_some_and(|limit| limit < 1) {
        return Err("device_limit должен быть >= 1".to_string());
    }
    Ok(())
}

impl Db {
    pub async fn create_tariff(&self, input: &TariffInput) -> Result<Tariff, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let result = sqlx::query(
            "INSERT INTO tariffs (name, description, period_days, price_kopeks, traffic_limit_gb, device_limit, allowed_squads, is_active, display_order, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(input.name.trim())
        .bind(input.description.as_deref())
        .bind(input.period_days)
        .bind(input.price_kopeks)
        .bind(input.traffic_limit_gb)
        .bind(input.device_limit)
        .bind(encode_string_list(&input.allowed_squads))
        .bind(input.is_active)
        .bind(input.display_order)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_tariff(result.last_insert_rowid())
            .await?
            .ok_or_else(|| anyhow::anyhow!("только что создали тариф"))
    }

    pub async fn get_tariff(&self, id: i64) -> Result<Option<Tariff>, anyhow::Error> {
        let row = sqlx::query_as::<_, Tariff>(&format!(
            "SELECT {} FROM tariffs WHERE id = ?",
            TARIFF_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_tariffs(&self, active_only: bool) -> Result<Vec<Tariff>, anyhow::Error> {
        let rows = sqlx::query_as::<_, Tariff>(&format!(
            "SELECT {} FROM tariffs WHERE (? = 0 OR is_active = 1) ORDER BY display_order ASC, id ASC",
            TARIFF_COLUMNS
        ))
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn update_tariff(
        &self,
        id: i64,
        update: &TariffUpdate,
    ) -> Result<Option<Tariff>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let squads = update.allowed_squads.as_deref().map(encode_string_list);
        let result = sqlx::query(
            "UPDATE tariffs
             SET name = COALESCE(?, name),
                 description = COALESCE(?, description),
                 period_days = COALESCE(?, period_days),
                 price_kopeks = COALESCE(?, price_kopeks),
                 traffic_limit_gb = COALESCE(?, traffic_limit_gb),
                 device_limit = COALESCE(?, device_limit),
                 allowed_squads = COALESCE(?, allowed_squads),
                 is_active = COALESCE(?, is_active),
                 display_order = COALESCE(?, display_order),
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(update.name.as_deref().map(str::trim))
        .bind(update.description.as_deref())
        .bind(update.period_days)
        .bind(update.price_kopeks)
        .bind(update.traffic_limit_gb)
        .bind(update.device_limit)
        .bind(squads)
        .bind(update.is_active)
        .bind(update.display_order)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_tariff(id).await
    }

    pub async fn delete_tariff(&self, id: i64) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("DELETE FROM tariffs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
