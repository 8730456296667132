//! Runtime-настройки: запись в БД > секция `[settings]` конфига > встроенное значение.

use crate::config::Config;
use crate::db::Db;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

pub const TRIAL_ENABLED: &str = "trial_enabled";
pub const TRIAL_DURATION_DAYS: &str = "trial_duration_days";
pub const TRIAL_TRAFFIC_LIMIT_GB: &str = "trial_traffic_limit_gb";
pub const TRIAL_DEVICE_LIMIT: &str = "trial_device_limit";
pub const REFERRAL_COMMISSION_PERCENT: &str = "referral_commission_percent";
pub const REFERRAL_SIGNUP_BONUS_KOPEKS: &str = "referral_signup_bonus_kopeks";
pub const SUPPORT_ENABLED: &str = "support_enabled";
pub const MAINTENANCE_MODE: &str = "maintenance_mode";
pub const MIN_TOPUP_KOPEKS: &str = "min_topup_kopeks";
pub const STARS_RATE_RUB: &str = "stars_rate_rub";
pub const MENU_EXTRA_BUTTONS: &str = "menu_extra_buttons";
pub const SUBSCRIPTION_BASE_URL: &str = "subscription_base_url";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingKind {
    Bool,
    Int,
    Float,
    String,
    Json,
}

pub struct SettingDefinition {
    pub key: &'static str,
    pub kind: SettingKind,
    pub default: &'static str,
    pub description: &'static str,
}

const DEFINITIONS: &[SettingDefinition] = &[
    SettingDefinition {
        key: TRIAL_ENABLED,
        kind: SettingKind::Bool,
        default: "true",
        description: "Выдавать пробную подписку",
    },
    SettingDefinition {
        key: TRIAL_DURATION_DAYS,
        kind: SettingKind::Int,
        default: "3",
        description: "Длительность пробной подписки, дней",
    },
    SettingDefinition {
        key: TRIAL_TRAFFIC_LIMIT_GB,
        kind: SettingKind::Int,
        default: "10",
        description: "Лимит трафика пробной подписки, ГБ (0 — без лимита)",
    },
    SettingDefinition {
        key: TRIAL_DEVICE_LIMIT,
        kind: SettingKind::Int,
        default: "1",
        description: "Лимит устройств пробной подписки",
    },
    SettingDefinition {
        key: REFERRAL_COMMISSION_PERCENT,
        kind: SettingKind::Int,
        default: "10",
        description: "Процент с пополнений приглашённых",
    },
    SettingDefinition {
        key: REFERRAL_SIGNUP_BONUS_KOPEKS,
        kind: SettingKind::Int,
        default: "0",
        description: "Бонус новому пользователю по реферальной ссылке, коп.",
    },
    SettingDefinition {
        key: SUPPORT_ENABLED,
        kind: SettingKind::Bool,
        default: "true",
        description: "Принимать обращения в поддержку",
    },
    SettingDefinition {
        key: MAINTENANCE_MODE,
        kind: SettingKind::Bool,
        default: "false",
        description: "Режим техработ: бот отвечает только админам",
    },
    SettingDefinition {
        key: MIN_TOPUP_KOPEKS,
        kind: SettingKind::Int,
        default: "10000",
        description: "Минимальное пополнение, коп.",
    },
    SettingDefinition {
        key: STARS_RATE_RUB,
        kind: SettingKind::Float,
        default: "",
        description: "Фиксированный курс звезды в рублях (пусто — автоматически)",
    },
    SettingDefinition {
        key: MENU_EXTRA_BUTTONS,
        kind: SettingKind::Json,
        default: "[]",
        description: "Дополнительные кнопки меню: [{\"text\": ..., \"url\": ...}]",
    },
    SettingDefinition {
        key: SUBSCRIPTION_BASE_URL,
        kind: SettingKind::String,
        default: "",
        description: "Базовый URL ссылок подписки",
    },
];

pub fn definition(key: &str) -> Option<&'static SettingDefinition> {
    DEFINITIONS.iter().find(|def| def.key == key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingSource {
    Database,
    Config,
    Default,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettingValue {
    pub key: &'static str,
    pub kind: SettingKind,
    pub value: String,
    pub source: SettingSource,
    pub description: &'static str,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Неизвестная настройка: {0}")]
    UnknownKey(String),
    #[error("Некорректное значение для {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Приводит значение к каноническому виду или объясняет, почему оно не подходит.
pub fn normalize_value(kind: SettingKind, raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    match kind {
        SettingKind::Bool => match trimmed.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok("true".to_string()),
            "false" | "0" | "no" | "off" => Ok("false".to_string()),
            _ => Err("ожидается true/false".to_string()),
        },
        SettingKind::Int => trimmed
            .parse::<i64>()
            .map(|v| v.to_string())
            .map_err(|_| "ожидается целое число".to_string()),
        SettingKind::Float => {
            if trimmed.is_empty() {
                return Ok(String::new());
            }
            match trimmed.replace(',', ".").parse::<f64>() {
                Ok(v) if v.is_finite() && v > 0.0 => Ok(v.to_string()),
                _ => Err("ожидается положительное число".to_string()),
            }
        }
        SettingKind::String => Ok(trimmed.to_string()),
        SettingKind::Json => serde_json::from_str::<serde_json::Value>(trimmed)
            .map(|v| v.to_string())
            .map_err(|e| format!("некорректный JSON: {}", e)),
    }
}

pub struct RuntimeSettings {
    db: Arc<Db>,
    config_defaults: HashMap<String, String>,
    overrides: RwLock<HashMap<String, String>>,
}

impl RuntimeSettings {
    /// Читает переопределения из БД один раз при старте.
    pub async fn load(db: Arc<Db>, config: &Config) -> Result<Self, anyhow::Error> {
        let mut config_defaults = HashMap::new();
        for def in DEFINITIONS {
            if let Some(raw) = config.setting_default(def.key) {
                match normalize_value(def.kind, &raw) {
                    Ok(value) => {
                        config_defaults.insert(def.key.to_string(), value);
                    }
                    Err(reason) => tracing::warn!(
                        key = def.key,
                        reason = %reason,
                        "Ignoring invalid [settings] value from config"
                    ),
                }
            }
        }
        for key in config.settings.keys() {
            if definition(key).is_none() {
                tracing::warn!(key = %key, "Unknown key in [settings] section");
            }
        }

        let overrides = db.list_setting_overrides().await?;
        tracing::info!(
            overrides = overrides.len(),
            config_defaults = config_defaults.len(),
            "Runtime settings loaded"
        );
        Ok(Self {
            db,
            config_defaults,
            overrides: RwLock::new(overrides),
        })
    }

    async fn resolve(&self, def: &'static SettingDefinition) -> SettingValue {
        let (value, source) = match self.overrides.read().await.get(def.key) {
            Some(value) => (value.clone(), SettingSource::Database),
            None => match self.config_defaults.get(def.key) {
                Some(value) => (value.clone(), SettingSource::Config),
                None => (def.default.to_string(), SettingSource::Default),
            },
        };
        SettingValue {
            key: def.key,
            kind: def.kind,
            value,
            source,
            description: def.description,
        }
    }

    pub async fn get(&self, key: &str) -> Option<SettingValue> {
        match definition(key) {
            Some(def) => Some(self.resolve(def).await),
            None => None,
        }
    }

    pub async fn list(&self) -> Vec<SettingValue> {
        let mut values = Vec::with_capacity(DEFINITIONS.len());
        for def in DEFINITIONS {
            values.push(self.resolve(def).await);
        }
        values
    }

    async fn raw(&self, key: &str) -> String {
        self.get(key).await.map(|v| v.value).unwrap_or_default()
    }

    pub async fn get_bool(&self, key: &str) -> bool {
        self.raw(key).await == "true"
    }

    pub async fn get_int(&self, key: &str) -> i64 {
        let raw = self.raw(key).await;
        raw.parse().unwrap_or_else(|_| {
            definition(key)
                .and_then(|def| def.default.parse().ok())
                .unwrap_or(0)
        })
    }

    pub async fn get_float(&self, key: &str) -> Option<f64> {
        self.raw(key)
            .await
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v > 0.0)
    }

    pub async fn get_string(&self, key: &str) -> Option<String> {
        Some(self.raw(key).await).filter(|v| !v.is_empty())
    }

    pub async fn set(&self, key: &str, raw: &str) -> Result<SettingValue, SettingsError> {
        let def = definition(key).ok_or_else(|| SettingsError::UnknownKey(key.to_string()))?;
        let value = normalize_value(def.kind, raw).map_err(|reason| SettingsError::InvalidValue {
            key: key.to_string(),
            reason,
        })?;
        self.db.upsert_setting(def.key, &value).await?;
        self.overrides
            .write()
            .await
            .insert(def.key.to_string(), value);
        tracing::info!(key = def.key, "Runtime setting updated");
        Ok(self.resolve(def).await)
    }

    /// Убирает переопределение из БД; значение возвращается к конфигу/умолчанию.
    pub async fn reset(&self, key: &str) -> Result<SettingValue, SettingsError> {
        let def = definition(key).ok_or_else(|| SettingsError::UnknownKey(key.to_string()))?;
        self.db.delete_setting(def.key).await?;
        self.overrides.write().await.remove(def.key);
        tracing::info!(key = def.key, "Runtime setting reset");
        Ok(self.resolve(def).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn settings(config_raw: &str) -> RuntimeSettings {
        let db = Arc::new(Db::open_in_memory().await.unwrap());
        let config = Config::parse(config_raw).unwrap();
        RuntimeSettings::load(db, &config).await.unwrap()
    }

    #[tokio::test]
    async fn database_beats_config_beats_default() {
        let settings = settings("[settings]\ntrial_duration_days = 7\n").await;

        let value = settings.get(TRIAL_DURATION_DAYS).await.unwrap();
        assert_eq!(value.source, SettingSource::Config);
        assert_eq!(settings.get_int(TRIAL_DURATION_DAYS).await, 7);

        settings.set(TRIAL_DURATION_DAYS, "14").await.unwrap();
        let value = settings.get(TRIAL_DURATION_DAYS).await.unwrap();
        assert_eq!(value.source, SettingSource::Database);
        assert_eq!(settings.get_int(TRIAL_DURATION_DAYS).await, 14);

        settings.reset(TRIAL_DURATION_DAYS).await.unwrap();
        assert_eq!(settings.get_int(TRIAL_DURATION_DAYS).await, 7);

        let untouched = settings.get(TRIAL_DEVICE_LIMIT).await.unwrap();
        assert_eq!(untouched.source, SettingSource::Default);
        assert_eq!(untouched.value, "1");
    }

    #[tokio::test]
    async fn overrides_survive_reload() {
        let db = Arc::new(Db::open_in_memory().await.unwrap());
        let config = Config::parse("").unwrap();
        let first = RuntimeSettings::load(db.clone(), &config).await.unwrap();
        first.set(MAINTENANCE_MODE, "on").await.unwrap();

        let second = RuntimeSettings::load(db, &config).await.unwrap();
        assert!(second.get_bool(MAINTENANCE_MODE).await);
    }

    #[tokio::test]
    async fn set_rejects_unknown_key_and_bad_value() {
        let settings = settings("").await;
        assert!(matches!(
            settings.set("nope", "1").await,
            Err(SettingsError::UnknownKey(_))
        ));
        assert!(matches!(
            settings.set(TRIAL_ENABLED, "maybe").await,
            Err(SettingsError::InvalidValue { .. })
        ));
        assert!(settings.set(MENU_EXTRA_BUTTONS, "{broken").await.is_err());
    }

    #[tokio::test]
    async fn invalid_config_value_falls_back_to_default() {
        let settings = settings("[settings]\nmin_topup_kopeks = \"lots\"\n").await;
        assert_eq!(settings.get_int(MIN_TOPUP_KOPEKS).await, 10_000);
        assert_eq!(settings.get_float(STARS_RATE_RUB).await, None);
        assert_eq!(settings.get_string(SUBSCRIPTION_BASE_URL).await, None);
    }

    #[tokio::test]
    async fn json_setting_accepts_native_toml_array() {
        let settings = settings(
            "[settings]\nmenu_extra_buttons = [{ text = \"Site\", url = \"https://example.com\" }]\n",
        )
        .await;
        let value = settings.get(MENU_EXTRA_BUTTONS).await.unwrap();
        assert_eq!(value.source, SettingSource::Config);
        let parsed: serde_json::Value = serde_json::from_str(&value.value).unwrap();
        assert_eq!(parsed[0]["url"], "https://example.com");
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize_value(SettingKind::Bool, "YES").unwrap(), "true");
        assert_eq!(normalize_value(SettingKind::Float, "1,85").unwrap(), "1.85");
        assert_eq!(normalize_value(SettingKind::Float, "").unwrap(), "");
        assert!(normalize_value(SettingKind::Float, "-1").is_err());
        assert!(normalize_value(SettingKind::Int, "1.5").is_err());
    }
}
