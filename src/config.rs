//! Конфигурация сервиса из TOML-файла.

use crate::security::HashAlgorithm;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const BOT_TOKEN_ENV: &str = "BOT_TOKEN";
const MIN_STARS_REFRESH_INTERVAL_SECS: u64 = 60;
const MIN_STARS_RETRY_BACKOFF_SECS: u64 = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub admin_ids: Vec<i64>,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_list_page_size")]
    pub list_page_size: i64,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub stars: StarsConfig,
    /// Значения runtime-настроек по умолчанию (перекрываются записями в БД).
    #[serde(default)]
    pub settings: HashMap<String, toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub token_hash_algorithm: HashAlgorithm,
    #[serde(default)]
    pub cors_permissive: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_listen(),
            token_hash_algorithm: HashAlgorithm::default(),
            cors_permissive: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StarsConfig {
    #[serde(default)]
    pub rate_url: Option<String>,
    #[serde(default = "default_fallback_rate")]
    pub fallback_rate_rub: f64,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for StarsConfig {
    fn default() -> Self {
        Self {
            rate_url: None,
            fallback_rate_rub: default_fallback_rate(),
            refresh_interval_secs: default_refresh_interval(),
            retry_backoff_secs: default_retry_backoff(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/vpn-shop-admin/bot.db")
}

fn default_list_page_size() -> i64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_fallback_rate() -> f64 {
    1.79
}

fn default_refresh_interval() -> u64 {
    15 * 60
}

fn default_retry_backoff() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    10
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Не удалось прочитать конфиг {}: {}", path.display(), e)
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, anyhow::Error> {
        let config: Config =
            toml::from_str(raw).map_err(|e| anyhow::anyhow!("Некорректный конфиг: {}", e))?;
        if config.list_page_size < 1 {
            anyhow::bail!("list_page_size должен быть >= 1");
        }
        if !(config.stars.fallback_rate_rub.is_finite() && config.stars.fallback_rate_rub > 0.0) {
            anyhow::bail!("stars.fallback_rate_rub должен быть положительным числом");
        }
        if config.stars.refresh_interval_secs < MIN_STARS_REFRESH_INTERVAL_SECS {
            anyhow::bail!(
                "stars.refresh_interval_secs должен быть >= {}",
                MIN_STARS_REFRESH_INTERVAL_SECS
            );
        }
        if config.stars.retry_backoff_secs < MIN_STARS_RETRY_BACKOFF_SECS {
            anyhow::bail!(
                "stars.retry_backoff_secs должен быть >= {}",
                MIN_STARS_RETRY_BACKOFF_SECS
            );
        }
        if config.stars.request_timeout_secs < 1 {
            anyhow::bail!("stars.request_timeout_secs должен быть >= 1");
        }
        Ok(config)
    }

    /// Токен бота: переменная окружения приоритетнее файла.
    pub fn bot_token(&self) -> Result<String, anyhow::Error> {
        if let Ok(token) = std::env::var(BOT_TOKEN_ENV)
            && !token.trim().is_empty()
        {
            return Ok(token.trim().to_string());
        }
        self.bot_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Не задан bot_token (или {})", BOT_TOKEN_ENV))
    }

    pub fn is_admin(&self, tg_user_id: i64) -> bool {
        self.admin_ids.contains(&tg_user_id)
    }

    /// Значение настройки из секции `[settings]` в строковом виде.
    /// Массивы и таблицы TOML отдаются как JSON.
    pub fn setting_default(&self, key: &str) -> Option<String> {
        self.settings.get(key).and_then(|value| match value {
            toml::Value::String(text) => Some(text.clone()),
            other => serde_json::to_string(other).ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = Config::parse("admin_ids = [1, 2]\n").unwrap();
        assert!(config.is_admin(2));
        assert!(!config.is_admin(3));
        assert_eq!(config.list_page_size, 10);
        assert!(config.api.enabled);
        assert_eq!(config.api.token_hash_algorithm, HashAlgorithm::Sha256);
        assert_eq!(config.stars.refresh_interval_secs, 900);
        assert_eq!(config.stars.retry_backoff_secs, 60);
    }

    #[test]
    fn settings_section_values_become_strings() {
        let config = Config::parse(
            r#"
            [settings]
            trial_enabled = false
            trial_duration_days = 5
            subscription_base_url = "https://sub.example.com"
            "#,
        )
        .unwrap();
        assert_eq!(config.setting_default("trial_enabled").as_deref(), Some("false"));
        assert_eq!(config.setting_default("trial_duration_days").as_deref(), Some("5"));
        assert_eq!(
            config.setting_default("subscription_base_url").as_deref(),
            Some("https://sub.example.com")
        );
        assert_eq!(config.setting_default("missing"), None);
    }

    #[test]
    fn rejects_zero_page_size() {
        assert!(Config::parse("list_page_size = 0\n").is_err());
    }

    #[test]
    fn rejects_too_eager_stars_refresh() {
        assert!(Config::parse("[stars]\nretry_backoff_secs = 0\n").is_err());
        assert!(Config::parse("[stars]\nretry_backoff_secs = 59\n").is_err());
        assert!(Config::parse("[stars]\nrefresh_interval_secs = 0\n").is_err());
        assert!(Config::parse("[stars]\nrequest_timeout_secs = 0\n").is_err());
        assert!(Config::parse("[stars]\nretry_backoff_secs = 120\n").is_ok());
    }

    #[test]
    fn native_toml_arrays_become_json() {
        let config = Config::parse(
            r#"
            [settings]
            menu_extra_buttons = [{ text = "Site", url = "https://example.com" }]
            "#,
        )
        .unwrap();
        let raw = config.setting_default("menu_extra_buttons").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            parsed,
            serde_json::json!([{"text": "Site", "url": "https://example.com"}])
        );
    }

    #[test]
    fn parses_api_section() {
        let config = Config::parse(
            r#"
            [api]
            listen = "0.0.0.0:9000"
            token_hash_algorithm = "sha512"
            "#,
        )
        .unwrap();
        assert_eq!(config.api.listen.port(), 9000);
        assert_eq!(config.api.token_hash_algorithm, HashAlgorithm::Sha512);
    }
}
