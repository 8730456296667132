//! Дополнительные кнопки главного меню из настройки `menu_extra_buttons`.
//! Список разбирается лениво при первом обращении и сбрасывается при
//! изменении настройки.

use crate::settings::{RuntimeSettings, MENU_EXTRA_BUTTONS};
use reqwest::Url;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;

const MAX_BUTTON_TEXT_CHARS: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct MenuButton {
    pub text: String,
    pub url: Url,
}

#[derive(Deserialize)]
struct RawMenuButton {
    #[serde(default)]
    text: String,
    #[serde(default)]
    url: String,
}

/// Некорректные элементы пропускаются с предупреждением.
pub fn parse_menu_buttons(raw: &str) -> Vec<MenuButton> {
    let items: Vec<serde_json::Value> = match serde_json::from_str(raw) {
        Ok(items) => items,
        Err(error) => {
            tracing::warn!(error = %error, "menu_extra_buttons is not a JSON array");
            return Vec::new();
        }
    };

    items
        .into_iter()
        .enumerate()
        .filter_map(|(idx, item)| {
            let raw: RawMenuButton = match serde_json::from_value(item) {
                Ok(raw) => raw,
                Err(error) => {
                    tracing::warn!(index = idx, error = %error, "Skipping malformed menu button");
                    return None;
                }
            };
            let text = raw.text.trim();
            if text.is_empty() || text.chars().count() > MAX_BUTTON_TEXT_CHARS {
                tracing::warn!(index = idx, "Skipping menu button with bad text");
                return None;
            }
            match Url::parse(raw.url.trim()) {
                Ok(url) if matches!(url.scheme(), "http" | "https" | "tg") => Some(MenuButton {
                    text: text.to_string(),
                    url,
                }),
                _ => {
                    tracing::warn!(index = idx, url = %raw.url, "Skipping menu button with bad url");
                    None
                }
            }
        })
        .collect()
}

pub struct MenuButtonCache {
    settings: Arc<RuntimeSettings>,
    buttons: Mutex<Option<Arc<Vec<MenuButton>>>>,
}

impl MenuButtonCache {
    pub fn new(settings: Arc<RuntimeSettings>) -> Self {
        Self {
            settings,
            buttons: Mutex::new(None),
        }
    }

    pub async fn buttons(&self) -> Arc<Vec<MenuButton>> {
        let mut guard = self.buttons.lock().await;
        if let Some(buttons) = guard.as_ref() {
            return buttons.clone();
        }
        let raw = self
            .settings
            .get_string(MENU_EXTRA_BUTTONS)
            .await
            .unwrap_or_else(|| "[]".to_string());
        let parsed = Arc::new(parse_menu_buttons(&raw));
        tracing::debug!(count = parsed.len(), "Menu buttons loaded");
        *guard = Some(parsed.clone());
        parsed
    }

    pub async fn invalidate(&self) {
        *self.buttons.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::Db;

    #[test]
    fn invalid_entries_are_skipped() {
        let buttons = parse_menu_buttons(
            r#"[
                {"text": "Канал", "url": "https://t.me/channel"},
                {"text": "", "url": "https://example.com"},
                {"text": "FTP", "url": "ftp://example.com"},
                {"text": "Нет url"},
                42
            ]"#,
        );
        assert_eq!(buttons.len(), 1);
        assert_eq!(buttons[0].text, "Канал");
        assert!(parse_menu_buttons("{}").is_empty());
    }

    #[tokio::test]
    async fn cache_reloads_after_invalidate() {
        let db = Arc::new(Db::open_in_memory().await.unwrap());
        let config = Config::parse("").unwrap();
        let settings = Arc::new(RuntimeSettings::load(db, &config).await.unwrap());
        let cache = MenuButtonCache::new(settings.clone());
        assert!(cache.buttons().await.is_empty());

        settings
            .set(MENU_EXTRA_BUTTONS, r#"[{"text": "Сайт", "url": "https://example.com"}]"#)
            .await
            .unwrap();
        assert!(cache.buttons().await.is_empty());

        cache.invalidate().await;
        assert_eq!(cache.buttons().await.len(), 1);
    }
}
