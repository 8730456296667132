use super::{ApiCaller, ApiError, AppState};
use crate::settings::{SettingValue, MENU_EXTRA_BUTTONS};
use axum::{
    extract::{Path, State},
    routing::get,
    Extension, Json, Router,
};
use serde::Deserialize;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/settings", get(list_settings))
        .route(
            "/settings/{key}",
            get(get_setting).put(put_setting).delete(reset_setting),
        )
}

/// Значение можно передать строкой или любым JSON-значением.
#[derive(Debug, Deserialize)]
struct SettingRequest {
    value: serde_json::Value,
}

impl SettingRequest {
    fn raw(&self) -> String {
        match &self.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

async fn list_settings(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
) -> Result<Json<Vec<SettingValue>>, ApiError> {
    caller.require("settings:read")?;
    Ok(Json(state.settings.list().await))
}

async fn get_setting(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(key): Path<String>,
) -> Result<Json<SettingValue>, ApiError> {
    caller.require("settings:read")?;
    let value = state
        .settings
        .get(&key)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Неизвестная настройка: {}", key)))?;
    Ok(Json(value))
}

async fn put_setting(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(key): Path<String>,
    Json(req): Json<SettingRequest>,
) -> Result<Json<SettingValue>, ApiError> {
    caller.require("settings:write")?;
    let value = state.settings.set(&key, &req.raw()).await?;
    if value.key == MENU_EXTRA_BUTTONS {
        state.menu_cache.invalidate().await;
    }
    tracing::info!(key = value.key, token_id = caller.token_id, "Setting changed via API");
    Ok(Json(value))
}

async fn reset_setting(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(key): Path<String>,
) -> Result<Json<SettingValue>, ApiError> {
    caller.require("settings:write")?;
    let value = state.settings.reset(&key).await?;
    if value.key == MENU_EXTRA_BUTTONS {
        state.menu_cache.invalidate().await;
    }
    Ok(Json(value))
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::*;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn override_and_reset() {
        let state = state().await;
        let token = issue_token(&state, &["settings:*"]).await;

        let (status, value) = call(
            &state,
            "PUT",
            "/settings/trial_duration_days",
            Some(&token),
            Some(json!({"value": 14})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["value"], "14");
        assert_eq!(value["source"], "database");

        let (status, _) = call(
            &state,
            "PUT",
            "/settings/trial_duration_days",
            Some(&token),
            Some(json!({"value": "many"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &state,
            "PUT",
            "/settings/no_such_key",
            Some(&token),
            Some(json!({"value": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&state, "GET", "/settings/no_such_key", Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, value) = call(&state, "DELETE", "/settings/trial_duration_days", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["source"], "default");
    }

    #[tokio::test]
    async fn menu_buttons_update_invalidates_cache() {
        let state = state().await;
        let token = issue_token(&state, &["settings:write"]).await;
        assert!(state.menu_cache.buttons().await.is_empty());

        let (status, _) = call(
            &state,
            "PUT",
            "/settings/menu_extra_buttons",
            Some(&token),
            Some(json!({"value": [{"text": "Канал", "url": "https://t.me/channel"}]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.menu_cache.buttons().await.len(), 1);
    }
}
