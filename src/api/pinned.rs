use super::{ApiCaller, ApiError, AppState};
use crate::db::PinnedMessage;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};

const MEDIA_TYPES: &[&str] = &["photo", "video", "document"];

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/pinned-messages", get(list_pinned).post(create_pinned))
        .route("/pinned-messages/active", get(get_active))
        .route("/pinned-messages/{id}/activate", post(activate))
        .route("/pinned-messages/{id}/deactivate", post(deactivate))
        .route("/pinned-messages/{id}", delete(delete_pinned))
}

#[derive(Debug, Deserialize)]
struct PinnedRequest {
    content: String,
    media_type: Option<String>,
    media_file_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ActivateQuery {
    #[serde(default)]
    broadcast: bool,
}

#[derive(Debug, Serialize)]
struct ActivateResponse {
    message: PinnedMessage,
    broadcast_started: bool,
}

async fn list_pinned(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
) -> Result<Json<Vec<PinnedMessage>>, ApiError> {
    caller.require("pinned:read")?;
    Ok(Json(state.db.list_pinned_messages().await?))
}

async fn get_active(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
) -> Result<Json<PinnedMessage>, ApiError> {
    caller.require("pinned:read")?;
    let message = state
        .db
        .get_active_pinned_message()
        .await?
        .ok_or_else(|| ApiError::NotFound("Активного закреплённого сообщения нет".to_string()))?;
    Ok(Json(message))
}

async fn create_pinned(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Json(req): Json<PinnedRequest>,
) -> Result<(StatusCode, Json<PinnedMessage>), ApiError> {
    caller.require("pinned:write")?;
    let content = req.content.trim();
    if content.is_empty() {
        return Err(ApiError::BadRequest("Пустой текст сообщения".to_string()));
    }
    let media_type = req.media_type.as_deref().filter(|t| !t.is_empty());
    if let Some(media_type) = media_type {
        if !MEDIA_TYPES.contains(&media_type) {
            return Err(ApiError::BadRequest(format!("Неизвестный тип медиа: {}", media_type)));
        }
        if req.media_file_id.as_deref().is_none_or(|id| id.trim().is_empty()) {
            return Err(ApiError::BadRequest("Для медиа нужен media_file_id".to_string()));
        }
    }
    let message = state
        .db
        .create_pinned_message(content, media_type, req.media_file_id.as_deref(), None)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn activate(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
    Query(query): Query<ActivateQuery>,
) -> Result<Json<ActivateResponse>, ApiError> {
    caller.require("pinned:write")?;
    let message = state
        .db
        .activate_pinned_message(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Сообщение", id))?;
    tracing::info!(pinned_id = id, broadcast = query.broadcast, "Pinned message activated");

    if query.broadcast {
        let broadcaster = state.broadcaster.clone();
        let pinned = message.clone();
        tokio::spawn(async move {
            if let Err(e) = broadcaster.broadcast_pinned(&pinned).await {
                tracing::error!(pinned_id = pinned.id, error = %e, "Pinned message broadcast aborted");
            }
        });
    }
    Ok(Json(ActivateResponse {
        message,
        broadcast_started: query.broadcast,
    }))
}

async fn deactivate(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
) -> Result<Json<PinnedMessage>, ApiError> {
    caller.require("pinned:write")?;
    state.db.deactivate_pinned_message(id).await?;
    let message = state
        .db
        .get_pinned_message(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Сообщение", id))?;
    Ok(Json(message))
}

async fn delete_pinned(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    caller.require("pinned:write")?;
    if state.db.delete_pinned_message(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Сообщение", id))
    }
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::*;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn only_one_message_is_active() {
        let state = state().await;
        let token = issue_token(&state, &["pinned:*"]).await;

        let (status, _) = call(&state, "GET", "/pinned-messages/active", Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, first) = call(
            &state,
            "POST",
            "/pinned-messages",
            Some(&token),
            Some(json!({"content": "Первое"})),
        )
        .await;
        let (_, second) = call(
            &state,
            "POST",
            "/pinned-messages",
            Some(&token),
            Some(json!({"content": "Второе"})),
        )
        .await;

        for message in [&first, &second] {
            let (status, body) = call(
                &state,
                "POST",
                &format!("/pinned-messages/{}/activate", message["id"]),
                Some(&token),
                None,
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["broadcast_started"], false);
        }

        let (_, active) = call(&state, "GET", "/pinned-messages/active", Some(&token), None).await;
        assert_eq!(active["id"], second["id"]);
        let (_, all) = call(&state, "GET", "/pinned-messages", Some(&token), None).await;
        let active_count = all
            .as_array()
            .unwrap()
            .iter()
            .filter(|m| m["is_active"] == true)
            .count();
        assert_eq!(active_count, 1);

        let (status, _) = call(
            &state,
            "POST",
            "/pinned-messages",
            Some(&token),
            Some(json!({"content": "Фото", "media_type": "photo"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
