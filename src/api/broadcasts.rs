use super::{ApiCaller, ApiError, AppState, Page, PageParams};
use crate::db::{Audience, BroadcastRecord};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Extension, Json, Router,
};
use serde::Deserialize;

const MAX_MESSAGE_CHARS: usize = 4096;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/broadcasts", get(list_broadcasts).post(create_broadcast))
        .route("/broadcasts/{id}", get(get_broadcast))
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    target: Audience,
    text: String,
}

async fn list_broadcasts(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Query(page): Query<PageParams>,
) -> Result<Json<Page<BroadcastRecord>>, ApiError> {
    caller.require("broadcasts:read")?;
    let items = state
        .db
        .list_broadcasts(page.limit(), page.offset())
        .await?;
    let total = state.db.count_broadcasts().await?;
    Ok(Json(Page::new(items, total, &page)))
}

async fn get_broadcast(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
) -> Result<Json<BroadcastRecord>, ApiError> {
    caller.require("broadcasts:read")?;
    let record = state
        .db
        .get_broadcast(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Рассылка", id))?;
    Ok(Json(record))
}

async fn create_broadcast(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Json(req): Json<BroadcastRequest>,
) -> Result<(StatusCode, Json<BroadcastRecord>), ApiError> {
    caller.require("broadcasts:write")?;
    let text = req.text.trim();
    if text.is_empty() || text.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ApiError::BadRequest(format!(
            "Текст рассылки должен быть от 1 до {} символов",
            MAX_MESSAGE_CHARS
        )));
    }
    let record = state
        .broadcaster
        .queue(req.target, text, Some(&caller.label()))
        .await?;
    tracing::info!(
        broadcast_id = record.id,
        target = req.target.as_str(),
        token_id = caller.token_id,
        "Broadcast queued"
    );
    Ok((StatusCode::ACCEPTED, Json(record)))
}
