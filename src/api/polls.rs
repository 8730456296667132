use super::{ApiCaller, ApiError, AppState, Page, PageParams};
use crate::db::{Audience, NewPoll, PollDetail, PollStats, PollSummary};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/polls", get(list_polls).post(create_poll))
        .route("/polls/{id}", get(get_poll).delete(delete_poll))
        .route("/polls/{id}/stats", get(poll_stats))
        .route("/polls/{id}/send", post(send_poll))
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    target: Audience,
}

#[derive(Debug, Serialize)]
struct SendResponse {
    poll_id: i64,
    target: Audience,
    status: &'static str,
}

async fn list_polls(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Query(page): Query<PageParams>,
) -> Result<Json<Page<PollSummary>>, ApiError> {
    caller.require("polls:read")?;
    let items = state.db.list_polls(page.limit(), page.offset()).await?;
    let total = state.db.count_polls().await?;
    Ok(Json(Page::new(items, total, &page)))
}

async fn get_poll(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
) -> Result<Json<PollDetail>, ApiError> {
    caller.require("polls:read")?;
    let poll = state
        .db
        .get_poll_detail(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Опрос", id))?;
    Ok(Json(poll))
}

async fn poll_stats(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
) -> Result<Json<PollStats>, ApiError> {
    caller.require("polls:read")?;
    let stats = state
        .db
        .poll_stats(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Опрос", id))?;
    Ok(Json(stats))
}

async fn create_poll(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Json(new): Json<NewPoll>,
) -> Result<(StatusCode, Json<PollDetail>), ApiError> {
    caller.require("polls:write")?;
    new.validate().map_err(ApiError::BadRequest)?;
    let poll = state.db.create_poll(&new, Some(&caller.label())).await?;
    tracing::info!(
        poll_id = poll.poll.id,
        questions = poll.questions.len(),
        "Poll created"
    );
    Ok((StatusCode::CREATED, Json(poll)))
}

/// Рассылка идёт в фоне; итоги видны в статистике опроса.
async fn send_poll(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
    Json(req): Json<SendRequest>,
) -> Result<(StatusCode, Json<SendResponse>), ApiError> {
    caller.require("polls:write")?;
    let poll = state
        .db
        .get_poll_detail(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Опрос", id))?;
    if poll.questions.is_empty() {
        return Err(ApiError::BadRequest("В опросе нет вопросов".to_string()));
    }

    let polls = state.polls.clone();
    let target = req.target;
    tokio::spawn(async move {
        if let Err(e) = polls.distribute(&poll, target).await {
            tracing::error!(poll_id = poll.poll.id, error = %e, "Poll distribution aborted");
        }
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(SendResponse {
            poll_id: id,
            target,
            status: "queued",
        }),
    ))
}

async fn delete_poll(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    caller.require("polls:write")?;
    if state.db.delete_poll(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Опрос", id))
    }
}
