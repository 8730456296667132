use super::{ApiCaller, ApiError, AppState, Page, PageParams};
use crate::db::{is_valid_ticket_status, Ticket, TicketMessage, User};
use axum::{
    extract::{Path, Query, State},
    routing::{get, patch, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use teloxide::prelude::*;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tickets", get(list_tickets))
        .route("/tickets/{id}", get(get_ticket))
        .route("/tickets/{id}/reply", post(reply_ticket))
        .route("/tickets/{id}/status", patch(set_status))
}

#[derive(Debug, Default, Deserialize)]
struct StatusQuery {
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct TicketDetail {
    #[serde(flatten)]
    ticket: Ticket,
    user: Option<User>,
    messages: Vec<TicketMessage>,
}

#[derive(Debug, Deserialize)]
struct ReplyRequest {
    text: String,
}

#[derive(Debug, Serialize)]
struct ReplyResponse {
    message: TicketMessage,
    delivered: bool,
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    status: String,
}

async fn list_tickets(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Query(page): Query<PageParams>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Page<Ticket>>, ApiError> {
    caller.require("tickets:read")?;
    let status = query.status.as_deref().filter(|s| !s.is_empty());
    let items = state
        .db
        .list_tickets(status, page.limit(), page.offset())
        .await?;
    let total = state.db.count_tickets(status).await?;
    Ok(Json(Page::new(items, total, &page)))
}

async fn get_ticket(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
) -> Result<Json<TicketDetail>, ApiError> {
    caller.require("tickets:read")?;
    let ticket = state
        .db
        .get_ticket(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Обращение", id))?;
    let user = state.db.get_user(ticket.user_id).await?;
    let messages = state.db.list_ticket_messages(id).await?;
    Ok(Json(TicketDetail {
        ticket,
        user,
        messages,
    }))
}

async fn reply_ticket(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
    Json(req): Json<ReplyRequest>,
) -> Result<Json<ReplyResponse>, ApiError> {
    caller.require("tickets:write")?;
    let text = req.text.trim();
    if text.is_empty() {
        return Err(ApiError::BadRequest("Пустой ответ".to_string()));
    }
    let ticket = state
        .db
        .get_ticket(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Обращение", id))?;
    let message = state
        .db
        .add_ticket_message(id, None, true, text)
        .await?
        .ok_or_else(|| ApiError::not_found("Обращение", id))?;

    let delivered = match state.db.get_user(ticket.user_id).await? {
        Some(user) => {
            let notice = format!("💬 Ответ поддержки по обращению #{}:\n\n{}", id, text);
            match state.bot.send_message(ChatId(user.telegram_id), notice).await {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(ticket_id = id, telegram_id = user.telegram_id, error = %e, "Ticket reply delivery failed");
                    false
                }
            }
        }
        None => false,
    };
    tracing::info!(ticket_id = id, delivered, "Ticket answered");
    Ok(Json(ReplyResponse { message, delivered }))
}

async fn set_status(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
    Json(req): Json<StatusRequest>,
) -> Result<Json<Ticket>, ApiError> {
    caller.require("tickets:write")?;
    if !is_valid_ticket_status(&req.status) {
        return Err(ApiError::BadRequest(format!("Неизвестный статус: {}", req.status)));
    }
    let ticket = state
        .db
        .set_ticket_status(id, &req.status)
        .await?
        .ok_or_else(|| ApiError::not_found("Обращение", id))?;
    Ok(Json(ticket))
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::*;
    use crate::db::NewUser;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn lists_and_closes_tickets() {
        let state = state().await;
        let token = issue_token(&state, &["tickets:*"]).await;
        let (user, _) = state
            .db
            .get_or_create_user(&NewUser {
                telegram_id: 9,
                ..Default::default()
            })
            .await
            .unwrap();
        let ticket = state.db.create_ticket(user.id, "Не работает VPN\nподробности").await.unwrap();

        let (status, page) = call(&state, "GET", "/tickets?status=open", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 1);

        let (status, detail) = call(&state, "GET", &format!("/tickets/{}", ticket.id), Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["title"], "Не работает VPN");
        assert_eq!(detail["messages"].as_array().unwrap().len(), 1);

        let (status, _) = call(
            &state,
            "PATCH",
            &format!("/tickets/{}/status", ticket.id),
            Some(&token),
            Some(json!({"status": "archived"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, closed) = call(
            &state,
            "PATCH",
            &format!("/tickets/{}/status", ticket.id),
            Some(&token),
            Some(json!({"status": "closed"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(closed["closed_at"].is_i64());
    }
}
