use super::{ApiCaller, ApiError, AppState, Page, PageParams};
use crate::db::{
    BalanceChange, NewUser, Subscription, Transaction, TransactionType, User, UserFilter,
    UserUpdate, USER_STATUS_ACTIVE, USER_STATUS_BLOCKED, USER_STATUS_DELETED,
};
use crate::settings::REFERRAL_COMMISSION_PERCENT;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/users", get(list_users).post(create_user))
        .route(
            "/users/{id}",
            get(get_user).patch(update_user).delete(delete_user),
        )
        .route("/users/{id}/balance", post(adjust_balance))
}

#[derive(Debug, Serialize)]
struct UserDetail {
    #[serde(flatten)]
    user: User,
    subscription: Option<Subscription>,
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    telegram_id: i64,
    username: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BalanceRequest {
    amount_kopeks: i64,
    #[serde(default = "default_balance_type")]
    tx_type: TransactionType,
    description: Option<String>,
    payment_method: Option<String>,
    external_id: Option<String>,
}

fn default_balance_type() -> TransactionType {
    TransactionType::Deposit
}

#[derive(Debug, Serialize)]
struct BalanceResponse {
    transaction: Transaction,
    balance_kopeks: i64,
}

fn is_valid_user_status(status: &str) -> bool {
    matches!(
        status,
        USER_STATUS_ACTIVE | USER_STATUS_BLOCKED | USER_STATUS_DELETED
    )
}

async fn list_users(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Query(page): Query<PageParams>,
    Query(filter): Query<UserFilter>,
) -> Result<Json<Page<User>>, ApiError> {
    caller.require("users:read")?;
    let items = state
        .db
        .list_users(&filter, page.limit(), page.offset())
        .await?;
    let total = state.db.count_users(&filter).await?;
    Ok(Json(Page::new(items, total, &page)))
}

async fn get_user(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
) -> Result<Json<UserDetail>, ApiError> {
    caller.require("users:read")?;
    let user = state
        .db
        .get_user(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Пользователь", id))?;
    let subscription = state.db.get_subscription_by_user(user.id).await?;
    Ok(Json(UserDetail { user, subscription }))
}

async fn create_user(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    caller.require("users:write")?;
    if req.telegram_id <= 0 {
        return Err(ApiError::BadRequest("telegram_id должен быть положительным".to_string()));
    }
    if state.db.get_user_by_telegram_id(req.telegram_id).await?.is_some() {
        return Err(ApiError::Conflict(format!(
            "Пользователь с telegram_id {} уже существует",
            req.telegram_id
        )));
    }
    let (user, _) = state
        .db
        .get_or_create_user(&NewUser {
            telegram_id: req.telegram_id,
            username: req.username.as_deref(),
            first_name: req.first_name.as_deref(),
            last_name: req.last_name.as_deref(),
            language: req.language.as_deref(),
        })
        .await?;
    tracing::info!(user_id = user.id, telegram_id = user.telegram_id, "User created via API");
    Ok((StatusCode::CREATED, Json(user)))
}

async fn update_user(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
    Json(update): Json<UserUpdate>,
) -> Result<Json<User>, ApiError> {
    caller.require("users:write")?;
    if let Some(status) = update.status.as_deref()
        && !is_valid_user_status(status)
    {
        return Err(ApiError::BadRequest(format!("Неизвестный статус: {}", status)));
    }
    let user = state
        .db
        .update_user(id, &update)
        .await?
        .ok_or_else(|| ApiError::not_found("Пользователь", id))?;
    Ok(Json(user))
}

async fn adjust_balance(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
    Json(req): Json<BalanceRequest>,
) -> Result<Json<BalanceResponse>, ApiError> {
    caller.require("users:write")?;
    let label = caller.label();
    let mut change = BalanceChange::new(id, req.amount_kopeks, req.tx_type)
        .payment_method(req.payment_method.as_deref().unwrap_or("manual"))
        .description(req.description.as_deref().unwrap_or(&label));
    if let Some(external_id) = req.external_id.as_deref() {
        change = change.external_id(external_id);
    }

    let transaction = if req.tx_type == TransactionType::Deposit {
        let percent = state.settings.get_int(REFERRAL_COMMISSION_PERCENT).await;
        state.db.record_deposit(&change, percent).await?
    } else {
        state.db.adjust_balance(&change).await?
    };
    let user = state
        .db
        .get_user(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Пользователь", id))?;
    Ok(Json(BalanceResponse {
        transaction,
        balance_kopeks: user.balance_kopeks,
    }))
}

async fn delete_user(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    caller.require("users:write")?;
    if state.db.delete_user(id).await? {
        tracing::info!(user_id = id, token_id = caller.token_id, "User deleted via API");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Пользователь", id))
    }
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::*;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn create_update_and_credit_user() {
        let state = state().await;
        let token = issue_token(&state, &["users:*"]).await;

        let (status, user) = call(
            &state,
            "POST",
            "/users",
            Some(&token),
            Some(json!({"telegram_id": 1001, "username": "alice"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = user["id"].as_i64().unwrap();

        let (status, _) = call(
            &state,
            "POST",
            "/users",
            Some(&token),
            Some(json!({"telegram_id": 1001})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(
            &state,
            "POST",
            &format!("/users/{}/balance", id),
            Some(&token),
            Some(json!({"amount_kopeks": 15000})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance_kopeks"], 15000);
        assert_eq!(body["transaction"]["tx_type"], "deposit");

        let (status, body) = call(
            &state,
            "POST",
            &format!("/users/{}/balance", id),
            Some(&token),
            Some(json!({"amount_kopeks": 20000, "tx_type": "withdrawal"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].is_string());

        let (status, body) = call(
            &state,
            "PATCH",
            &format!("/users/{}", id),
            Some(&token),
            Some(json!({"status": "blocked"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "blocked");

        let (status, _) = call(
            &state,
            "PATCH",
            &format!("/users/{}", id),
            Some(&token),
            Some(json!({"status": "banana"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, page) = call(&state, "GET", "/users?search=alice", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 1);
        assert_eq!(page["limit"], 50);
    }
}
