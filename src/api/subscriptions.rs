use super::{ApiCaller, ApiError, AppState, Page, PageParams};
use crate::db::{
    NewSubscription, Subscription, SubscriptionUpdate, MAX_SUBSCRIPTION_DAYS, SUB_STATUS_ACTIVE,
    SUB_STATUS_DISABLED, SUB_STATUS_EXPIRED,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/subscriptions",
            get(list_subscriptions).post(create_subscription),
        )
        .route(
            "/subscriptions/{id}",
            get(get_subscription)
                .patch(update_subscription)
                .delete(delete_subscription),
        )
        .route("/subscriptions/{id}/extend", post(extend_subscription))
        .route("/subscriptions/{id}/squads", post(add_squad))
        .route("/subscriptions/{id}/squads/{squad}", delete(remove_squad))
}

#[derive(Debug, Serialize)]
struct SubscriptionView {
    #[serde(flatten)]
    subscription: Subscription,
    connected_squads: Vec<String>,
}

impl From<Subscription> for SubscriptionView {
    fn from(subscription: Subscription) -> Self {
        Self {
            connected_squads: subscription.squads(),
            subscription,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StatusQuery {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExtendRequest {
    days: i64,
}

#[derive(Debug, Deserialize)]
struct SquadRequest {
    squad: String,
}

fn is_valid_subscription_status(status: &str) -> bool {
    matches!(
        status,
        SUB_STATUS_ACTIVE | SUB_STATUS_EXPIRED | SUB_STATUS_DISABLED
    )
}

async fn list_subscriptions(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Query(page): Query<PageParams>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Page<SubscriptionView>>, ApiError> {
    caller.require("subscriptions:read")?;
    let status = query.status.as_deref().filter(|s| !s.is_empty());
    let items = state
        .db
        .list_subscriptions(status, page.limit(), page.offset())
        .await?;
    let total = state.db.count_subscriptions(status).await?;
    Ok(Json(Page::new(
        items.into_iter().map(SubscriptionView::from).collect(),
        total,
        &page,
    )))
}

async fn get_subscription(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
) -> Result<Json<SubscriptionView>, ApiError> {
    caller.require("subscriptions:read")?;
    let subscription = state
        .db
        .get_subscription(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Подписка", id))?;
    Ok(Json(subscription.into()))
}

async fn create_subscription(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Json(new): Json<NewSubscription>,
) -> Result<(StatusCode, Json<SubscriptionView>), ApiError> {
    caller.require("subscriptions:write")?;
    if !(1..=MAX_SUBSCRIPTION_DAYS).contains(&new.duration_days) {
        return Err(ApiError::BadRequest(format!(
            "duration_days должен быть от 1 до {}",
            MAX_SUBSCRIPTION_DAYS
        )));
    }
    if state.db.get_user(new.user_id).await?.is_none() {
        return Err(ApiError::not_found("Пользователь", new.user_id));
    }
    let subscription = state
        .db
        .create_subscription(&new)
        .await?
        .ok_or_else(|| ApiError::Conflict("У пользователя уже есть подписка".to_string()))?;
    tracing::info!(
        subscription_id = subscription.id,
        user_id = subscription.user_id,
        "Subscription created via API"
    );
    Ok((StatusCode::CREATED, Json(subscription.into())))
}

async fn update_subscription(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
    Json(update): Json<SubscriptionUpdate>,
) -> Result<Json<SubscriptionView>, ApiError> {
    caller.require("subscriptions:write")?;
    if let Some(status) = update.status.as_deref()
        && !is_valid_subscription_status(status)
    {
        return Err(ApiError::BadRequest(format!("Неизвестный статус: {}", status)));
    }
    if update.device_limit.is_some_and(|limit| limit < 1) {
        return Err(ApiError::BadRequest("device_limit должен быть >= 1".to_string()));
    }
    let subscription = state
        .db
        .update_subscription(id, &update)
        .await?
        .ok_or_else(|| ApiError::not_found("Подписка", id))?;
    Ok(Json(subscription.into()))
}

async fn extend_subscription(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
    Json(req): Json<ExtendRequest>,
) -> Result<Json<SubscriptionView>, ApiError> {
    caller.require("subscriptions:write")?;
    if !(1..=MAX_SUBSCRIPTION_DAYS).contains(&req.days) {
        return Err(ApiError::BadRequest(format!(
            "days должен быть от 1 до {}",
            MAX_SUBSCRIPTION_DAYS
        )));
    }
    let subscription = state
        .db
        .extend_subscription(id, req.days)
        .await?
        .ok_or_else(|| ApiError::not_found("Подписка", id))?;
    tracing::info!(subscription_id = id, days = req.days, "Subscription extended");
    Ok(Json(subscription.into()))
}

async fn add_squad(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
    Json(req): Json<SquadRequest>,
) -> Result<Json<SubscriptionView>, ApiError> {
    caller.require("subscriptions:write")?;
    let squad = req.squad.trim();
    if squad.is_empty() {
        return Err(ApiError::BadRequest("Пустое имя сквада".to_string()));
    }
    let subscription = state
        .db
        .add_subscription_squad(id, squad)
        .await?
        .ok_or_else(|| ApiError::not_found("Подписка", id))?;
    Ok(Json(subscription.into()))
}

async fn remove_squad(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path((id, squad)): Path<(i64, String)>,
) -> Result<Json<SubscriptionView>, ApiError> {
    caller.require("subscriptions:write")?;
    let subscription = state
        .db
        .remove_subscription_squad(id, &squad)
        .await?
        .ok_or_else(|| ApiError::not_found("Подписка", id))?;
    Ok(Json(subscription.into()))
}

async fn delete_subscription(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    caller.require("subscriptions:write")?;
    if state.db.delete_subscription(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Подписка", id))
    }
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::*;
    use crate::db::NewUser;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn second_subscription_conflicts_and_squads_round_trip() {
        let state = state().await;
        let token = issue_token(&state, &["subscriptions:*"]).await;
        let (user, _) = state
            .db
            .get_or_create_user(&NewUser {
                telegram_id: 42,
                ..Default::default()
            })
            .await
            .unwrap();

        let body = json!({"user_id": user.id, "duration_days": 30});
        let (status, sub) = call(&state, "POST", "/subscriptions", Some(&token), Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = sub["id"].as_i64().unwrap();

        let (status, _) = call(&state, "POST", "/subscriptions", Some(&token), Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, sub) = call(
            &state,
            "POST",
            &format!("/subscriptions/{}/squads", id),
            Some(&token),
            Some(json!({"squad": "de-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sub["connected_squads"], json!(["de-1"]));

        let (_, sub) = call(
            &state,
            "DELETE",
            &format!("/subscriptions/{}/squads/de-1", id),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(sub["connected_squads"], json!([]));

        let (status, _) = call(
            &state,
            "POST",
            "/subscriptions/999/extend",
            Some(&token),
            Some(json!({"days": 7})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &state,
            "POST",
            &format!("/subscriptions/{}/extend", id),
            Some(&token),
            Some(json!({"days": i64::MAX / 1000})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
