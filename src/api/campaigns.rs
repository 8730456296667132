use super::{ApiCaller, ApiError, AppState, Page, PageParams};
use crate::db::{is_unique_violation, Campaign, CampaignInput, CampaignStats, CampaignUpdate};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Extension, Json, Router,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/campaigns", get(list_campaigns).post(create_campaign))
        .route(
            "/campaigns/{id}",
            get(get_campaign)
                .patch(update_campaign)
                .delete(delete_campaign),
        )
        .route("/campaigns/{id}/stats", get(campaign_stats))
}

fn is_duplicate(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .is_some_and(is_unique_violation)
}

async fn list_campaigns(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Query(page): Query<PageParams>,
) -> Result<Json<Page<Campaign>>, ApiError> {
    caller.require("campaigns:read")?;
    let items = state
        .db
        .list_campaigns(page.limit(), page.offset())
        .await?;
    let total = state.db.count_campaigns().await?;
    Ok(Json(Page::new(items, total, &page)))
}

async fn get_campaign(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
) -> Result<Json<Campaign>, ApiError> {
    caller.require("campaigns:read")?;
    let campaign = state
        .db
        .get_campaign(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Кампания", id))?;
    Ok(Json(campaign))
}

async fn create_campaign(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Json(input): Json<CampaignInput>,
) -> Result<(StatusCode, Json<Campaign>), ApiError> {
    caller.require("campaigns:write")?;
    input.validate().map_err(ApiError::BadRequest)?;
    let campaign = match state.db.create_campaign(&input).await {
        Ok(campaign) => campaign,
        Err(e) if is_duplicate(&e) => {
            return Err(ApiError::Conflict(format!(
                "Параметр {} уже используется",
                input.start_parameter
            )));
        }
        Err(e) => return Err(e.into()),
    };
    tracing::info!(
        campaign_id = campaign.id,
        start_parameter = %campaign.start_parameter,
        "Campaign created"
    );
    Ok((StatusCode::CREATED, Json(campaign)))
}

async fn update_campaign(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
    Json(update): Json<CampaignUpdate>,
) -> Result<Json<Campaign>, ApiError> {
    caller.require("campaigns:write")?;
    update.validate().map_err(ApiError::BadRequest)?;
    let campaign = state
        .db
        .update_campaign(id, &update)
        .await?
        .ok_or_else(|| ApiError::not_found("Кампания", id))?;
    Ok(Json(campaign))
}

async fn delete_campaign(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    caller.require("campaigns:write")?;
    if state.db.delete_campaign(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Кампания", id))
    }
}

async fn campaign_stats(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
) -> Result<Json<CampaignStats>, ApiError> {
    caller.require("campaigns:read")?;
    if state.db.get_campaign(id).await?.is_none() {
        return Err(ApiError::not_found("Кампания", id));
    }
    Ok(Json(state.db.campaign_stats(id).await?))
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::*;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn duplicate_start_parameter_conflicts() {
        let state = state().await;
        let token = issue_token(&state, &["campaigns:*"]).await;
        let body = json!({
            "name": "Осень",
            "start_parameter": "autumn",
            "bonus_type": "balance",
            "balance_bonus_kopeks": 5000
        });

        let (status, campaign) = call(&state, "POST", "/campaigns", Some(&token), Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = call(&state, "POST", "/campaigns", Some(&token), Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, stats) = call(
            &state,
            "GET",
            &format!("/campaigns/{}/stats", campaign["id"]),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["registrations"], 0);

        let (status, _) = call(
            &state,
            "POST",
            "/campaigns",
            Some(&token),
            Some(json!({"name": "Плохая", "start_parameter": "ref123"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
