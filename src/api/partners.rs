use super::{ApiCaller, ApiError, AppState, Page, PageParams};
use crate::db::{PartnerTotals, ReferrerDetail, ReferrerSummary};
use axum::{
    extract::{Path, Query, State},
    routing::get,
    Extension, Json, Router,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/partners/stats", get(partner_stats))
        .route("/partners/referrers", get(list_referrers))
        .route("/partners/referrers/{user_id}", get(get_referrer))
}

async fn partner_stats(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
) -> Result<Json<PartnerTotals>, ApiError> {
    caller.require("partners:read")?;
    Ok(Json(state.db.partner_totals().await?))
}

async fn list_referrers(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Query(page): Query<PageParams>,
) -> Result<Json<Page<ReferrerSummary>>, ApiError> {
    caller.require("partners:read")?;
    let items = state
        .db
        .list_referrers(page.limit(), page.offset())
        .await?;
    let total = state.db.count_referrers().await?;
    Ok(Json(Page::new(items, total, &page)))
}

async fn get_referrer(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(user_id): Path<i64>,
) -> Result<Json<ReferrerDetail>, ApiError> {
    caller.require("partners:read")?;
    let detail = state
        .db
        .get_referrer_detail(user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Пользователь", user_id))?;
    Ok(Json(detail))
}
