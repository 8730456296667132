use super::{ApiCaller, ApiError, AppState};
use crate::db::OverviewStats;
use crate::stars::RateQuote;
use axum::{extract::State, routing::get, Extension, Json, Router};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/stats/overview", get(overview))
        .route("/stars/rate", get(stars_rate))
}

async fn overview(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
) -> Result<Json<OverviewStats>, ApiError> {
    caller.require("stats:read")?;
    Ok(Json(state.db.overview_stats().await?))
}

async fn stars_rate(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
) -> Result<Json<RateQuote>, ApiError> {
    caller.require("stats:read")?;
    Ok(Json(state.stars.current_rate().await))
}
