use super::{ApiCaller, ApiError, AppState};
use crate::db::{Tariff, TariffInput, TariffUpdate};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tariffs", get(list_tariffs).post(create_tariff))
        .route(
            "/tariffs/{id}",
            get(get_tariff).patch(update_tariff).delete(delete_tariff),
        )
}

#[derive(Debug, Serialize)]
struct TariffView {
    #[serde(flatten)]
    tariff: Tariff,
    allowed_squads: Vec<String>,
}

impl From<Tariff> for TariffView {
    fn from(tariff: Tariff) -> Self {
        Self {
            allowed_squads: tariff.squads(),
            tariff,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TariffListQuery {
    #[serde(default)]
    active_only: bool,
}

async fn list_tariffs(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Query(query): Query<TariffListQuery>,
) -> Result<Json<Vec<TariffView>>, ApiError> {
    caller.require("tariffs:read")?;
    let tariffs = state.db.list_tariffs(query.active_only).await?;
    Ok(Json(tariffs.into_iter().map(TariffView::from).collect()))
}

async fn get_tariff(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
) -> Result<Json<TariffView>, ApiError> {
    caller.require("tariffs:read")?;
    let tariff = state
        .db
        .get_tariff(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Тариф", id))?;
    Ok(Json(tariff.into()))
}

async fn create_tariff(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Json(input): Json<TariffInput>,
) -> Result<(StatusCode, Json<TariffView>), ApiError> {
    caller.require("tariffs:write")?;
    input.validate().map_err(ApiError::BadRequest)?;
    let tariff = state.db.create_tariff(&input).await?;
    tracing::info!(tariff_id = tariff.id, name = %tariff.name, "Tariff created");
    Ok((StatusCode::CREATED, Json(tariff.into())))
}

async fn update_tariff(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
    Json(update): Json<TariffUpdate>,
) -> Result<Json<TariffView>, ApiError> {
    caller.require("tariffs:write")?;
    update.validate().map_err(ApiError::BadRequest)?;
    let tariff = state
        .db
        .update_tariff(id, &update)
        .await?
        .ok_or_else(|| ApiError::not_found("Тариф", id))?;
    Ok(Json(tariff.into()))
}

async fn delete_tariff(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    caller.require("tariffs:write")?;
    if state.db.delete_tariff(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Тариф", id))
    }
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::*;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn tariff_lifecycle() {
        let state = state().await;
        let token = issue_token(&state, &["tariffs:read", "tariffs:write"]).await;

        let (status, _) = call(
            &state,
            "POST",
            "/tariffs",
            Some(&token),
            Some(json!({"name": "Месяц", "period_days": 0, "price_kopeks": 19900})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, tariff) = call(
            &state,
            "POST",
            "/tariffs",
            Some(&token),
            Some(json!({
                "name": "Месяц",
                "period_days": 30,
                "price_kopeks": 19900,
                "allowed_squads": ["nl-1"]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(tariff["allowed_squads"], json!(["nl-1"]));
        let id = tariff["id"].as_i64().unwrap();

        let (status, updated) = call(
            &state,
            "PATCH",
            &format!("/tariffs/{}", id),
            Some(&token),
            Some(json!({"is_active": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["is_active"], false);

        let (_, active) = call(&state, "GET", "/tariffs?active_only=true", Some(&token), None).await;
        assert_eq!(active, json!([]));

        let (status, _) = call(&state, "DELETE", &format!("/tariffs/{}", id), Some(&token), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&state, "GET", &format!("/tariffs/{}", id), Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
