use super::{ApiCaller, ApiError, AppState};
use crate::db::{current_unix_timestamp, ApiToken};
use crate::security::{display_prefix, generate_api_token, hash_api_token};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tokens", get(list_tokens).post(create_token))
        .route("/tokens/{id}/revoke", post(revoke_token))
        .route("/tokens/{id}", delete(delete_token))
}

#[derive(Debug, Serialize)]
struct TokenView {
    #[serde(flatten)]
    token: ApiToken,
    permissions: Vec<String>,
}

impl From<ApiToken> for TokenView {
    fn from(token: ApiToken) -> Self {
        Self {
            permissions: token.permission_list(),
            token,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateTokenRequest {
    name: String,
    #[serde(default)]
    permissions: Vec<String>,
    expires_at: Option<i64>,
}

/// Открытое значение токена возвращается только здесь.
#[derive(Debug, Serialize)]
struct CreatedToken {
    #[serde(flatten)]
    view: TokenView,
    token: String,
}

async fn list_tokens(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
) -> Result<Json<Vec<TokenView>>, ApiError> {
    caller.require("tokens:read")?;
    let tokens = state.db.list_api_tokens().await?;
    Ok(Json(tokens.into_iter().map(TokenView::from).collect()))
}

async fn create_token(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Json(req): Json<CreateTokenRequest>,
) -> Result<(StatusCode, Json<CreatedToken>), ApiError> {
    caller.require("tokens:write")?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("Пустое имя токена".to_string()));
    }
    if req.permissions.is_empty() {
        return Err(ApiError::BadRequest("Нужно указать хотя бы одно право".to_string()));
    }
    let now = current_unix_timestamp()?;
    if req.expires_at.is_some_and(|at| at <= now) {
        return Err(ApiError::BadRequest("expires_at в прошлом".to_string()));
    }

    let raw = generate_api_token();
    let token = state
        .db
        .create_api_token(
            name,
            &hash_api_token(&raw, state.token_hash_algorithm),
            &display_prefix(&raw),
            &req.permissions,
            req.expires_at,
            Some(&caller.label()),
        )
        .await?;
    tracing::info!(token_id = token.id, created_by = caller.token_id, "API token created");
    Ok((
        StatusCode::CREATED,
        Json(CreatedToken {
            view: token.into(),
            token: raw,
        }),
    ))
}

async fn revoke_token(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
) -> Result<Json<TokenView>, ApiError> {
    caller.require("tokens:write")?;
    let token = state
        .db
        .revoke_api_token(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Токен", id))?;
    tracing::info!(token_id = id, revoked_by = caller.token_id, "API token revoked");
    Ok(Json(token.into()))
}

async fn delete_token(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    caller.require("tokens:write")?;
    if state.db.delete_api_token(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Токен", id))
    }
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::*;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn created_token_authenticates_until_revoked() {
        let state = state().await;
        let admin = issue_token(&state, &["*"]).await;

        let (status, created) = call(
            &state,
            "POST",
            "/tokens",
            Some(&admin),
            Some(json!({"name": "panel", "permissions": ["stats:read"]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let raw = created["token"].as_str().unwrap().to_string();
        assert!(raw.starts_with("vsa_"));
        assert_eq!(created["permissions"], json!(["stats:read"]));
        assert!(created.get("token_hash").is_none());

        let (status, _) = call(&state, "GET", "/stats/overview", Some(&raw), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&state, "GET", "/tokens", Some(&raw), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &state,
            "POST",
            &format!("/tokens/{}/revoke", created["id"]),
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&state, "GET", "/stats/overview", Some(&raw), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
