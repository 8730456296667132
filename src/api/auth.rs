//! Проверка `X-API-Key` и прав токена.

use super::{ApiError, AppState};
use crate::db::{current_unix_timestamp, ApiToken};
use crate::security::{hash_api_token, permission_granted};
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Токен, которым аутентифицирован запрос.
#[derive(Debug, Clone)]
pub struct ApiCaller {
    pub token_id: i64,
    pub name: String,
    permissions: Vec<String>,
}

impl ApiCaller {
    pub fn from_token(token: &ApiToken) -> Self {
        Self {
            token_id: token.id,
            name: token.name.clone(),
            permissions: token.permission_list(),
        }
    }

    pub fn require(&self, permission: &str) -> Result<(), ApiError> {
        if permission_granted(&self.permissions, permission) {
            Ok(())
        } else {
            tracing::debug!(token_id = self.token_id, permission, "Permission denied");
            Err(ApiError::Forbidden(permission.to_string()))
        }
    }

    /// Подпись для полей `created_by`.
    pub fn label(&self) -> String {
        format!("api:{}", self.name)
    }
}

pub async fn require_api_key(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let raw = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ApiError::Unauthorized)?;

    let hash = hash_api_token(raw, state.token_hash_algorithm);
    let token = state
        .db
        .find_active_api_token(&hash)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    if !token.is_usable_at(current_unix_timestamp()?) {
        return Err(ApiError::Unauthorized);
    }

    let ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string());
    state.db.touch_api_token(token.id, ip.as_deref()).await?;

    req.extensions_mut().insert(ApiCaller::from_token(&token));
    Ok(next.run(req).await)
}
