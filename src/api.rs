//! REST API для админ-панели.

mod auth;
mod broadcasts;
mod campaigns;
mod error;
mod partners;
mod pinned;
mod polls;
mod settings;
mod stats;
mod subscriptions;
mod tariffs;
mod tickets;
mod tokens;
mod transactions;
mod users;

pub use auth::ApiCaller;
pub use error::ApiError;

use crate::bot::menu_cache::MenuButtonCache;
use crate::broadcast::Broadcaster;
use crate::config::ApiConfig;
use crate::db::Db;
use crate::polls::PollService;
use crate::security::HashAlgorithm;
use crate::settings::RuntimeSettings;
use crate::stars::StarsRateService;
use axum::{middleware, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use teloxide::Bot;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

const DEFAULT_PAGE_LIMIT: i64 = 50;
const MAX_PAGE_LIMIT: i64 = 500;

pub struct ApiState {
    pub db: Arc<Db>,
    pub settings: Arc<RuntimeSettings>,
    pub stars: Arc<StarsRateService>,
    pub menu_cache: Arc<MenuButtonCache>,
    pub polls: PollService,
    pub broadcaster: Broadcaster,
    pub bot: Bot,
    pub token_hash_algorithm: HashAlgorithm,
}

pub type AppState = Arc<ApiState>;

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PageParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl PageParams {
    pub fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, params: &PageParams) -> Self {
        Self {
            items,
            total,
            limit: params.limit(),
            offset: params.offset(),
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub fn router(state: AppState, cors_permissive: bool) -> Router {
    let protected = Router::new()
        .merge(stats::routes())
        .merge(users::routes())
        .merge(tariffs::routes())
        .merge(subscriptions::routes())
        .merge(transactions::routes())
        .merge(tickets::routes())
        .merge(settings::routes())
        .merge(campaigns::routes())
        .merge(broadcasts::routes())
        .merge(pinned::routes())
        .merge(partners::routes())
        .merge(polls::routes())
        .merge(tokens::routes())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    let app = Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if cors_permissive {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

pub async fn serve(state: AppState, config: &ApiConfig) -> Result<(), anyhow::Error> {
    let app = router(state, config.cors_permissive);
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .map_err(|e| anyhow::anyhow!("Не удалось занять {}: {}", config.listen, e))?;
    tracing::info!(listen = %config.listen, "REST API listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use super::auth::API_KEY_HEADER;
    use crate::config::{Config, StarsConfig};
    use crate::security::{display_prefix, generate_api_token, hash_api_token};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    pub async fn state() -> AppState {
        let db = Arc::new(Db::open_in_memory().await.unwrap());
        let config = Config::parse("").unwrap();
        let settings = Arc::new(RuntimeSettings::load(db.clone(), &config).await.unwrap());
        let stars = Arc::new(StarsRateService::new(&StarsConfig::default(), settings.clone()).unwrap());
        let menu_cache = Arc::new(MenuButtonCache::new(settings.clone()));
        let bot = Bot::new("123456:TEST");
        Arc::new(ApiState {
            polls: PollService::new(db.clone(), bot.clone()),
            broadcaster: Broadcaster::new(db.clone(), bot.clone()),
            db,
            settings,
            stars,
            menu_cache,
            bot,
            token_hash_algorithm: HashAlgorithm::Sha256,
        })
    }

    pub async fn issue_token(state: &AppState, permissions: &[&str]) -> String {
        let token = generate_api_token();
        let permissions = permissions.iter().map(|p| p.to_string()).collect::<Vec<_>>();
        state
            .db
            .create_api_token(
                "test",
                &hash_api_token(&token, state.token_hash_algorithm),
                &display_prefix(&token),
                &permissions,
                None,
                None,
            )
            .await
            .unwrap();
        token
    }

    pub async fn call(
        state: &AppState,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(API_KEY_HEADER, token);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router(state.clone(), false).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use axum::http::StatusCode;

    #[test]
    fn page_params_are_clamped() {
        let params = super::PageParams {
            limit: Some(10_000),
            offset: Some(-5),
        };
        assert_eq!(params.limit(), 500);
        assert_eq!(params.offset(), 0);
        assert_eq!(super::PageParams::default().limit(), 50);
    }

    #[tokio::test]
    async fn health_is_public() {
        let state = state().await;
        let (status, body) = call(&state, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn missing_or_unknown_key_is_unauthorized() {
        let state = state().await;
        let (status, body) = call(&state, "GET", "/users", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["detail"].is_string());

        let (status, _) = call(&state, "GET", "/users", Some("vsa_unknown"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn revoked_token_is_unauthorized() {
        let state = state().await;
        let token = issue_token(&state, &["*"]).await;
        let id = state.db.list_api_tokens().await.unwrap()[0].id;
        state.db.revoke_api_token(id).await.unwrap();
        let (status, _) = call(&state, "GET", "/users", Some(&token), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_permission_is_forbidden() {
        let state = state().await;
        let token = issue_token(&state, &["tariffs:read"]).await;
        let (status, body) = call(&state, "GET", "/users", Some(&token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["detail"].as_str().unwrap().contains("users:read"));

        let (status, _) = call(&state, "GET", "/tariffs", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_user_is_not_found() {
        let state = state().await;
        let token = issue_token(&state, &["users:*"]).await;
        let (status, body) = call(&state, "GET", "/users/999", Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["detail"].is_string());
    }
}
