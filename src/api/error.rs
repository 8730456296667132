use crate::db::{BalanceError, PurchaseError};
use crate::settings::SettingsError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Требуется действующий API-ключ")]
    Unauthorized,
    #[error("Недостаточно прав: требуется {0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        ApiError::NotFound(format!("{} {} не найден(а)", what, id))
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self {
            ApiError::Internal(error) => {
                tracing::error!(error = %error, "API request failed");
                "Внутренняя ошибка сервера".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<BalanceError> for ApiError {
    fn from(err: BalanceError) -> Self {
        match err {
            BalanceError::InvalidAmount | BalanceError::InsufficientFunds => {
                ApiError::BadRequest(err.to_string())
            }
            BalanceError::UserNotFound => ApiError::NotFound(err.to_string()),
            BalanceError::Database(e) => ApiError::Internal(e.into()),
            BalanceError::Other(e) => ApiError::Internal(e),
        }
    }
}

impl From<PurchaseError> for ApiError {
    fn from(err: PurchaseError) -> Self {
        match err {
            PurchaseError::TariffNotFound => ApiError::NotFound(err.to_string()),
            PurchaseError::TariffInactive => ApiError::BadRequest(err.to_string()),
            PurchaseError::Balance(e) => e.into(),
            PurchaseError::Database(e) => ApiError::Internal(e.into()),
            PurchaseError::Other(e) => ApiError::Internal(e),
        }
    }
}

impl From<SettingsError> for ApiError {
    fn from(err: SettingsError) -> Self {
        match err {
            SettingsError::UnknownKey(_) | SettingsError::InvalidValue { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            SettingsError::Storage(e) => ApiError::Internal(e),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Internal(err.into())
    }
}
