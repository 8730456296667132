use super::{ApiCaller, ApiError, AppState, Page, PageParams};
use crate::db::{Transaction, TransactionFilter, TransactionStats};
use axum::{
    extract::{Query, State},
    routing::get,
    Extension, Json, Router,
};
use serde::Deserialize;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/transactions", get(list_transactions))
        .route("/transactions/stats", get(transaction_stats))
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    #[serde(default = "default_days")]
    days: i64,
}

fn default_days() -> i64 {
    30
}

async fn list_transactions(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Query(page): Query<PageParams>,
    Query(filter): Query<TransactionFilter>,
) -> Result<Json<Page<Transaction>>, ApiError> {
    caller.require("transactions:read")?;
    let items = state
        .db
        .list_transactions(&filter, page.limit(), page.offset())
        .await?;
    let total = state.db.count_transactions(&filter).await?;
    Ok(Json(Page::new(items, total, &page)))
}

async fn transaction_stats(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiCaller>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<TransactionStats>, ApiError> {
    caller.require("transactions:read")?;
    Ok(Json(state.db.transaction_stats(query.days).await?))
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::*;
    use crate::db::{BalanceChange, NewUser, TransactionType};
    use axum::http::StatusCode;

    #[tokio::test]
    async fn filters_by_type_and_reports_stats() {
        let state = state().await;
        let token = issue_token(&state, &["transactions:read"]).await;
        let (user, _) = state
            .db
            .get_or_create_user(&NewUser {
                telegram_id: 5,
                ..Default::default()
            })
            .await
            .unwrap();
        state
            .db
            .adjust_balance(
                &BalanceChange::new(user.id, 10_000, TransactionType::Deposit)
                    .payment_method("telegram_stars"),
            )
            .await
            .unwrap();
        state
            .db
            .adjust_balance(&BalanceChange::new(user.id, 3_000, TransactionType::Withdrawal))
            .await
            .unwrap();

        let (status, page) = call(
            &state,
            "GET",
            "/transactions?tx_type=deposit",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 1);
        assert_eq!(page["items"][0]["payment_method"], "telegram_stars");

        let (status, stats) = call(&state, "GET", "/transactions/stats?days=7", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["deposits_by_method"][0]["total_kopeks"], 10_000);
    }
}
