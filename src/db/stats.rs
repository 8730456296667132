use super::{current_unix_timestamp, Db};
use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, Default, FromRow, Serialize)]
pub struct OverviewStats {
    pub users_total: i64,
    pub users_active: i64,
    pub users_blocked: i64,
    pub users_new_today: i64,
    pub subscriptions_active: i64,
    pub subscriptions_trial: i64,
    pub subscriptions_expired: i64,
    pub deposits_today_kopeks: i64,
    pub deposits_month_kopeks: i64,
    pub deposits_total_kopeks: i64,
    pub balances_total_kopeks: i64,
    pub tickets_open: i64,
}

impl Db {
    /// Сводка для дашборда. «Сегодня» и «месяц» считаются скользящими окнами.
    pub async fn overview_stats(&self) -> Result<OverviewStats, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let day_ago = now - 86_400;
        let month_ago = now - 30 * 86_400;

        let stats = sqlx::query_as::<_, OverviewStats>(
            "SELECT
                (SELECT COUNT(*) FROM users) AS users_total,
                (SELECT COUNT(*) FROM users WHERE status = 'active') AS users_active,
                (SELECT COUNT(*) FROM users WHERE status = 'blocked') AS users_blocked,
                (SELECT COUNT(*) FROM users WHERE created_at >= ?1) AS users_new_today,
                (SELECT COUNT(*) FROM subscriptions WHERE status = 'active' AND is_trial = 0) AS subscriptions_active,
                (SELECT COUNT(*) FROM subscriptions WHERE status = 'active' AND is_trial = 1) AS subscriptions_trial,
                (SELECT COUNT(*) FROM subscriptions WHERE status = 'expired') AS subscriptions_expired,
                (SELECT COALESCE(SUM(amount_kopeks), 0) FROM transactions
                    WHERE tx_type = 'deposit' AND is_completed = 1 AND created_at >= ?1) AS deposits_today_kopeks,
                (SELECT COALESCE(SUM(amount_kopeks), 0) FROM transactions
                    WHERE tx_type = 'deposit' AND is_completed = 1 AND created_at >= ?2) AS deposits_month_kopeks,
                (SELECT COALESCE(SUM(amount_kopeks), 0) FROM transactions
                    WHERE tx_type = 'deposit' AND is_completed = 1) AS deposits_total_kopeks,
                (SELECT COALESCE(SUM(balance_kopeks), 0) FROM users) AS balances_total_kopeks,
                (SELECT COUNT(*) FROM tickets WHERE status != 'closed') AS tickets_open",
        )
        .bind(day_ago)
        .bind(month_ago)
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{BalanceChange, NewUser, TransactionType};

    #[tokio::test]
    async fn overview_counts_users_and_deposits() {
        let db = Db::open_in_memory().await.unwrap();
        assert_eq!(db.overview_stats().await.unwrap().users_total, 0);

        let (user, _) = db
            .get_or_create_user(&NewUser {
                telegram_id: 5,
                ..Default::default()
            })
            .await
            .unwrap();
        db.record_deposit(&BalanceChange::new(user.id, 2_500, TransactionType::Deposit), 0)
            .await
            .unwrap();

        let stats = db.overview_stats().await.unwrap();
        assert_eq!(stats.users_total, 1);
        assert_eq!(stats.users_new_today, 1);
        assert_eq!(stats.deposits_today_kopeks, 2_500);
        assert_eq!(stats.balances_total_kopeks, 2_500);
    }
}
