use super::Db;
use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ReferrerSummary {
    pub user_id: i64,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub referral_code: Option<String>,
    pub referrals_count: i64,
    pub paying_referrals: i64,
    pub earned_kopeks: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ReferralEntry {
    pub user_id: i64,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub created_at: i64,
    pub deposits_kopeks: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReferrerDetail {
    #[serde(flatten)]
    pub summary: ReferrerSummary,
    pub referrals: Vec<ReferralEntry>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PartnerTotals {
    pub referrers: i64,
    pub referred_users: i64,
    pub paying_referrals: i64,
    pub rewards_paid_kopeks: i64,
}

const REFERRER_SELECT: &str = "SELECT u.id AS user_id, u.telegram_id, u.username, u.referral_code,
        (SELECT COUNT(*) FROM users r WHERE r.referred_by_id = u.id) AS referrals_count,
        (SELECT COUNT(DISTINCT t.user_id) FROM transactions t JOIN users r ON r.id = t.user_id
            WHERE r.referred_by_id = u.id AND t.tx_type = 'deposit' AND t.is_completed = 1) AS paying_referrals,
        (SELECT COALESCE(SUM(t.amount_kopeks), 0) FROM transactions t
            WHERE t.user_id = u.id AND t.tx_type = 'referral_reward') AS earned_kopeks
    FROM users u";

impl Db {
    /// Пользователи, у которых есть хотя бы один приглашённый.
    pub async fn list_referrers(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReferrerSummary>, anyhow::Error> {
        let rows = sqlx::query_as::<_, ReferrerSummary>(&format!(
            "{} WHERE EXISTS (SELECT 1 FROM users r WHERE r.referred_by_id = u.id)
             ORDER BY referrals_count DESC, u.id ASC LIMIT ? OFFSET ?",
            REFERRER_SELECT
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count_referrers(&self) -> Result<i64, anyhow::Error> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(DISTINCT referred_by_id) FROM users WHERE referred_by_id IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    pub async fn get_referrer_detail(
        &self,
        user_id: i64,
    ) -> Result<Option<ReferrerDetail>, anyhow::Error> {
        let summary = sqlx::query_as::<_, ReferrerSummary>(&format!(
            "{} WHERE u.id = ?",
            REFERRER_SELECT
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(summary) = summary else {
            return Ok(None);
        };

        let referrals = sqlx::query_as::<_, ReferralEntry>(
            "SELECT r.id AS user_id, r.telegram_id, r.username, r.created_at,
                    (SELECT COALESCE(SUM(t.amount_kopeks), 0) FROM transactions t
                        WHERE t.user_id = r.id AND t.tx_type = 'deposit' AND t.is_completed = 1) AS deposits_kopeks
             FROM users r WHERE r.referred_by_id = ?
             ORDER BY r.created_at DESC, r.id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(ReferrerDetail { summary, referrals }))
    }

    pub async fn partner_totals(&self) -> Result<PartnerTotals, anyhow::Error> {
        let totals = sqlx::query_as::<_, PartnerTotals>(
            "SELECT
                (SELECT COUNT(DISTINCT referred_by_id) FROM users WHERE referred_by_id IS NOT NULL) AS referrers,
                (SELECT COUNT(*) FROM users WHERE referred_by_id IS NOT NULL) AS referred_users,
                (SELECT COUNT(DISTINCT t.user_id) FROM transactions t JOIN users r ON r.id = t.user_id
                    WHERE r.referred_by_id IS NOT NULL AND t.tx_type = 'deposit' AND t.is_completed = 1) AS paying_referrals,
                (SELECT COALESCE(SUM(amount_kopeks), 0) FROM transactions WHERE tx_type = 'referral_reward') AS rewards_paid_kopeks",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{BalanceChange, NewUser, TransactionType};

    #[tokio::test]
    async fn referrer_earnings_follow_deposits() {
        let db = Db::open_in_memory().await.unwrap();
        let (referrer, _) = db
            .get_or_create_user(&NewUser {
                telegram_id: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        let (friend, _) = db
            .get_or_create_user(&NewUser {
                telegram_id: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(db.set_referrer(friend.id, referrer.id).await.unwrap());

        db.record_deposit(
            &BalanceChange::new(friend.id, 10_000, TransactionType::Deposit)
                .payment_method("manual"),
            10,
        )
        .await
        .unwrap();

        let referrers = db.list_referrers(50, 0).await.unwrap();
        assert_eq!(referrers.len(), 1);
        assert_eq!(referrers[0].referrals_count, 1);
        assert_eq!(referrers[0].paying_referrals, 1);
        assert_eq!(referrers[0].earned_kopeks, 1_000);

        let detail = db.get_referrer_detail(referrer.id).await.unwrap().unwrap();
        assert_eq!(detail.referrals[0].deposits_kopeks, 10_000);

        let totals = db.partner_totals().await.unwrap();
        assert_eq!(totals.referrers, 1);
        assert_eq!(totals.rewards_paid_kopeks, 1_000);
        assert_eq!(db.count_referrers().await.unwrap(), 1);
    }
}
