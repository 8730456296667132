use super::{current_unix_timestamp, Db};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection};
use thiserror::Error;

const TRANSACTION_COLUMNS: &str = "id, user_id, tx_type, amount_kopeks, description, payment_method, external_id, is_completed, created_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    SubscriptionPayment,
    Refund,
    ReferralReward,
    PollReward,
    CampaignBonus,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::SubscriptionPayment => "subscription_payment",
            TransactionType::Refund => "refund",
            TransactionType::ReferralReward => "referral_reward",
            TransactionType::PollReward => "poll_reward",
            TransactionType::CampaignBonus => "campaign_bonus",
        }
    }

    /// Увеличивает ли операция баланс.
    pub fn is_credit(&self) -> bool {
        !matches!(
            self,
            TransactionType::Withdrawal | TransactionType::SubscriptionPayment
        )
    }
}

impl std::str::FromStr for TransactionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TransactionType::Deposit),
            "withdrawal" => Ok(TransactionType::Withdrawal),
            "subscription_payment" => Ok(TransactionType::SubscriptionPayment),
            "refund" => Ok(TransactionType::Refund),
            "referral_reward" => Ok(TransactionType::ReferralReward),
            "poll_reward" => Ok(TransactionType::PollReward),
            "campaign_bonus" => Ok(TransactionType::CampaignBonus),
            other => Err(anyhow::anyhow!("Неизвестный тип транзакции: {}", other)),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Transaction {
    pub id: i64,
    pub user_id: i64,
    pub tx_type: String,
    pub amount_kopeks: i64,
    pub description: Option<String>,
    pub payment_method: Option<String>,
    pub external_id: Option<String>,
    pub is_completed: bool,
    pub created_at: i64,
}

/// Изменение баланса; сумма всегда положительная, направление задаёт тип.
#[derive(Debug, Clone)]
pub struct BalanceChange<'a> {
    pub user_id: i64,
    pub amount_kopeks: i64,
    pub tx_type: TransactionType,
    pub description: Option<&'a str>,
    pub payment_method: Option<&'a str>,
    pub external_id: Option<&'a str>,
}

impl<'a> BalanceChange<'a> {
    pub fn new(user_id: i64, amount_kopeks: i64, tx_type: TransactionType) -> Self {
        Self {
            user_id,
            amount_kopeks,
            tx_type,
            description: None,
            payment_method: None,
            external_id: None,
        }
    }

    pub fn description(mut self, description: &'a str) -> Self {
        self.description = Some(description);
        self
    }

    pub fn payment_method(mut self, payment_method: &'a str) -> Self {
        self.payment_method = Some(payment_method);
        self
    }

    pub fn external_id(mut self, external_id: &'a str) -> Self {
        self.external_id = Some(external_id);
        self
    }
}

#[derive(Debug, Error)]
pub enum BalanceError {
    #[error("Сумма должна быть положительной")]
    InvalidAmount,
    #[error("Пользователь не найден")]
    UserNotFound,
    #[error("Недостаточно средств на балансе")]
    InsufficientFunds,
    #[error("Ошибка БД: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransactionFilter {
    pub user_id: Option<i64>,
    pub tx_type: Option<String>,
    pub payment_method: Option<String>,
    pub date_from: Option<i64>,
    pub date_to: Option<i64>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TypeTotal {
    pub tx_type: String,
    pub count: i64,
    pub total_kopeks: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct MethodTotal {
    pub payment_method: String,
    pub count: i64,
    pub total_kopeks: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DailyTotal {
    pub day: String,
    pub total_kopeks: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionStats {
    pub by_type: Vec<TypeTotal>,
    pub deposits_by_method: Vec<MethodTotal>,
    pub daily_deposits: Vec<DailyTotal>,
}

fn push_transaction_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &TransactionFilter) {
    if let Some(user_id) = filter.user_id {
        qb.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(tx_type) = filter.tx_type.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND tx_type = ").push_bind(tx_type.to_string());
    }
    if let Some(method) = filter.payment_method.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND payment_method = ").push_bind(method.to_string());
    }
    if let Some(from) = filter.date_from {
        qb.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(to) = filter.date_to {
        qb.push(" AND created_at < ").push_bind(to);
    }
}

/// Комиссия пригласившему; процент зажат в 0..=100, считается без переполнения.
fn referral_commission(amount_kopeks: i64, percent: i64) -> i64 {
    let commission = i128::from(amount_kopeks) * i128::from(percent.clamp(0, 100)) / 100;
    i64::try_from(commission).unwrap_or(0)
}

/// Меняет баланс и пишет транзакцию в рамках уже открытой транзакции БД.
pub(crate) async fn apply_balance_change(
    conn: &mut SqliteConnection,
    change: &BalanceChange<'_>,
    now: i64,
) -> Result<Transaction, BalanceError> {
    if change.amount_kopeks <= 0 {
        return Err(BalanceError::InvalidAmount);
    }
    let delta = if change.tx_type.is_credit() {
        change.amount_kopeks
    } else {
        -change.amount_kopeks
    };

    let updated = sqlx::query(
        "UPDATE users SET balance_kopeks = balance_kopeks + ?, updated_at = ?
         WHERE id = ? AND balance_kopeks + ? >= 0",
    )
    .bind(delta)
    .bind(now)
    .bind(change.user_id)
    .bind(delta)
    .execute(&mut *conn)
    .await?;

    if updated.rows_affected() == 0 {
        let exists = sqlx::query_scalar::<_, i64>("SELECT 1 FROM users WHERE id = ?")
            .bind(change.user_id)
            .fetch_optional(&mut *conn)
            .await?;
        return Err(if exists.is_some() {
            BalanceError::InsufficientFunds
        } else {
            BalanceError::UserNotFound
        });
    }

    let inserted = sqlx::query(
        "INSERT INTO transactions (user_id, tx_type, amount_kopeks, description, payment_method, external_id, is_completed, created_at)
         VALUES (?, ?, ?, ?, ?, ?, 1, ?)",
    )
    .bind(change.user_id)
    .bind(change.tx_type.as_str())
    .bind(change.amount_kopeks)
    .bind(change.description)
    .bind(change.payment_method)
    .bind(change.external_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let transaction = sqlx::query_as::<_, Transaction>(&format!(
        "SELECT {} FROM transactions WHERE id = ?",
        TRANSACTION_COLUMNS
    ))
    .bind(inserted.last_insert_rowid())
    .fetch_one(&mut *conn)
    .await?;
    Ok(transaction)
}

impl Db {
    pub async fn adjust_balance(
        &self,
        change: &BalanceChange<'_>,
    ) -> Result<Transaction, BalanceError> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;
        let transaction = apply_balance_change(&mut tx, change, now).await?;
        tx.commit().await?;
        tracing::info!(
            user_id = change.user_id,
            amount_kopeks = change.amount_kopeks,
            tx_type = change.tx_type.as_str(),
            "Balance changed"
        );
        Ok(transaction)
    }

    /// Пополнение + реферальная комиссия пригласившему, одной транзакцией БД.
    pub async fn record_deposit(
        &self,
        change: &BalanceChange<'_>,
        referral_commission_percent: i64,
    ) -> Result<Transaction, BalanceError> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;
        let deposit = apply_balance_change(&mut tx, change, now).await?;

        let referrer_id = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT referred_by_id FROM users WHERE id = ?",
        )
        .bind(change.user_id)
        .fetch_one(&mut *tx)
        .await?;

        let commission = referral_commission(change.amount_kopeks, referral_commission_percent);
        if let Some(referrer_id) = referrer_id
            && commission > 0
        {
            let description = format!("Комиссия с пополнения пользователя #{}", change.user_id);
            let reward = BalanceChange::new(referrer_id, commission, TransactionType::ReferralReward)
                .description(&description);
            apply_balance_change(&mut tx, &reward, now).await?;
            tracing::info!(
                referrer_id = referrer_id,
                user_id = change.user_id,
                commission_kopeks = commission,
                "Referral commission credited"
            );
        }

        tx.commit().await?;
        Ok(deposit)
    }

    pub async fn list_transactions(
        &self,
        filter: &TransactionFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Transaction>, anyhow::Error> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM transactions WHERE 1 = 1",
            TRANSACTION_COLUMNS
        ));
        push_transaction_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let rows = qb
            .build_query_as::<Transaction>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn count_transactions(&self, filter: &TransactionFilter) -> Result<i64, anyhow::Error> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM transactions WHERE 1 = 1");
        push_transaction_filter(&mut qb, filter);
        let total = qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        Ok(total)
    }

    pub async fn transaction_stats(&self, days: i64) -> Result<TransactionStats, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let since = now - days.clamp(1, 366) * 86_400;

        let by_type = sqlx::query_as::<_, TypeTotal>(
            "SELECT tx_type, COUNT(*) AS count, COALESCE(SUM(amount_kopeks), 0) AS total_kopeks
             FROM transactions
             WHERE is_completed = 1
             GROUP BY tx_type
             ORDER BY total_kopeks DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let deposits_by_method = sqlx::query_as::<_, MethodTotal>(
            "SELECT COALESCE(payment_method, 'unknown') AS payment_method, COUNT(*) AS count,
                    COALESCE(SUM(amount_kopeks), 0) AS total_kopeks
             FROM transactions
             WHERE tx_type = 'deposit' AND is_completed = 1
             GROUP BY COALESCE(payment_method, 'unknown')
             ORDER BY total_kopeks DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let daily_deposits = sqlx::query_as::<_, DailyTotal>(
            "SELECT date(created_at, 'unixepoch') AS day, COALESCE(SUM(amount_kopeks), 0) AS total_kopeks
             FROM transactions
             WHERE tx_type = 'deposit' AND is_completed = 1 AND created_at >= ?
             GROUP BY day
             ORDER BY day",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(TransactionStats {
            by_type,
            deposits_by_method,
            daily_deposits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewUser;

    async fn user(db: &Db, telegram_id: i64) -> i64 {
        let (user, _) = db
            .get_or_create_user(&NewUser {
                telegram_id,
                ..Default::default()
            })
            .await
            .unwrap();
        user.id
    }

    #[tokio::test]
    async fn debit_never_makes_balance_negative() {
        let db = Db::open_in_memory().await.unwrap();
        let user_id = user(&db, 1).await;

        db.adjust_balance(&BalanceChange::new(user_id, 500, TransactionType::Deposit))
            .await
            .unwrap();
        let err = db
            .adjust_balance(&BalanceChange::new(user_id, 600, TransactionType::Withdrawal))
            .await
            .unwrap_err();
        assert!(matches!(err, BalanceError::InsufficientFunds));

        db.adjust_balance(&BalanceChange::new(user_id, 500, TransactionType::Withdrawal))
            .await
            .unwrap();
        let stored = db.get_user(user_id).await.unwrap().unwrap();
        assert_eq!(stored.balance_kopeks, 0);
        assert_eq!(
            db.count_transactions(&TransactionFilter::default()).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn unknown_user_and_bad_amount_are_rejected() {
        let db = Db::open_in_memory().await.unwrap();
        let err = db
            .adjust_balance(&BalanceChange::new(999, 100, TransactionType::Deposit))
            .await
            .unwrap_err();
        assert!(matches!(err, BalanceError::UserNotFound));

        let user_id = user(&db, 1).await;
        let err = db
            .adjust_balance(&BalanceChange::new(user_id, 0, TransactionType::Deposit))
            .await
            .unwrap_err();
        assert!(matches!(err, BalanceError::InvalidAmount));
    }

    #[tokio::test]
    async fn deposit_pays_referral_commission() {
        let db = Db::open_in_memory().await.unwrap();
        let referrer = user(&db, 1).await;
        let referral = user(&db, 2).await;
        db.set_referrer(referral, referrer).await.unwrap();

        let change = BalanceChange::new(referral, 10_000, TransactionType::Deposit)
            .payment_method("telegram_stars");
        db.record_deposit(&change, 10).await.unwrap();

        assert_eq!(db.get_user(referral).await.unwrap().unwrap().balance_kopeks, 10_000);
        assert_eq!(db.get_user(referrer).await.unwrap().unwrap().balance_kopeks, 1_000);

        let rewards = db
            .list_transactions(
                &TransactionFilter {
                    tx_type: Some("referral_reward".to_string()),
                    ..Default::default()
                },
                10,
                0,
            )
            .await
            .unwrap();
        assert_eq!(rewards.len(), 1);
        assert_eq!(rewards[0].user_id, referrer);
    }

    #[tokio::test]
    async fn stats_group_deposits_by_method() {
        let db = Db::open_in_memory().await.unwrap();
        let user_id = user(&db, 1).await;
        for (amount, method) in [(100, "telegram_stars"), (200, "telegram_stars"), (50, "manual")] {
            let change = BalanceChange::new(user_id, amount, TransactionType::Deposit)
                .payment_method(method);
            db.record_deposit(&change, 0).await.unwrap();
        }

        let stats = db.transaction_stats(30).await.unwrap();
        let stars = stats
            .deposits_by_method
            .iter()
            .find(|row| row.payment_method == "telegram_stars")
            .unwrap();
        assert_eq!(stars.count, 2);
        assert_eq!(stars.total_kopeks, 300);
        assert_eq!(stats.daily_deposits.iter().map(|d| d.total_kopeks).sum::<i64>(), 350);
    }

    #[tokio::test]
    async fn huge_deposit_commission_does_not_overflow() {
        let db = Db::open_in_memory().await.unwrap();
        let referrer = user(&db, 1).await;
        let referral = user(&db, 2).await;
        db.set_referrer(referral, referrer).await.unwrap();

        let amount = i64::MAX / 4;
        db.record_deposit(&BalanceChange::new(referral, amount, TransactionType::Deposit), 10)
            .await
            .unwrap();
        assert_eq!(
            db.get_user(referrer).await.unwrap().unwrap().balance_kopeks,
            amount / 10
        );
    }

    #[test]
    fn commission_percent_is_clamped() {
        assert_eq!(referral_commission(1_000, 10), 100);
        assert_eq!(referral_commission(1_000, 250), 1_000);
        assert_eq!(referral_commission(1_000, -5), 0);
        assert_eq!(referral_commission(i64::MAX, 100), i64::MAX);
    }

    #[test]
    fn transaction_type_direction() {
        assert!(TransactionType::Deposit.is_credit());
        assert!(TransactionType::PollReward.is_credit());
        assert!(!TransactionType::SubscriptionPayment.is_credit());
        assert_eq!(
            "campaign_bonus".parse::<TransactionType>().unwrap(),
            TransactionType::CampaignBonus
        );
    }
}
