//! SQLite-слой: пул соединений, схема и общие хелперы.
//! Запросы по сущностям разнесены по подмодулям (`impl Db` в каждом).

mod api_tokens;
mod broadcasts;
mod campaigns;
mod partners;
mod pinned;
mod polls;
mod settings;
mod stats;
mod subscriptions;
mod tariffs;
mod tickets;
mod transactions;
mod users;

pub use api_tokens::ApiToken;
pub use broadcasts::{BroadcastRecord, BroadcastStatus};
pub use campaigns::{Campaign, CampaignBonus, CampaignInput, CampaignStats, CampaignUpdate};
pub use partners::{PartnerTotals, ReferrerDetail, ReferrerSummary};
pub use pinned::PinnedMessage;
pub use polls::{
    NewPoll, Poll, PollAnswerError, PollCompletion, PollDetail, PollQuestionDetail, PollResponse,
    PollStats, PollSummary,
};
#[cfg(test)]
pub use polls::{NewPollQuestion, PollQuestion};
pub use stats::OverviewStats;
pub use subscriptions::{
    NewSubscription, PurchaseError, Subscription, SubscriptionUpdate, MAX_SUBSCRIPTION_DAYS,
    SUB_STATUS_ACTIVE, SUB_STATUS_DISABLED, SUB_STATUS_EXPIRED,
};
pub use tariffs::{Tariff, TariffInput, TariffUpdate};
pub use tickets::{is_valid_ticket_status, Ticket, TicketMessage};
pub use transactions::{
    BalanceChange, BalanceError, Transaction, TransactionFilter, TransactionStats, TransactionType,
};
pub use users::{
    Audience, NewUser, User, UserFilter, UserUpdate, USER_STATUS_ACTIVE, USER_STATUS_BLOCKED,
    USER_STATUS_DELETED,
};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::path::Path;
use std::str::FromStr;

pub struct Db {
    pool: SqlitePool,
}

pub fn current_unix_timestamp() -> Result<i64, anyhow::Error> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .map_err(|err| anyhow::anyhow!("Системное время меньше UNIX_EPOCH: {}", err))
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation())
}

pub(crate) fn encode_string_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn decode_string_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    telegram_id INTEGER NOT NULL UNIQUE,
    username TEXT,
    first_name TEXT,
    last_name TEXT,
    language TEXT NOT NULL DEFAULT 'ru',
    status TEXT NOT NULL DEFAULT 'active',
    balance_kopeks INTEGER NOT NULL DEFAULT 0,
    referral_code TEXT UNIQUE,
    referred_by_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
    has_had_paid_subscription INTEGER NOT NULL DEFAULT 0,
    has_had_subscription INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    last_activity_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_users_status ON users(status);
CREATE INDEX IF NOT EXISTS idx_users_referred_by ON users(referred_by_id);

CREATE TABLE IF NOT EXISTS tariffs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT,
    period_days INTEGER NOT NULL,
    price_kopeks INTEGER NOT NULL,
    traffic_limit_gb INTEGER NOT NULL DEFAULT 0,
    device_limit INTEGER NOT NULL DEFAULT 1,
    allowed_squads TEXT NOT NULL DEFAULT '[]',
    is_active INTEGER NOT NULL DEFAULT 1,
    display_order INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS subscriptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'active',
    is_trial INTEGER NOT NULL DEFAULT 0,
    start_date INTEGER NOT NULL,
    end_date INTEGER NOT NULL,
    traffic_limit_gb INTEGER NOT NULL DEFAULT 0,
    traffic_used_gb REAL NOT NULL DEFAULT 0,
    device_limit INTEGER NOT NULL DEFAULT 1,
    connected_squads TEXT NOT NULL DEFAULT '[]',
    tariff_id INTEGER REFERENCES tariffs(id) ON DELETE SET NULL,
    subscription_url TEXT,
    autopay_enabled INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_subscriptions_status ON subscriptions(status);
CREATE INDEX IF NOT EXISTS idx_subscriptions_end_date ON subscriptions(end_date);

CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    tx_type TEXT NOT NULL,
    amount_kopeks INTEGER NOT NULL,
    description TEXT,
    payment_method TEXT,
    external_id TEXT,
    is_completed INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions(user_id);
CREATE INDEX IF NOT EXISTS idx_transactions_type ON transactions(tx_type);
CREATE INDEX IF NOT EXISTS idx_transactions_created ON transactions(created_at);

CREATE TABLE IF NOT EXISTS tickets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    closed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_tickets_status ON tickets(status);

CREATE TABLE IF NOT EXISTS ticket_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticket_id INTEGER NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
    user_id INTEGER,
    is_from_admin INTEGER NOT NULL DEFAULT 0,
    text TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ticket_messages_ticket ON ticket_messages(ticket_id);

CREATE TABLE IF NOT EXISTS pinned_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    media_type TEXT,
    media_file_id TEXT,
    is_active INTEGER NOT NULL DEFAULT 0,
    created_by INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS campaigns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    start_parameter TEXT NOT NULL UNIQUE,
    bonus_type TEXT NOT NULL DEFAULT 'none',
    balance_bonus_kopeks INTEGER NOT NULL DEFAULT 0,
    subscription_days INTEGER NOT NULL DEFAULT 0,
    subscription_traffic_gb INTEGER NOT NULL DEFAULT 0,
    subscription_device_limit INTEGER NOT NULL DEFAULT 1,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS campaign_registrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    campaign_id INTEGER NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
    bonus_type TEXT NOT NULL,
    balance_bonus_kopeks INTEGER NOT NULL DEFAULT 0,
    subscription_days INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_campaign_registrations_campaign ON campaign_registrations(campaign_id);

CREATE TABLE IF NOT EXISTS broadcast_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target TEXT NOT NULL,
    message_text TEXT NOT NULL,
    total_count INTEGER NOT NULL DEFAULT 0,
    sent_count INTEGER NOT NULL DEFAULT 0,
    failed_count INTEGER NOT NULL DEFAULT 0,
    skipped_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'queued',
    created_by TEXT,
    created_at INTEGER NOT NULL,
    completed_at INTEGER
);

CREATE TABLE IF NOT EXISTS polls (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    description TEXT,
    reward_enabled INTEGER NOT NULL DEFAULT 0,
    reward_amount_kopeks INTEGER NOT NULL DEFAULT 0,
    created_by TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS poll_questions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    poll_id INTEGER NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
    text TEXT NOT NULL,
    order_index INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_poll_questions_poll ON poll_questions(poll_id);

CREATE TABLE IF NOT EXISTS poll_options (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    question_id INTEGER NOT NULL REFERENCES poll_questions(id) ON DELETE CASCADE,
    text TEXT NOT NULL,
    order_index INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_poll_options_question ON poll_options(question_id);

CREATE TABLE IF NOT EXISTS poll_responses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    poll_id INTEGER NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    sent_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    reward_given INTEGER NOT NULL DEFAULT 0,
    reward_amount_kopeks INTEGER NOT NULL DEFAULT 0,
    UNIQUE(poll_id, user_id)
);

CREATE TABLE IF NOT EXISTS poll_answers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    response_id INTEGER NOT NULL REFERENCES poll_responses(id) ON DELETE CASCADE,
    question_id INTEGER NOT NULL REFERENCES poll_questions(id) ON DELETE CASCADE,
    option_id INTEGER NOT NULL REFERENCES poll_options(id) ON DELETE CASCADE,
    created_at INTEGER NOT NULL,
    UNIQUE(response_id, question_id)
);

CREATE TABLE IF NOT EXISTS api_tokens (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    token_hash TEXT NOT NULL UNIQUE,
    token_prefix TEXT NOT NULL,
    permissions TEXT NOT NULL DEFAULT '[]',
    is_active INTEGER NOT NULL DEFAULT 1,
    created_by TEXT,
    created_at INTEGER NOT NULL,
    expires_at INTEGER,
    last_used_at INTEGER,
    last_used_ip TEXT
);

CREATE TABLE IF NOT EXISTS system_settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

impl Db {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("Не удалось создать директорию для БД: {}", e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts)
            .await
            .map_err(|e| anyhow::anyhow!("Не удалось подключиться к SQLite: {}", e))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Одно соединение на весь пул: in-memory база живёт, пока живёт соединение.
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, anyhow::Error> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), anyhow::Error> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("Миграция БД: {}", e))?;

        self.ensure_column_exists("users", "last_activity_at", "INTEGER")
            .await?;
        self.ensure_column_exists("users", "has_had_subscription", "INTEGER NOT NULL DEFAULT 0")
            .await?;
        sqlx::query(
            "UPDATE users SET has_had_subscription = 1
             WHERE has_had_subscription = 0 AND id IN (SELECT user_id FROM subscriptions)",
        )
        .execute(&self.pool)
        .await?;
        self.ensure_column_exists("subscriptions", "autopay_enabled", "INTEGER NOT NULL DEFAULT 0")
            .await?;
        self.ensure_column_exists("api_tokens", "last_used_ip", "TEXT")
            .await?;

        Ok(())
    }

    async fn ensure_column_exists(
        &self,
        table: &str,
        column: &str,
        sql_type: &str,
    ) -> Result<(), anyhow::Error> {
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM pragma_table_info('{}') WHERE name = '{}'",
            table, column
        ))
        .fetch_one(&self.pool)
        .await?;
        if count == 0 {
            sqlx::query(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table, column, sql_type
            ))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}
