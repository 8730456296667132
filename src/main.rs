//! vpn-shop-admin: Telegram-бот магазина VPN-подписок и REST API админ-панели.

mod api;
mod bot;
mod broadcast;
mod config;
mod db;
mod delivery;
mod polls;
mod security;
mod settings;
mod stars;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::dispatching::Dispatcher;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tokio::sync::Mutex;

const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/vpn-shop-admin.toml"));
    tracing::info!(
        "Starting vpn-shop-admin with config {}",
        config_path.display()
    );

    let config = Arc::new(config::Config::load(&config_path)?);
    let token = config.bot_token()?;
    tracing::info!(
        admin_count = config.admin_ids.len(),
        db_path = %config.db_path.display(),
        api_enabled = config.api.enabled,
        api_listen = %config.api.listen,
        "Configuration loaded"
    );

    let db = Arc::new(db::Db::open(&config.db_path).await?);
    let settings = Arc::new(settings::RuntimeSettings::load(db.clone(), &config).await?);
    let stars = Arc::new(stars::StarsRateService::new(&config.stars, settings.clone())?);
    let menu_cache = Arc::new(bot::menu_cache::MenuButtonCache::new(settings.clone()));

    let bot = Bot::new(token);
    let polls = polls::PollService::new(db.clone(), bot.clone());
    let broadcaster = broadcast::Broadcaster::new(db.clone(), bot.clone());

    if config.api.enabled {
        let api_state = Arc::new(api::ApiState {
            db: db.clone(),
            settings: settings.clone(),
            stars: stars.clone(),
            menu_cache: menu_cache.clone(),
            polls: polls.clone(),
            broadcaster: broadcaster.clone(),
            bot: bot.clone(),
            token_hash_algorithm: config.api.token_hash_algorithm,
        });
        let api_config = config.api.clone();
        tokio::spawn(async move {
            if let Err(error) = api::serve(api_state, &api_config).await {
                tracing::error!(error = %error, "REST API stopped");
            }
        });
    }

    spawn_expiry_sweeper(db.clone());

    let bot_username = match bot.get_me().await {
        Ok(me) => me.user.username.clone(),
        Err(error) => {
            tracing::warn!(error = %error, "getMe failed, referral links will show codes only");
            None
        }
    };
    if let Err(error) = bot
        .set_my_commands(bot::handlers::BotCommand::bot_commands())
        .await
    {
        tracing::warn!(error = %error, "Failed to register bot commands");
    }

    let state = bot::handlers::BotState {
        config,
        db,
        settings,
        stars,
        menu_cache,
        polls,
        broadcaster,
        bot_username,
        awaiting_ticket_users: Arc::new(Mutex::new(std::collections::HashSet::new())),
    };
    tracing::info!("Dispatcher initialized, bot is ready");

    Dispatcher::builder(bot, bot::handlers::schema())
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

/// Просроченные подписки переводятся в `expired` раз в пять минут.
fn spawn_expiry_sweeper(db: Arc<db::Db>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let now = match db::current_unix_timestamp() {
                Ok(now) => now,
                Err(error) => {
                    tracing::error!(error = %error, "System clock unavailable");
                    continue;
                }
            };
            match db.expire_overdue_subscriptions(now).await {
                Ok(0) => {}
                Ok(expired) => tracing::info!(expired = expired, "Overdue subscriptions expired"),
                Err(error) => tracing::error!(error = %error, "Subscription expiry sweep failed"),
            }
        }
    });
}
