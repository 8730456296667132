use super::shared::{
    activate_trial, admin_show_stats, blocked_by_maintenance, parse_start_payload,
    registered_user, send_main_menu, send_not_registered, show_profile, show_topup,
    start_support, user_id_or_reply, HandlerResult, StartPayload,
};
use super::state::{is_admin_message, sender_display_name, sender_profile, sender_user_id, BotState};
use crate::bot::format::{format_kopeks, help_text, render_api_token_line};
use crate::bot::keyboards::menu_for;
use crate::db::{
    BalanceChange, CampaignBonus, TransactionType, User, UserUpdate, USER_STATUS_ACTIVE,
    USER_STATUS_BLOCKED,
};
use crate::security::{display_prefix, generate_api_token, hash_api_token};
use crate::settings::REFERRAL_SIGNUP_BONUS_KOPEKS;
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
pub enum BotCommand {
    #[command(description = "Главное меню")]
    Start,
    #[command(description = "Профиль и подписка")]
    Profile,
    #[command(description = "Баланс")]
    Balance,
    #[command(description = "Пробная подписка")]
    Trial,
    #[command(description = "Пополнить баланс звёздами")]
    Topup,
    #[command(description = "Написать в поддержку")]
    Support,
    #[command(description = "Справка")]
    Help,
    #[command(description = "Статистика (админ)")]
    Stats,
    #[command(description = "Управление API-токенами (админ)")]
    Token,
}

pub fn handler() -> teloxide::dispatching::UpdateHandler<Box<dyn std::error::Error + Send + Sync + 'static>> {
    teloxide::filter_command::<BotCommand, _>()
        .branch(dptree::case![BotCommand::Start].endpoint(start_cmd))
        .branch(dptree::case![BotCommand::Profile].endpoint(cmd_profile))
        .branch(dptree::case![BotCommand::Balance].endpoint(cmd_balance))
        .branch(dptree::case![BotCommand::Trial].endpoint(cmd_trial))
        .branch(dptree::case![BotCommand::Topup].endpoint(cmd_topup))
        .branch(dptree::case![BotCommand::Support].endpoint(cmd_support))
        .branch(dptree::case![BotCommand::Help].endpoint(cmd_help))
        .branch(dptree::case![BotCommand::Stats].endpoint(cmd_stats))
        .branch(dptree::case![BotCommand::Token].endpoint(cmd_token))
}

pub async fn cmd_help(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let is_admin = is_admin_message(&msg, &state);
    bot.send_message(msg.chat.id, help_text(is_admin))
        .reply_markup(menu_for(is_admin))
        .await?;
    Ok(())
}

async fn start_cmd(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let user_id = match user_id_or_reply(&msg) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(error = %error, "Received /start without sender");
            return Ok(());
        }
    };
    let payload = parse_start_payload(msg.text().unwrap_or(""));
    tracing::info!(
        user_id = user_id,
        display_name = ?sender_display_name(&msg),
        payload = ?payload,
        "Received /start command"
    );
    if blocked_by_maintenance(&bot, msg.chat.id, &state, user_id).await? {
        return Ok(());
    }

    let Some(profile) = sender_profile(&msg) else {
        return Ok(());
    };
    let (mut user, created) = state.db.get_or_create_user(&profile).await?;
    if user.status == USER_STATUS_BLOCKED {
        // Вернулся после блокировки бота.
        let update = UserUpdate {
            status: Some(USER_STATUS_ACTIVE.to_string()),
            ..Default::default()
        };
        if let Some(updated) = state.db.update_user(user.id, &update).await? {
            user = updated;
        }
    }

    match payload {
        Some(StartPayload::Referral(code)) if created => {
            apply_referral(&bot, &msg, &state, &user, &code).await?;
        }
        Some(StartPayload::Campaign(param)) => {
            apply_campaign(&bot, &msg, &state, &user, &param).await?;
        }
        _ => {}
    }

    if let Some(pinned) = state.db.get_active_pinned_message().await?
        && let Err(error) = state.broadcaster.send_pinned(msg.chat.id, &pinned).await
    {
        tracing::warn!(user_id = user_id, error = %error, "Failed to show pinned message");
    }

    let greeting = if created {
        format!("Добро пожаловать, {}!", user.display_name())
    } else {
        format!("С возвращением, {}!", user.display_name())
    };
    bot.send_message(msg.chat.id, greeting).await?;
    send_main_menu(&bot, msg.chat.id, &state, state.config.is_admin(user_id)).await
}

/// Только для новых пользователей; пригласить самого себя нельзя.
async fn apply_referral(
    bot: &Bot,
    msg: &Message,
    state: &BotState,
    user: &User,
    code: &str,
) -> HandlerResult {
    let Some(referrer) = state.db.get_user_by_referral_code(code).await? else {
        tracing::info!(user_id = user.id, code = code, "Unknown referral code");
        return Ok(());
    };
    if !state.db.set_referrer(user.id, referrer.id).await? {
        return Ok(());
    }
    tracing::info!(user_id = user.id, referrer_id = referrer.id, "Referrer attached");

    let bonus = state.settings.get_int(REFERRAL_SIGNUP_BONUS_KOPEKS).await;
    if bonus > 0 {
        let change = BalanceChange::new(user.id, bonus, TransactionType::ReferralReward)
            .description("Бонус за регистрацию по приглашению");
        state.db.adjust_balance(&change).await?;
        bot.send_message(
            msg.chat.id,
            format!("🎁 За регистрацию по приглашению начислено {}.", format_kopeks(bonus)),
        )
        .await?;
    }
    Ok(())
}

async fn apply_campaign(
    bot: &Bot,
    msg: &Message,
    state: &BotState,
    user: &User,
    param: &str,
) -> HandlerResult {
    let Some(campaign) = state.db.get_campaign_by_start_parameter(param).await? else {
        tracing::info!(user_id = user.id, start_parameter = param, "Unknown campaign parameter");
        return Ok(());
    };
    if !campaign.is_active {
        return Ok(());
    }
    let text = match state.db.register_campaign_user(&campaign, user.id).await? {
        Some(CampaignBonus::Balance(amount)) => {
            format!("🎁 Бонус акции: на баланс начислено {}.", format_kopeks(amount))
        }
        Some(CampaignBonus::Subscription(days)) => {
            format!("🎁 Бонус акции: подписка на {} дн. активирована.", days)
        }
        Some(CampaignBonus::None) | None => return Ok(()),
    };
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

async fn cmd_profile(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(user_id) = sender_user_id(&msg) else {
        return Ok(());
    };
    if blocked_by_maintenance(&bot, msg.chat.id, &state, user_id).await? {
        return Ok(());
    }
    match registered_user(&state, user_id).await? {
        Some(user) => show_profile(&bot, msg.chat.id, &state, &user).await,
        None => send_not_registered(&bot, msg.chat.id).await,
    }
}

async fn cmd_balance(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(user_id) = sender_user_id(&msg) else {
        return Ok(());
    };
    if blocked_by_maintenance(&bot, msg.chat.id, &state, user_id).await? {
        return Ok(());
    }
    let Some(user) = registered_user(&state, user_id).await? else {
        return send_not_registered(&bot, msg.chat.id).await;
    };
    bot.send_message(
        msg.chat.id,
        format!(
            "💰 Баланс: {}\nПополнить: /topup",
            format_kopeks(user.balance_kopeks)
        ),
    )
    .await?;
    Ok(())
}

async fn cmd_trial(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(user_id) = sender_user_id(&msg) else {
        return Ok(());
    };
    if blocked_by_maintenance(&bot, msg.chat.id, &state, user_id).await? {
        return Ok(());
    }
    match registered_user(&state, user_id).await? {
        Some(user) => activate_trial(&bot, msg.chat.id, &state, &user).await,
        None => send_not_registered(&bot, msg.chat.id).await,
    }
}

async fn cmd_topup(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(user_id) = sender_user_id(&msg) else {
        return Ok(());
    };
    if blocked_by_maintenance(&bot, msg.chat.id, &state, user_id).await? {
        return Ok(());
    }
    show_topup(&bot, msg.chat.id, &state).await
}

async fn cmd_support(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(user_id) = sender_user_id(&msg) else {
        return Ok(());
    };
    if blocked_by_maintenance(&bot, msg.chat.id, &state, user_id).await? {
        return Ok(());
    }
    if registered_user(&state, user_id).await?.is_none() {
        return send_not_registered(&bot, msg.chat.id).await;
    }
    start_support(&bot, msg.chat.id, &state, user_id).await
}

async fn cmd_stats(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    admin_show_stats(&bot, msg.chat.id, &state).await
}

/// Разбор аргументов `/token`.
#[derive(Debug, PartialEq, Eq)]
enum TokenAction {
    Create { name: String, permissions: Vec<String> },
    List,
    Revoke(i64),
}

fn parse_token_action(text: &str) -> Option<TokenAction> {
    let mut parts = text.split_whitespace().skip(1);
    match parts.next()? {
        "create" => {
            let name = parts.next()?.to_string();
            let mut permissions = parts.map(str::to_string).collect::<Vec<_>>();
            if permissions.is_empty() {
                permissions.push("*".to_string());
            }
            Some(TokenAction::Create { name, permissions })
        }
        "list" => Some(TokenAction::List),
        "revoke" => parts.next()?.parse().ok().map(TokenAction::Revoke),
        _ => None,
    }
}

async fn cmd_token(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    let Some(admin_id) = sender_user_id(&msg) else {
        return Ok(());
    };

    let Some(action) = parse_token_action(msg.text().unwrap_or("")) else {
        bot.send_message(
            msg.chat.id,
            "Использование:\n\
             /token create <name> [perm ...]\n\
             /token list\n\
             /token revoke <id>",
        )
        .await?;
        return Ok(());
    };

    match action {
        TokenAction::Create { name, permissions } => {
            let raw = generate_api_token();
            let created_by = format!("tg:{}", admin_id);
            let token = state
                .db
                .create_api_token(
                    &name,
                    &hash_api_token(&raw, state.config.api.token_hash_algorithm),
                    &display_prefix(&raw),
                    &permissions,
                    None,
                    Some(&created_by),
                )
                .await?;
            tracing::info!(admin_id = admin_id, token_id = token.id, "API token created from bot");
            bot.send_message(
                msg.chat.id,
                format!(
                    "🔑 Токен #{} «{}» создан.\nПрава: {}\n\n{}\n\nЗначение показывается один раз.",
                    token.id,
                    token.name,
                    permissions.join(", "),
                    raw
                ),
            )
            .await?;
        }
        TokenAction::List => {
            let tokens = state.db.list_api_tokens().await?;
            let text = if tokens.is_empty() {
                "API-токенов нет.".to_string()
            } else {
                let page_size = state.config.list_page_size as usize;
                let mut lines = tokens
                    .iter()
                    .take(page_size)
                    .map(render_api_token_line)
                    .collect::<Vec<_>>();
                if tokens.len() > page_size {
                    lines.push(format!("… и ещё {}", tokens.len() - page_size));
                }
                format!("🔑 API-токены:\n{}", lines.join("\n"))
            };
            bot.send_message(msg.chat.id, text).await?;
        }
        TokenAction::Revoke(id) => {
            let text = match state.db.revoke_api_token(id).await? {
                Some(token) => {
                    tracing::info!(admin_id = admin_id, token_id = id, "API token revoked from bot");
                    format!("Токен #{} «{}» отозван.", token.id, token.name)
                }
                None => format!("Токен #{} не найден.", id),
            };
            bot.send_message(msg.chat.id, text).await?;
        }
    }
    Ok(())
}
