use super::commands::cmd_help;
use super::shared::{
    activate_trial, admin_show_stats, blocked_by_maintenance, registered_user, send_not_registered,
    show_profile, show_tariffs, show_topup, start_support, take_awaiting_ticket, HandlerResult,
};
use super::state::{sender_user_id, BotState};
use crate::bot::keyboards::{self, menu_for};
use crate::db::User;
use teloxide::prelude::*;

pub async fn handle_menu_buttons(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(user_id) = sender_user_id(&msg) else {
        return Ok(());
    };
    if blocked_by_maintenance(&bot, msg.chat.id, &state, user_id).await? {
        return Ok(());
    }
    let is_admin = state.config.is_admin(user_id);
    let Some(user) = registered_user(&state, user_id).await? else {
        return send_not_registered(&bot, msg.chat.id).await;
    };

    let is_menu_button = matches!(
        text,
        keyboards::BTN_USER_PROFILE
            | keyboards::BTN_USER_TARIFFS
            | keyboards::BTN_USER_TOPUP
            | keyboards::BTN_USER_TRIAL
            | keyboards::BTN_USER_SUPPORT
            | keyboards::BTN_USER_HELP
            | keyboards::BTN_ADMIN_STATS
            | keyboards::BTN_ADMIN_TOKENS
    );
    if !is_menu_button && take_awaiting_ticket(&state, user_id).await {
        return submit_ticket_text(&bot, &msg, &state, &user, text).await;
    }

    match text {
        keyboards::BTN_USER_PROFILE => show_profile(&bot, msg.chat.id, &state, &user).await?,
        keyboards::BTN_USER_TARIFFS => show_tariffs(&bot, msg.chat.id, &state).await?,
        keyboards::BTN_USER_TOPUP => show_topup(&bot, msg.chat.id, &state).await?,
        keyboards::BTN_USER_TRIAL => activate_trial(&bot, msg.chat.id, &state, &user).await?,
        keyboards::BTN_USER_SUPPORT => start_support(&bot, msg.chat.id, &state, user_id).await?,
        keyboards::BTN_USER_HELP => cmd_help(bot, msg, state).await?,
        keyboards::BTN_ADMIN_STATS if is_admin => {
            admin_show_stats(&bot, msg.chat.id, &state).await?;
        }
        keyboards::BTN_ADMIN_TOKENS if is_admin => {
            bot.send_message(
                msg.chat.id,
                "API-токены:\n\
                 /token create <name> [perm ...]\n\
                 /token list\n\
                 /token revoke <id>\n\n\
                 Права вида resource:action, resource:* или *.",
            )
            .await?;
        }
        _ => {
            if let Some(ticket) = state.db.find_open_ticket(user.id).await? {
                // Продолжение открытого обращения.
                state
                    .db
                    .add_ticket_message(ticket.id, Some(user.id), false, text)
                    .await?;
                bot.send_message(msg.chat.id, "Сообщение добавлено в обращение.")
                    .await?;
                return Ok(());
            }
            let reply_text = if is_admin {
                "Не понял команду. Используйте кнопки админ-меню ниже."
            } else {
                "Не понял запрос. Используйте кнопки меню ниже."
            };
            bot.send_message(msg.chat.id, reply_text)
                .reply_markup(menu_for(is_admin))
                .await?;
        }
    }
    Ok(())
}

/// Текст после «Поддержка»: новое обращение или сообщение в открытое.
async fn submit_ticket_text(
    bot: &Bot,
    msg: &Message,
    state: &BotState,
    user: &User,
    text: &str,
) -> HandlerResult {
    let text = text.trim();
    if text.is_empty() {
        return Ok(());
    }
    let reply = match state.db.find_open_ticket(user.id).await? {
        Some(ticket) => {
            state
                .db
                .add_ticket_message(ticket.id, Some(user.id), false, text)
                .await?;
            format!("Сообщение добавлено в обращение #{}.", ticket.id)
        }
        None => {
            let ticket = state.db.create_ticket(user.id, text).await?;
            tracing::info!(user_id = user.id, ticket_id = ticket.id, "Support ticket opened");
            format!("✅ Обращение #{} создано. Ответ придёт сюда.", ticket.id)
        }
    };
    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}
