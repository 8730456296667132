use super::state::{sender_user_id, BotState};
use crate::bot::format::{
    format_kopeks, render_overview_stats, render_profile_text, render_tariff_line,
};
use crate::bot::keyboards::{main_inline_menu, menu_for, tariffs_keyboard, topup_keyboard};
use crate::db::{current_unix_timestamp, NewSubscription, User};
use crate::settings::{
    MAINTENANCE_MODE, MIN_TOPUP_KOPEKS, SUBSCRIPTION_BASE_URL, SUPPORT_ENABLED, TRIAL_DEVICE_LIMIT,
    TRIAL_DURATION_DAYS, TRIAL_ENABLED, TRIAL_TRAFFIC_LIMIT_GB,
};
use anyhow::anyhow;
use image::{DynamicImage, ImageFormat, Luma};
use qrcode::QrCode;
use std::io::Cursor;
use teloxide::prelude::*;

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub const TOPUP_PAYLOAD_PREFIX: &str = "topup:";
const REFERRAL_PAYLOAD_PREFIX: &str = "ref";

/// Что пришло в deep-link `/start <payload>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPayload {
    Referral(String),
    Campaign(String),
}

pub fn parse_start_token(text: &str) -> Option<String> {
    let mut parts = text.split_whitespace();
    let command = parts.next()?;
    if !command.starts_with("/start") {
        return None;
    }
    let token = parts.next()?.trim();
    if token.is_empty() {
        return None;
    }

    let decoded = match urlencoding::decode(token) {
        Ok(value) => value.into_owned(),
        Err(_) => token.to_string(),
    };
    let normalized = decoded.trim().trim_matches('`').trim();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized.to_string())
    }
}

/// Реферальные коды начинаются с `ref`, всё остальное считаем параметром кампании.
pub fn parse_start_payload(text: &str) -> Option<StartPayload> {
    let token = parse_start_token(text)?;
    if token.starts_with(REFERRAL_PAYLOAD_PREFIX) {
        Some(StartPayload::Referral(token))
    } else {
        Some(StartPayload::Campaign(token))
    }
}

pub fn parse_callback_id(data: &str, prefix: &str) -> Result<i64, anyhow::Error> {
    data.strip_prefix(prefix)
        .ok_or_else(|| anyhow!("Некорректный callback payload"))?
        .parse::<i64>()
        .map_err(|_| anyhow!("Некорректный идентификатор в callback"))
}

/// `poll_ans:{response_id}:{question_id}:{option_id}`
pub fn parse_poll_answer(data: &str) -> Result<(i64, i64, i64), anyhow::Error> {
    let rest = data
        .strip_prefix("poll_ans:")
        .ok_or_else(|| anyhow!("Некорректный callback payload"))?;
    let ids = rest
        .split(':')
        .map(str::parse::<i64>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| anyhow!("Некорректный ответ на опрос"))?;
    match ids.as_slice() {
        [response_id, question_id, option_id] => Ok((*response_id, *question_id, *option_id)),
        _ => Err(anyhow!("Некорректный ответ на опрос")),
    }
}

/// Количество звёзд из `topup:{stars}`; ноль и мусор отбрасываются.
pub fn parse_topup_payload(payload: &str) -> Option<u32> {
    payload
        .strip_prefix(TOPUP_PAYLOAD_PREFIX)?
        .parse::<u32>()
        .ok()
        .filter(|stars| *stars > 0)
}

pub fn callback_message_target(q: &CallbackQuery) -> Option<(ChatId, teloxide::types::MessageId)> {
    q.message.as_ref().map(|msg| (msg.chat().id, msg.id()))
}

pub fn callback_prefix_filter(prefix: &'static str) -> impl Fn(CallbackQuery) -> Option<CallbackQuery> {
    move |q: CallbackQuery| {
        if q.data.as_deref().is_some_and(|payload| payload.starts_with(prefix)) {
            Some(q)
        } else {
            None
        }
    }
}

pub fn callback_exact_filter(data: &'static str) -> impl Fn(CallbackQuery) -> Option<CallbackQuery> {
    move |q: CallbackQuery| {
        if q.data.as_deref() == Some(data) {
            Some(q)
        } else {
            None
        }
    }
}

pub fn user_id_or_reply(msg: &Message) -> Result<i64, anyhow::Error> {
    sender_user_id(msg).ok_or_else(|| anyhow!("Не удалось определить пользователя отправителя"))
}

pub fn build_qr_png_bytes(payload: &str) -> Result<Vec<u8>, anyhow::Error> {
    let qr = QrCode::new(payload.as_bytes())?;
    let image = qr
        .render::<Luma<u8>>()
        .quiet_zone(true)
        .min_dimensions(512, 512)
        .build();
    let mut bytes = Vec::new();
    {
        let mut cursor = Cursor::new(&mut bytes);
        DynamicImage::ImageLuma8(image).write_to(&mut cursor, ImageFormat::Png)?;
    }
    Ok(bytes)
}

/// Ссылка подписки пользователя относительно `subscription_base_url`.
pub fn build_subscription_link(base_url: &str, telegram_id: i64) -> Option<String> {
    let base = base_url.trim().trim_end_matches('/');
    if base.is_empty() {
        None
    } else {
        Some(format!("{}/{}", base, telegram_id))
    }
}

pub async fn subscription_link_for(state: &BotState, telegram_id: i64) -> Option<String> {
    let base = state.settings.get_string(SUBSCRIPTION_BASE_URL).await?;
    build_subscription_link(&base, telegram_id)
}

pub async fn mark_user_awaiting_ticket(state: &BotState, tg_user_id: i64) {
    state.awaiting_ticket_users.lock().await.insert(tg_user_id);
}

/// Снимает отметку и сообщает, была ли она.
pub async fn take_awaiting_ticket(state: &BotState, tg_user_id: i64) -> bool {
    state.awaiting_ticket_users.lock().await.remove(&tg_user_id)
}

/// В режиме техработ бот молчит для всех, кроме админов.
pub async fn blocked_by_maintenance(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    tg_user_id: i64,
) -> Result<bool, anyhow::Error> {
    if state.config.is_admin(tg_user_id) || !state.settings.get_bool(MAINTENANCE_MODE).await {
        return Ok(false);
    }
    bot.send_message(chat_id, "🛠 Ведутся технические работы. Попробуйте позже.")
        .await?;
    Ok(true)
}

pub async fn registered_user(state: &BotState, tg_user_id: i64) -> Result<Option<User>, anyhow::Error> {
    state.db.get_user_by_telegram_id(tg_user_id).await
}

pub async fn send_not_registered(bot: &Bot, chat_id: ChatId) -> HandlerResult {
    bot.send_message(chat_id, "Сначала отправьте /start.").await?;
    Ok(())
}

pub async fn send_main_menu(bot: &Bot, chat_id: ChatId, state: &BotState, is_admin: bool) -> HandlerResult {
    let extra = state.menu_cache.buttons().await;
    bot.send_message(chat_id, "Главное меню. Выберите действие:")
        .reply_markup(main_inline_menu(&extra))
        .await?;
    let hint = if is_admin {
        "Админ-функции доступны на клавиатуре ниже."
    } else {
        "Кнопки быстрого доступа внизу экрана."
    };
    bot.send_message(chat_id, hint)
        .reply_markup(menu_for(is_admin))
        .await?;
    Ok(())
}

pub async fn show_profile(bot: &Bot, chat_id: ChatId, state: &BotState, user: &User) -> HandlerResult {
    let subscription = state.db.get_subscription_by_user(user.id).await?;
    let now = current_unix_timestamp()?;
    let text = render_profile_text(
        user,
        subscription.as_ref(),
        state.bot_username.as_deref(),
        now,
    );
    bot.send_message(chat_id, text).await?;
    Ok(())
}

pub async fn show_tariffs(bot: &Bot, chat_id: ChatId, state: &BotState) -> HandlerResult {
    let tariffs = state.db.list_tariffs(true).await?;
    if tariffs.is_empty() {
        bot.send_message(chat_id, "Тарифы пока не настроены.").await?;
        return Ok(());
    }
    let mut text = String::from("💳 Тарифы:\n");
    for tariff in &tariffs {
        text.push('\n');
        text.push_str(&render_tariff_line(tariff));
    }
    text.push_str("\n\nОплата списывается с баланса.");
    bot.send_message(chat_id, text)
        .reply_markup(tariffs_keyboard(&tariffs))
        .await?;
    Ok(())
}

pub async fn show_topup(bot: &Bot, chat_id: ChatId, state: &BotState) -> HandlerResult {
    let quote = state.stars.current_rate().await;
    let min_kopeks = state.settings.get_int(MIN_TOPUP_KOPEKS).await;
    let keyboard = topup_keyboard(quote.rate_rub, min_kopeks);
    if keyboard.inline_keyboard.is_empty() {
        bot.send_message(
            chat_id,
            format!(
                "Нет вариантов пополнения от {}. Обратитесь в поддержку.",
                format_kopeks(min_kopeks)
            ),
        )
        .await?;
        return Ok(());
    }
    bot.send_message(
        chat_id,
        format!(
            "⭐ Пополнение звёздами Telegram\nКурс: 1 ⭐ = {:.2} ₽\nВыберите сумму:",
            quote.rate_rub
        ),
    )
    .reply_markup(keyboard)
    .await?;
    Ok(())
}

pub async fn activate_trial(bot: &Bot, chat_id: ChatId, state: &BotState, user: &User) -> HandlerResult {
    if !state.settings.get_bool(TRIAL_ENABLED).await {
        bot.send_message(chat_id, "Пробный период сейчас недоступен.")
            .await?;
        return Ok(());
    }
    let new = NewSubscription {
        user_id: user.id,
        is_trial: true,
        duration_days: state.settings.get_int(TRIAL_DURATION_DAYS).await.max(1),
        traffic_limit_gb: state.settings.get_int(TRIAL_TRAFFIC_LIMIT_GB).await.max(0),
        device_limit: state.settings.get_int(TRIAL_DEVICE_LIMIT).await.max(1),
        squads: Vec::new(),
        tariff_id: None,
        subscription_url: subscription_link_for(state, user.telegram_id).await,
    };
    match state.db.create_trial_subscription(&new).await? {
        Some(subscription) => {
            tracing::info!(
                user_id = user.id,
                subscription_id = subscription.id,
                days = new.duration_days,
                "Trial subscription activated"
            );
            bot.send_message(
                chat_id,
                format!(
                    "🎁 Пробная подписка активирована на {} дн.\nСсылку и QR можно получить в главном меню.",
                    new.duration_days
                ),
            )
            .await?;
        }
        None => {
            bot.send_message(chat_id, "Пробный период доступен только один раз и только без подписки.")
                .await?;
        }
    }
    Ok(())
}

pub async fn start_support(bot: &Bot, chat_id: ChatId, state: &BotState, tg_user_id: i64) -> HandlerResult {
    if !state.settings.get_bool(SUPPORT_ENABLED).await {
        bot.send_message(chat_id, "Поддержка временно не принимает обращения.")
            .await?;
        return Ok(());
    }
    mark_user_awaiting_ticket(state, tg_user_id).await;
    bot.send_message(
        chat_id,
        "🆘 Опишите проблему одним сообщением, и мы ответим здесь же.",
    )
    .await?;
    Ok(())
}

pub async fn admin_show_stats(bot: &Bot, chat_id: ChatId, state: &BotState) -> HandlerResult {
    let stats = state.db.overview_stats().await?;
    bot.send_message(chat_id, render_overview_stats(&stats))
        .await?;
    Ok(())
}
