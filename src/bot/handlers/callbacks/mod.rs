use super::shared::{
    build_qr_png_bytes, callback_exact_filter, callback_message_target, callback_prefix_filter,
    parse_callback_id, parse_poll_answer, parse_topup_payload, show_tariffs, subscription_link_for,
    HandlerResult, TOPUP_PAYLOAD_PREFIX,
};
use super::state::BotState;
use crate::bot::format::{format_date, format_kopeks, render_poll_completed, render_poll_question};
use crate::bot::keyboards::poll_question_keyboard;
use crate::db::{BalanceError, PollAnswerError, PurchaseError, User};
use crate::polls::PollStep;
use crate::settings::{MAINTENANCE_MODE, MIN_TOPUP_KOPEKS};
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardMarkup, InputFile, LabeledPrice};

pub fn handler() -> teloxide::dispatching::UpdateHandler<Box<dyn std::error::Error + Send + Sync + 'static>> {
    Update::filter_callback_query()
        .branch(dptree::filter_map(callback_prefix_filter("poll_start:")).endpoint(callback_poll_start))
        .branch(dptree::filter_map(callback_prefix_filter("poll_ans:")).endpoint(callback_poll_answer))
        .branch(dptree::filter_map(callback_prefix_filter("topup:")).endpoint(callback_topup))
        .branch(dptree::filter_map(callback_prefix_filter("tariff_buy:")).endpoint(callback_tariff_buy))
        .branch(dptree::filter_map(callback_exact_filter("tariffs")).endpoint(callback_tariffs))
        .branch(dptree::filter_map(callback_exact_filter("sub_qr")).endpoint(callback_sub_qr))
}

async fn alert(bot: &Bot, q: &CallbackQuery, text: &str) -> HandlerResult {
    bot.answer_callback_query(q.id.clone())
        .text(text)
        .show_alert(true)
        .await?;
    Ok(())
}

/// Зарегистрированный пользователь, нажавший кнопку. Иначе отвечает сам и
/// возвращает `None`.
async fn callback_user(bot: &Bot, q: &CallbackQuery, state: &BotState) -> Result<Option<User>, anyhow::Error> {
    let tg_user_id = q.from.id.0 as i64;
    if !state.config.is_admin(tg_user_id) && state.settings.get_bool(MAINTENANCE_MODE).await {
        bot.answer_callback_query(q.id.clone())
            .text("Ведутся технические работы")
            .await?;
        return Ok(None);
    }
    let user = state.db.get_user_by_telegram_id(tg_user_id).await?;
    if user.is_none() {
        bot.answer_callback_query(q.id.clone())
            .text("Сначала отправьте /start")
            .show_alert(true)
            .await?;
    }
    Ok(user)
}

async fn callback_tariffs(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    if callback_user(&bot, &q, &state).await?.is_none() {
        return Ok(());
    }
    bot.answer_callback_query(q.id.clone()).await?;
    if let Some((chat_id, _)) = callback_message_target(&q) {
        show_tariffs(&bot, chat_id, &state).await?;
    }
    Ok(())
}

async fn callback_sub_qr(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let Some(user) = callback_user(&bot, &q, &state).await? else {
        return Ok(());
    };
    let Some(subscription) = state.db.get_subscription_by_user(user.id).await? else {
        return alert(&bot, &q, "Подписки нет. Выберите тариф или пробный период.").await;
    };
    let link = match subscription.subscription_url.clone() {
        Some(url) if !url.trim().is_empty() => url,
        _ => match subscription_link_for(&state, user.telegram_id).await {
            Some(url) => url,
            None => return alert(&bot, &q, "Ссылка подписки пока недоступна").await,
        },
    };

    bot.answer_callback_query(q.id.clone()).await?;
    let qr_png = build_qr_png_bytes(&link)?;
    if let Some((chat_id, _)) = callback_message_target(&q) {
        bot.send_photo(
            chat_id,
            InputFile::memory(qr_png).file_name(format!("subscription-{}.png", user.telegram_id)),
        )
        .caption(format!("Ссылка подписки:\n{}", link))
        .await?;
    }
    tracing::info!(user_id = user.id, "Subscription QR sent");
    Ok(())
}

async fn callback_tariff_buy(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let Some(user) = callback_user(&bot, &q, &state).await? else {
        return Ok(());
    };
    let data = q.data.as_deref().unwrap_or("");
    let tariff_id = parse_callback_id(data, "tariff_buy:")?;
    let Some(tariff) = state.db.get_tariff(tariff_id).await? else {
        return alert(&bot, &q, "Тариф не найден").await;
    };

    let link = subscription_link_for(&state, user.telegram_id).await;
    match state.db.purchase_tariff(user.id, &tariff, link).await {
        Ok(subscription) => {
            tracing::info!(
                user_id = user.id,
                tariff_id = tariff.id,
                subscription_id = subscription.id,
                "Tariff purchased"
            );
            bot.answer_callback_query(q.id.clone()).text("Оплачено").await?;
            if let Some((chat_id, _)) = callback_message_target(&q) {
                bot.send_message(
                    chat_id,
                    format!(
                        "✅ Тариф «{}» оплачен ({}).\nПодписка активна до {}.",
                        tariff.name,
                        format_kopeks(tariff.price_kopeks),
                        format_date(subscription.end_date)
                    ),
                )
                .await?;
            }
            Ok(())
        }
        Err(PurchaseError::Balance(BalanceError::InsufficientFunds)) => {
            alert(
                &bot,
                &q,
                &format!(
                    "Недостаточно средств. Стоимость: {}, на балансе: {}",
                    format_kopeks(tariff.price_kopeks),
                    format_kopeks(user.balance_kopeks)
                ),
            )
            .await
        }
        Err(PurchaseError::TariffInactive | PurchaseError::TariffNotFound) => {
            alert(&bot, &q, "Тариф недоступен для покупки").await
        }
        Err(error) => Err(error.into()),
    }
}

async fn callback_topup(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let Some(user) = callback_user(&bot, &q, &state).await? else {
        return Ok(());
    };
    let data = q.data.as_deref().unwrap_or("");
    let Some(stars) = parse_topup_payload(data) else {
        return alert(&bot, &q, "Некорректная сумма").await;
    };

    let quote = state.stars.current_rate().await;
    let kopeks = crate::stars::stars_to_kopeks(stars, quote.rate_rub);
    let min_kopeks = state.settings.get_int(MIN_TOPUP_KOPEKS).await;
    if kopeks < min_kopeks {
        return alert(
            &bot,
            &q,
            &format!("Минимальное пополнение: {}", format_kopeks(min_kopeks)),
        )
        .await;
    }

    bot.answer_callback_query(q.id.clone()).await?;
    let Some((chat_id, _)) = callback_message_target(&q) else {
        return Ok(());
    };
    let prices = vec![LabeledPrice {
        label: format!("{} ⭐", stars),
        amount: stars,
    }];
    bot.send_invoice(
        chat_id,
        "Пополнение баланса",
        format!("Зачисление около {} по текущему курсу", format_kopeks(kopeks)),
        format!("{}{}", TOPUP_PAYLOAD_PREFIX, stars),
        "XTR",
        prices,
    )
    .await?;
    tracing::info!(user_id = user.id, stars = stars, "Stars invoice sent");
    Ok(())
}

async fn callback_poll_start(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let Some(user) = callback_user(&bot, &q, &state).await? else {
        return Ok(());
    };
    let data = q.data.as_deref().unwrap_or("");
    let response_id = parse_callback_id(data, "poll_start:")?;
    if !owns_response(&bot, &q, &state, &user, response_id).await? {
        return Ok(());
    }
    let step = state.polls.start(response_id).await;
    show_poll_step(&bot, &q, response_id, step).await
}

async fn callback_poll_answer(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let Some(user) = callback_user(&bot, &q, &state).await? else {
        return Ok(());
    };
    let data = q.data.as_deref().unwrap_or("");
    let (response_id, question_id, option_id) = parse_poll_answer(data)?;
    if !owns_response(&bot, &q, &state, &user, response_id).await? {
        return Ok(());
    }
    let step = state.polls.answer(response_id, question_id, option_id).await;
    show_poll_step(&bot, &q, response_id, step).await
}

async fn owns_response(
    bot: &Bot,
    q: &CallbackQuery,
    state: &BotState,
    user: &User,
    response_id: i64,
) -> Result<bool, anyhow::Error> {
    let owned = match state.polls.response(response_id).await {
        Ok(response) => response.user_id == user.id,
        Err(PollAnswerError::ResponseNotFound) => false,
        Err(error) => return Err(error.into()),
    };
    if !owned {
        bot.answer_callback_query(q.id.clone())
            .text("Опрос не найден")
            .show_alert(true)
            .await?;
    }
    Ok(owned)
}

async fn show_poll_step(
    bot: &Bot,
    q: &CallbackQuery,
    response_id: i64,
    step: Result<PollStep, PollAnswerError>,
) -> HandlerResult {
    let (text, keyboard) = match step {
        Ok(PollStep::Question {
            question,
            position,
            total,
        }) => (
            render_poll_question(&question, position, total),
            poll_question_keyboard(response_id, &question),
        ),
        Ok(PollStep::Completed(completion)) => (
            render_poll_completed(completion.reward_kopeks),
            InlineKeyboardMarkup::default(),
        ),
        Err(PollAnswerError::AlreadyCompleted) => {
            return alert(bot, q, "Опрос уже пройден").await;
        }
        Err(PollAnswerError::ResponseNotFound) => {
            return alert(bot, q, "Опрос не найден").await;
        }
        Err(PollAnswerError::QuestionMismatch | PollAnswerError::OptionMismatch) => {
            return alert(bot, q, "Этот вариант больше недоступен").await;
        }
        Err(error) => return Err(error.into()),
    };

    bot.answer_callback_query(q.id.clone()).await?;
    if let Some((chat_id, message_id)) = callback_message_target(q)
        && let Err(error) = bot
            .edit_message_text(chat_id, message_id, text)
            .reply_markup(keyboard)
            .await
    {
        tracing::warn!(response_id = response_id, error = %error, "Failed to update poll message");
    }
    Ok(())
}
