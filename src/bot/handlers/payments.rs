use super::shared::{parse_topup_payload, HandlerResult};
use super::state::{sender_user_id, BotState};
use crate::bot::format::format_kopeks;
use crate::db::{BalanceChange, TransactionType};
use crate::settings::REFERRAL_COMMISSION_PERCENT;
use crate::stars::stars_to_kopeks;
use teloxide::prelude::*;
use teloxide::types::PreCheckoutQuery;

const STARS_CURRENCY: &str = "XTR";
const PAYMENT_METHOD_STARS: &str = "telegram_stars";

pub async fn handle_pre_checkout(bot: Bot, query: PreCheckoutQuery, state: BotState) -> HandlerResult {
    let tg_user_id = query.from.id.0 as i64;
    let well_formed = query.currency == STARS_CURRENCY
        && parse_topup_payload(&query.invoice_payload).is_some();
    let registered = state.db.get_user_by_telegram_id(tg_user_id).await?.is_some();
    tracing::info!(
        user_id = tg_user_id,
        payload = %query.invoice_payload,
        total_amount = query.total_amount,
        approved = well_formed && registered,
        "Pre-checkout query received"
    );

    if well_formed && registered {
        bot.answer_pre_checkout_query(query.id, true).await?;
    } else {
        bot.answer_pre_checkout_query(query.id, false)
            .error_message("Платёж не может быть принят. Попробуйте ещё раз из меню пополнения.")
            .await?;
    }
    Ok(())
}

/// Зачисляет оплаченные звёзды по текущему курсу.
pub async fn handle_successful_payment(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(payment) = msg.successful_payment() else {
        return Ok(());
    };
    let Some(tg_user_id) = sender_user_id(&msg) else {
        return Ok(());
    };
    let charge_id = payment.telegram_payment_charge_id.to_string();
    if payment.currency != STARS_CURRENCY || parse_topup_payload(&payment.invoice_payload).is_none() {
        tracing::warn!(
            user_id = tg_user_id,
            currency = %payment.currency,
            payload = %payment.invoice_payload,
            charge_id = %charge_id,
            "Unexpected successful payment"
        );
        return Ok(());
    }
    let Some(user) = state.db.get_user_by_telegram_id(tg_user_id).await? else {
        tracing::error!(user_id = tg_user_id, charge_id = %charge_id, "Payment from unknown user");
        return Ok(());
    };

    let stars = payment.total_amount;
    let quote = state.stars.current_rate().await;
    let kopeks = stars_to_kopeks(stars, quote.rate_rub);
    let description = format!("Пополнение {} ⭐ по курсу {:.2} ₽", stars, quote.rate_rub);
    let change = BalanceChange::new(user.id, kopeks, TransactionType::Deposit)
        .description(&description)
        .payment_method(PAYMENT_METHOD_STARS)
        .external_id(&charge_id);
    let commission = state.settings.get_int(REFERRAL_COMMISSION_PERCENT).await;
    let transaction = state.db.record_deposit(&change, commission).await?;
    tracing::info!(
        user_id = user.id,
        stars = stars,
        amount_kopeks = kopeks,
        transaction_id = transaction.id,
        charge_id = %charge_id,
        "Stars payment credited"
    );

    bot.send_message(
        msg.chat.id,
        format!(
            "✅ Оплата получена: {} ⭐\nНа баланс зачислено {}.",
            stars,
            format_kopeks(kopeks)
        ),
    )
    .await?;
    Ok(())
}
