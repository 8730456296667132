//! Тексты сообщений бота.

use crate::db::{ApiToken, OverviewStats, Poll, PollQuestionDetail, Subscription, Tariff, User};
use chrono::{DateTime, Local, Utc};

pub fn format_date(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.with_timezone(&Local).format("%d.%m.%Y").to_string())
        .unwrap_or_else(|| "—".to_string())
}

pub fn format_timestamp(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| {
            dt.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S %:z")
                .to_string()
        })
        .unwrap_or_else(|| format!("Некорректный timestamp: {}", ts))
}

/// `12345` → `123.45 ₽`
pub fn format_kopeks(kopeks: i64) -> String {
    let sign = if kopeks < 0 { "-" } else { "" };
    let abs = kopeks.unsigned_abs();
    format!("{}{}.{:02} ₽", sign, abs / 100, abs % 100)
}

pub fn format_traffic_limit(gb: i64) -> String {
    if gb <= 0 {
        "без лимита".to_string()
    } else {
        format!("{} ГБ", gb)
    }
}

pub fn build_referral_link(bot_username: &str, referral_code: &str) -> String {
    let normalized = bot_username.trim_start_matches('@');
    format!("https://t.me/{}?start={}", normalized, referral_code)
}

pub fn render_subscription_block(subscription: Option<&Subscription>, now: i64) -> String {
    let Some(sub) = subscription else {
        return "Подписки нет. Попробуйте /trial или выберите тариф.".to_string();
    };
    let kind = if sub.is_trial { "пробная" } else { "платная" };
    if sub.is_active_at(now) {
        format!(
            "Подписка: активна ({})\n\
             До: {} (осталось дней: {})\n\
             Трафик: {:.1} из {}\n\
             Устройств: {}",
            kind,
            format_date(sub.end_date),
            sub.days_left(now),
            sub.traffic_used_gb,
            format_traffic_limit(sub.traffic_limit_gb),
            sub.device_limit
        )
    } else {
        format!(
            "Подписка: неактивна ({}, статус {})\nЗакончилась: {}",
            kind,
            sub.status,
            format_date(sub.end_date)
        )
    }
}

pub fn render_profile_text(
    user: &User,
    subscription: Option<&Subscription>,
    bot_username: Option<&str>,
    now: i64,
) -> String {
    let referral_line = match (bot_username, user.referral_code.as_deref()) {
        (Some(bot_username), Some(code)) => {
            format!("Реферальная ссылка: {}", build_referral_link(bot_username, code))
        }
        (None, Some(code)) => format!("Реферальный код: {}", code),
        _ => "Реферальный код: —".to_string(),
    };
    format!(
        "👤 {}\n\
         ID: {}\n\
         Баланс: {}\n\n\
         {}\n\n\
         {}",
        user.display_name(),
        user.telegram_id,
        format_kopeks(user.balance_kopeks),
        render_subscription_block(subscription, now),
        referral_line
    )
}

pub fn render_tariff_line(tariff: &Tariff) -> String {
    format!(
        "• {} — {} за {} дн., трафик {}, устройств {}",
        tariff.name,
        format_kopeks(tariff.price_kopeks),
        tariff.period_days,
        format_traffic_limit(tariff.traffic_limit_gb),
        tariff.device_limit
    )
}

pub fn render_poll_intro(poll: &Poll) -> String {
    let mut text = format!("📋 {}", poll.title);
    if let Some(description) = poll.description.as_deref().filter(|d| !d.trim().is_empty()) {
        text.push_str("\n\n");
        text.push_str(description.trim());
    }
    if let Some(reward) = poll.reward() {
        text.push_str(&format!("\n\n🎁 За прохождение: {}", format_kopeks(reward)));
    }
    text
}

pub fn render_poll_question(question: &PollQuestionDetail, position: usize, total: usize) -> String {
    format!("Вопрос {}/{}\n\n{}", position, total, question.question.text)
}

pub fn render_poll_completed(reward_kopeks: Option<i64>) -> String {
    match reward_kopeks {
        Some(amount) => format!(
            "✅ Спасибо за ответы!\nНа баланс начислено {}.",
            format_kopeks(amount)
        ),
        None => "✅ Спасибо за ответы!".to_string(),
    }
}

pub fn render_api_token_line(token: &ApiToken) -> String {
    let state = if token.is_active { "active" } else { "revoked" };
    let expires = token
        .expires_at
        .map(format_date)
        .unwrap_or_else(|| "бессрочно".to_string());
    let last_used = token
        .last_used_at
        .map(format_timestamp)
        .unwrap_or_else(|| "не использовался".to_string());
    format!(
        "• #{} {} | {}… | {} | до {} | права: {} | {}",
        token.id,
        token.name,
        token.token_prefix,
        state,
        expires,
        token.permission_list().join(", "),
        last_used
    )
}

pub fn render_overview_stats(stats: &OverviewStats) -> String {
    format!(
        "📊 Статистика:\n\
         Пользователи: {} (активных {}, заблокировали {})\n\
         Новых за сутки: {}\n\
         Подписки: платных {}, пробных {}, истёкших {}\n\
         Пополнения: сутки {}, 30 дней {}, всего {}\n\
         На балансах: {}\n\
         Открытых обращений: {}",
        stats.users_total,
        stats.users_active,
        stats.users_blocked,
        stats.users_new_today,
        stats.subscriptions_active,
        stats.subscriptions_trial,
        stats.subscriptions_expired,
        format_kopeks(stats.deposits_today_kopeks),
        format_kopeks(stats.deposits_month_kopeks),
        format_kopeks(stats.deposits_total_kopeks),
        format_kopeks(stats.balances_total_kopeks),
        stats.tickets_open
    )
}

pub fn help_text(is_admin: bool) -> String {
    let mut text = String::from(
        "Команды:\n\
         /start — главное меню\n\
         /profile — профиль и подписка\n\
         /balance — баланс\n\
         /trial — пробная подписка\n\
         /topup — пополнить баланс звёздами\n\
         /support — написать в поддержку\n\
         /help — справка",
    );
    if is_admin {
        text.push_str(
            "\n\nДля администраторов:\n\
             /stats — сводная статистика\n\
             /token create <name> [perm ...] — создать API-токен\n\
             /token list — список API-токенов\n\
             /token revoke <id> — отозвать API-токен",
        );
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kopeks_formatting() {
        assert_eq!(format_kopeks(0), "0.00 ₽");
        assert_eq!(format_kopeks(12_345), "123.45 ₽");
        assert_eq!(format_kopeks(-5), "-0.05 ₽");
    }

    #[test]
    fn referral_link_strips_at() {
        assert_eq!(
            build_referral_link("@shop_bot", "refABC"),
            "https://t.me/shop_bot?start=refABC"
        );
    }

    #[test]
    fn admin_help_lists_token_commands() {
        assert!(help_text(true).contains("/token create"));
        assert!(!help_text(false).contains("/token"));
    }
}
