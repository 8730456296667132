//! Клавиатуры бота: inline и постоянные reply-кнопки.

use super::format::format_kopeks;
use super::menu_cache::MenuButton;
use crate::db::{PollQuestionDetail, Tariff};
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, KeyboardButton, KeyboardMarkup};

pub const BTN_USER_PROFILE: &str = "👤 Профиль";
pub const BTN_USER_TARIFFS: &str = "💳 Тарифы";
pub const BTN_USER_TOPUP: &str = "⭐ Пополнить";
pub const BTN_USER_TRIAL: &str = "🎁 Пробный период";
pub const BTN_USER_SUPPORT: &str = "🆘 Поддержка";
pub const BTN_USER_HELP: &str = "❓ Помощь";

pub const BTN_ADMIN_STATS: &str = "📊 Статистика";
pub const BTN_ADMIN_TOKENS: &str = "🔑 API-токены";

/// Варианты пополнения звёздами.
pub const TOPUP_STAR_OPTIONS: &[u32] = &[50, 100, 250, 500, 1000];

fn user_rows() -> Vec<Vec<KeyboardButton>> {
    vec![
        vec![
            KeyboardButton::new(BTN_USER_PROFILE),
            KeyboardButton::new(BTN_USER_TARIFFS),
        ],
        vec![
            KeyboardButton::new(BTN_USER_TOPUP),
            KeyboardButton::new(BTN_USER_TRIAL),
        ],
        vec![
            KeyboardButton::new(BTN_USER_SUPPORT),
            KeyboardButton::new(BTN_USER_HELP),
        ],
    ]
}

pub fn user_menu() -> KeyboardMarkup {
    KeyboardMarkup::new(user_rows())
        .resize_keyboard()
        .persistent()
}

pub fn admin_menu() -> KeyboardMarkup {
    let mut rows = user_rows();
    rows.push(vec![
        KeyboardButton::new(BTN_ADMIN_STATS),
        KeyboardButton::new(BTN_ADMIN_TOKENS),
    ]);
    KeyboardMarkup::new(rows).resize_keyboard().persistent()
}

pub fn menu_for(is_admin: bool) -> KeyboardMarkup {
    if is_admin { admin_menu() } else { user_menu() }
}

/// Inline-меню под приветствием: подписка и дополнительные кнопки из настроек.
pub fn main_inline_menu(extra: &[MenuButton]) -> InlineKeyboardMarkup {
    let mut kb = InlineKeyboardMarkup::default().append_row(vec![
        InlineKeyboardButton::callback("💳 Тарифы", "tariffs"),
        InlineKeyboardButton::callback("📱 QR подписки", "sub_qr"),
    ]);
    for button in extra {
        kb = kb.append_row(vec![InlineKeyboardButton::url(
            button.text.clone(),
            button.url.clone(),
        )]);
    }
    kb
}

/// Варианты дешевле `min_kopeks` по текущему курсу не показываются.
pub fn topup_keyboard(rate_rub: f64, min_kopeks: i64) -> InlineKeyboardMarkup {
    let options = TOPUP_STAR_OPTIONS
        .iter()
        .map(|stars| (*stars, crate::stars::stars_to_kopeks(*stars, rate_rub)))
        .filter(|(_, kopeks)| *kopeks >= min_kopeks)
        .collect::<Vec<_>>();
    let mut kb = InlineKeyboardMarkup::default();
    for chunk in options.chunks(2) {
        let row = chunk
            .iter()
            .map(|(stars, kopeks)| {
                InlineKeyboardButton::callback(
                    format!("⭐ {} → {}", stars, format_kopeks(*kopeks)),
                    format!("topup:{}", stars),
                )
            })
            .collect::<Vec<_>>();
        kb = kb.append_row(row);
    }
    kb
}

pub fn tariffs_keyboard(tariffs: &[Tariff]) -> InlineKeyboardMarkup {
    let mut kb = InlineKeyboardMarkup::default();
    for tariff in tariffs {
        kb = kb.append_row(vec![InlineKeyboardButton::callback(
            format!("{} — {}", tariff.name, format_kopeks(tariff.price_kopeks)),
            format!("tariff_buy:{}", tariff.id),
        )]);
    }
    kb
}

pub fn poll_start_button(response_id: i64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::default().append_row(vec![InlineKeyboardButton::callback(
        "📝 Пройти опрос",
        format!("poll_start:{}", response_id),
    )])
}

pub fn poll_question_keyboard(response_id: i64, question: &PollQuestionDetail) -> InlineKeyboardMarkup {
    let mut kb = InlineKeyboardMarkup::default();
    for option in &question.options {
        kb = kb.append_row(vec![InlineKeyboardButton::callback(
            option.text.clone(),
            format!(
                "poll_ans:{}:{}:{}",
                response_id, question.question.id, option.id
            ),
        )]);
    }
    kb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topup_hides_options_below_minimum() {
        let kb = topup_keyboard(1.79, 10_000);
        let buttons = kb.inline_keyboard.iter().flatten().count();
        assert_eq!(buttons, 4);
        assert_eq!(kb.inline_keyboard.len(), 2);
        assert!(topup_keyboard(1.79, i64::MAX).inline_keyboard.is_empty());
    }
}
