use crate::bot::menu_cache::MenuButtonCache;
use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::db::{Db, NewUser};
use crate::polls::PollService;
use crate::settings::RuntimeSettings;
use crate::stars::StarsRateService;
use std::collections::HashSet;
use std::sync::Arc;
use teloxide::types::Message;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct BotState {
    pub config: Arc<Config>,
    pub db: Arc<Db>,
    pub settings: Arc<RuntimeSettings>,
    pub stars: Arc<StarsRateService>,
    pub menu_cache: Arc<MenuButtonCache>,
    pub polls: PollService,
    pub broadcaster: Broadcaster,
    pub bot_username: Option<String>,
    /// Пользователи, нажавшие «Поддержка»: следующий текст уходит в обращение.
    pub awaiting_ticket_users: Arc<Mutex<HashSet<i64>>>,
}

pub fn sender_user_id(msg: &Message) -> Option<i64> {
    msg.from.as_ref().map(|user| user.id.0 as i64)
}

pub fn sender_display_name(msg: &Message) -> Option<String> {
    msg.from.as_ref().map(|user| {
        let mut full_name = user.first_name.clone();
        if let Some(last_name) = user.last_name.as_deref()
            && !last_name.trim().is_empty()
        {
            full_name.push(' ');
            full_name.push_str(last_name);
        }
        full_name
    })
}

pub fn is_admin_message(msg: &Message, state: &BotState) -> bool {
    sender_user_id(msg).is_some_and(|user_id| state.config.is_admin(user_id))
}

/// Профиль отправителя в виде, который понимает `get_or_create_user`.
pub fn sender_profile(msg: &Message) -> Option<NewUser<'_>> {
    msg.from.as_ref().map(|user| NewUser {
        telegram_id: user.id.0 as i64,
        username: user.username.as_deref(),
        first_name: Some(user.first_name.as_str()),
        last_name: user.last_name.as_deref(),
        language: user.language_code.as_deref(),
    })
}
