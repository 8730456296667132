//! Обработчики команд, кнопок и платежей.

#[path = "handlers/callbacks/mod.rs"]
mod callbacks;
#[path = "handlers/commands/mod.rs"]
mod commands;
#[path = "handlers/menu.rs"]
mod menu;
#[path = "handlers/payments.rs"]
mod payments;
#[path = "handlers/shared.rs"]
mod shared;
#[path = "handlers/state.rs"]
mod state;

pub use commands::BotCommand;
pub use state::BotState;

use teloxide::dispatching::DpHandlerDescription;
use teloxide::dptree;
use teloxide::prelude::*;

pub fn schema() -> dptree::Handler<
    'static,
    Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>,
    DpHandlerDescription,
> {
    let message_handler = Update::filter_message()
        .branch(
            dptree::filter(|msg: Message| msg.successful_payment().is_some())
                .endpoint(payments::handle_successful_payment),
        )
        .branch(commands::handler())
        .endpoint(menu::handle_menu_buttons);

    dptree::entry()
        .branch(message_handler)
        .branch(callbacks::handler())
        .branch(Update::filter_pre_checkout_query().endpoint(payments::handle_pre_checkout))
}
