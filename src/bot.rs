pub mod format;
pub mod handlers;
pub mod keyboards;
pub mod menu_cache;
