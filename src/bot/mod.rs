//! Bus reminder bot: setup dialogue, reminder store, transit lookups and
//! the scheduler that fires reminders.

pub mod commands;
pub mod conversation;
pub mod database;
pub mod datamall;
pub mod engine;
pub mod message;
pub mod reminders;
pub mod scheduler;
pub mod telegram;
pub mod transit;

#[cfg(test)]
pub mod testing;

pub use database::ReminderStore;
pub use datamall::DataMallClient;
pub use engine::{BotSettings, BusBot};
pub use scheduler::Scheduler;
pub use telegram::TelegramClient;
pub use transit::{CacheSettings, TransitData};
