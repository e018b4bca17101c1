//! Telegram client using teloxide.

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{BotCommand, InlineKeyboardButton, InlineKeyboardMarkup, ParseMode};
use tracing::{info, warn};

use crate::bot::commands::COMMANDS;
use crate::bot::message::{Button, Reply};
use crate::bot::scheduler::Messenger;

/// Telegram API client.
#[derive(Clone)]
pub struct TelegramClient {
    bot: Bot,
}

/// One button per row; callback data is the text the button stands for.
fn keyboard(buttons: &[Button]) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(
        buttons
            .iter()
            .map(|b| vec![InlineKeyboardButton::callback(b.label.clone(), b.data.clone())]),
    )
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub async fn send_message(&self, chat_id: i64, reply: &Reply) -> Result<i64, String> {
        let mut request = self
            .bot
            .send_message(ChatId(chat_id), reply.text.as_str())
            .parse_mode(ParseMode::Html);

        if !reply.buttons.is_empty() {
            request = request.reply_markup(keyboard(&reply.buttons));
        }

        request.await.map(|msg| msg.id.0 as i64).map_err(|e| {
            let msg = format!("Failed to send to {chat_id}: {e}");
            warn!("{}", msg);
            msg
        })
    }

    /// Publish the command menu.
    pub async fn register_commands(&self) -> Result<(), String> {
        let commands = COMMANDS
            .iter()
            .map(|(name, description)| BotCommand::new(*name, *description));
        self.bot
            .set_my_commands(commands)
            .await
            .map(|_| info!("Registered {} bot commands", COMMANDS.len()))
            .map_err(|e| {
                let msg = format!("Failed to register commands: {e}");
                warn!("{}", msg);
                msg
            })
    }
}

#[async_trait]
impl Messenger for TelegramClient {
    async fn send(&self, chat_id: i64, reply: &Reply) -> Result<(), String> {
        self.send_message(chat_id, reply).await.map(|_| ())
    }
}
