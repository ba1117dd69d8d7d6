use crate::bot::keyboards::inline_keyboard;
use crate::services::notification_service::{Notifier, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::ParseMode;

/// Delivers flow replies as HTML messages with inline keyboards.
#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, chat_id: i64, message: OutboundMessage) -> Result<()> {
        let request = self
            .bot
            .send_message(ChatId(chat_id), message.text)
            .parse_mode(ParseMode::Html);
        if message.buttons.is_empty() {
            request.await?;
        } else {
            request.reply_markup(inline_keyboard(&message.buttons)).await?;
        }
        Ok(())
    }
}
