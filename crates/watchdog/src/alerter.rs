use teloxide::{prelude::*, types::UpdateKind};
use thiserror::Error;
use tracing::info;

/// Telegram rejects messages above 4096 characters.
pub const MAX_MESSAGE_CHARS: usize = 3800;
const TRUNCATION_MARKER: &str = "\n...[truncated]";

/// `Bot::new` gives every request 17s, so a long poll must return before that.
pub const MAX_POLL_TIMEOUT_SECS: u32 = 10;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("telegram request failed: {0}")]
    Telegram(#[from] teloxide::RequestError),
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send_alert(&self, text: &str) -> Result<(), AlertError>;
}

/// Keeps the head of `text` so the whole message fits `max_chars`.
pub fn truncate_message(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    let keep = max_chars.saturating_sub(TRUNCATION_MARKER.chars().count());
    let mut truncated: String = text.chars().take(keep).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

#[derive(Clone)]
pub struct TelegramAlerter {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramAlerter {
    pub fn new(bot_token: String, chat_id: i64) -> Self {
        Self {
            bot: Bot::new(bot_token),
            chat_id: ChatId(chat_id),
        }
    }

    /// Long-poll inbox reading commands from the same bot and chat.
    pub fn inbox(&self, poll_timeout_secs: u32) -> TelegramInbox {
        TelegramInbox {
            bot: self.bot.clone(),
            chat_id: self.chat_id,
            offset: 0,
            poll_timeout_secs: poll_timeout_secs.min(MAX_POLL_TIMEOUT_SECS),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for TelegramAlerter {
    async fn send_alert(&self, text: &str) -> Result<(), AlertError> {
        self.bot
            .send_message(self.chat_id, truncate_message(text, MAX_MESSAGE_CHARS))
            .await?;
        Ok(())
    }
}

/// Used when Telegram is disabled: alerts only reach the operator console.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn send_alert(&self, text: &str) -> Result<(), AlertError> {
        info!(alert = %text, "telegram disabled, alert logged only");
        Ok(())
    }
}

/// Source of operator command text.
#[async_trait::async_trait]
pub trait CommandInbox: Send {
    /// Waits for the next batch of messages; may return an empty batch.
    async fn next_batch(&mut self) -> Result<Vec<String>, AlertError>;
}

pub struct TelegramInbox {
    bot: Bot,
    chat_id: ChatId,
    offset: i32,
    poll_timeout_secs: u32,
}

#[async_trait::async_trait]
impl CommandInbox for TelegramInbox {
    async fn next_batch(&mut self) -> Result<Vec<String>, AlertError> {
        let updates = self
            .bot
            .get_updates()
            .offset(self.offset)
            .timeout(self.poll_timeout_secs)
            .await?;

        let mut texts = Vec::new();
        for update in updates {
            self.offset = update.id.as_offset();
            let (UpdateKind::Message(message) | UpdateKind::EditedMessage(message)) = update.kind
            else {
                continue;
            };
            // Other chats are ignored.
            if message.chat.id != self.chat_id {
                continue;
            }
            if let Some(text) = message.text() {
                texts.push(text.to_owned());
            }
        }
        Ok(texts)
    }
}
