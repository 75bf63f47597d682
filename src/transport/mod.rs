//! Outbound platform operations consumed by handlers.
//!
//! The dispatch core never calls these; routers and handlers do.

#[cfg(test)]
pub(crate) mod mock;
pub mod retry;
pub mod telegram;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::update::{ChatId, MessageId, UserId};

pub use retry::{Failure, RetryPolicy};
pub use telegram::TelegramTransport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonAction {
    Callback(String),
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    pub action: ButtonAction,
}

impl InlineButton {
    pub fn callback(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            action: ButtonAction::Callback(data.into()),
        }
    }

    pub fn url(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            action: ButtonAction::Url(url.into()),
        }
    }
}

/// Rows of buttons attached under a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<InlineButton>>,
}

impl InlineKeyboard {
    pub fn new(rows: Vec<Vec<InlineButton>>) -> Self {
        Self { rows }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyMarkup {
    Inline(InlineKeyboard),
    /// Custom keyboard replacing the user's input keyboard.
    Reply(Vec<Vec<String>>),
    RemoveReply,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub markup: Option<ReplyMarkup>,
}

impl SendOptions {
    pub fn inline(keyboard: InlineKeyboard) -> Self {
        Self {
            markup: Some(ReplyMarkup::Inline(keyboard)),
        }
    }

    pub fn reply(rows: Vec<Vec<String>>) -> Self {
        Self {
            markup: Some(ReplyMarkup::Reply(rows)),
        }
    }

    pub fn remove_reply() -> Self {
        Self {
            markup: Some(ReplyMarkup::RemoveReply),
        }
    }
}

/// Parts of a sent message to change. `None` leaves a part as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditOptions {
    pub text: Option<String>,
    pub keyboard: Option<InlineKeyboard>,
}

impl EditOptions {
    pub fn keyboard(keyboard: InlineKeyboard) -> Self {
        Self {
            text: None,
            keyboard: Some(keyboard),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            keyboard: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub message_id: MessageId,
    pub file_id: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(&self, chat_id: ChatId, text: &str, options: SendOptions)
        -> Result<MessageId>;

    async fn edit_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        options: EditOptions,
    ) -> Result<()>;

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<()>;

    async fn upload_file(&self, chat_id: ChatId, file_name: &str, content: Vec<u8>)
        -> Result<UploadedFile>;

    async fn send_file_by_id(&self, chat_id: ChatId, file_id: &str) -> Result<MessageId>;

    async fn copy_message(
        &self,
        from_chat_id: ChatId,
        to_chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<MessageId>;

    async fn download_file(&self, file_id: &str) -> Result<DownloadedFile>;

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()>;

    /// Removes a user from a chat. Without `ban` the user may rejoin.
    async fn kick_user(&self, chat_id: ChatId, user_id: UserId, ban: bool) -> Result<()>;

    /// Deep link that starts the bot with `secret` as payload.
    async fn invite_link(&self, secret: &str) -> Result<String>;
}
