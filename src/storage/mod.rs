pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::transport::InlineKeyboard;
use crate::update::{ChatId, MessageId, UserId};

pub use memory::InMemoryStorage;
pub use sqlite::SqliteStorage;

/// Action code meaning "no active flow".
pub const NO_ACTION: i64 = 0;

/// Per-user flow state.
#[async_trait]
pub trait ActionStorage: Send + Sync {
    /// Current action code; `NO_ACTION` when nothing is stored.
    async fn get_action(&self, user_id: UserId) -> Result<i64>;

    /// Stores an action code. Saving `NO_ACTION` clears the entry.
    async fn save_action(&self, user_id: UserId, action: i64) -> Result<()>;

    /// Stores an action and returns a handle able to restore the prior one.
    async fn save_action_with_rollback(&self, user_id: UserId, action: i64) -> Result<Rollback>;
}

/// A message the bot or the user sent, remembered for later cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub inline_keyboard: bool,
}

/// Paged inline keyboard attached to one message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyboardInfo {
    pub keyboards: Vec<InlineKeyboard>,
    pub current_position: usize,
}

/// Message and keyboard history.
#[async_trait]
pub trait MessageStorage: Send + Sync {
    async fn save_callback_message(
        &self,
        callback_id: &str,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<()>;
    async fn get_callback_message(&self, callback_id: &str) -> Result<MessageInfo>;
    async fn delete_callback_message(&self, callback_id: &str) -> Result<()>;

    /// Adds a message to the chat's history; duplicates collapse.
    async fn save_user_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        with_keyboard: bool,
    ) -> Result<()>;
    async fn get_user_messages(&self, chat_id: ChatId) -> Result<Vec<MessageInfo>>;
    /// Forgets the whole history of a chat.
    async fn delete_user_messages(&self, chat_id: ChatId) -> Result<()>;

    async fn save_keyboard_info(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        keyboard: &KeyboardInfo,
    ) -> Result<()>;
    async fn get_keyboard_info(&self, chat_id: ChatId, message_id: MessageId)
        -> Result<KeyboardInfo>;
    async fn delete_keyboard_info(&self, chat_id: ChatId, message_id: MessageId) -> Result<()>;
}

/// Deep-link invites.
#[async_trait]
pub trait InviteStorage: Send + Sync {
    /// Creates the invite unless the secret is already taken.
    async fn save_invite(&self, secret: &str, from_user: UserId, ttl: Duration) -> Result<()>;
    /// Issuer of the invite; `Error::Expired` once the TTL passed.
    async fn get_invite(&self, secret: &str) -> Result<UserId>;
    async fn delete_invite(&self, secret: &str) -> Result<()>;
}

/// Random deep-link secret for a new invite.
pub fn new_invite_secret() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

type RestoreFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Restores a previously stored action if the work that depended on the
/// new one fails.
pub struct Rollback {
    restore: RestoreFn,
}

impl Rollback {
    pub fn new<F>(restore: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        Self {
            restore: Box::new(restore),
        }
    }

    /// Restores the prior action when `outcome` is an error.
    pub async fn finish<T, E>(self, outcome: &std::result::Result<T, E>) -> Result<()> {
        if outcome.is_err() {
            (self.restore)().await
        } else {
            Ok(())
        }
    }

    /// Restores the prior action unconditionally.
    pub async fn restore(self) -> Result<()> {
        (self.restore)().await
    }
}

impl std::fmt::Debug for Rollback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rollback").finish_non_exhaustive()
    }
}
