use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    ActionStorage, InviteStorage, KeyboardInfo, MessageInfo, MessageStorage, Rollback, NO_ACTION,
};
use crate::error::{Error, Result};
use crate::update::{ChatId, MessageId, UserId};

#[derive(Default)]
struct Tables {
    actions: HashMap<UserId, i64>,
    callback_messages: HashMap<String, MessageInfo>,
    user_messages: HashMap<ChatId, BTreeSet<(MessageId, bool)>>,
    keyboards: HashMap<(ChatId, MessageId), KeyboardInfo>,
    invites: HashMap<String, (UserId, Instant)>,
}

/// Process-local storage backend. Cloning shares the same tables.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActionStorage for InMemoryStorage {
    async fn get_action(&self, user_id: UserId) -> Result<i64> {
        let tables = self.tables.lock().await;
        Ok(tables.actions.get(&user_id).copied().unwrap_or(NO_ACTION))
    }

    async fn save_action(&self, user_id: UserId, action: i64) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if action == NO_ACTION {
            tables.actions.remove(&user_id);
        } else {
            tables.actions.insert(user_id, action);
        }
        Ok(())
    }

    async fn save_action_with_rollback(&self, user_id: UserId, action: i64) -> Result<Rollback> {
        let previous = self.get_action(user_id).await?;
        self.save_action(user_id, action).await?;
        let store = self.clone();
        Ok(Rollback::new(move || {
            Box::pin(async move { store.save_action(user_id, previous).await })
        }))
    }
}

#[async_trait]
impl MessageStorage for InMemoryStorage {
    async fn save_callback_message(
        &self,
        callback_id: &str,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.callback_messages.insert(
            callback_id.to_string(),
            MessageInfo {
                message_id,
                chat_id,
                inline_keyboard: false,
            },
        );
        Ok(())
    }

    async fn get_callback_message(&self, callback_id: &str) -> Result<MessageInfo> {
        let tables = self.tables.lock().await;
        tables
            .callback_messages
            .get(callback_id)
            .cloned()
            .ok_or_else(|| Error::not_found("callback message"))
    }

    async fn delete_callback_message(&self, callback_id: &str) -> Result<()> {
        self.tables.lock().await.callback_messages.remove(callback_id);
        Ok(())
    }

    async fn save_user_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        with_keyboard: bool,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables
            .user_messages
            .entry(chat_id)
            .or_default()
            .insert((message_id, with_keyboard));
        Ok(())
    }

    async fn get_user_messages(&self, chat_id: ChatId) -> Result<Vec<MessageInfo>> {
        let tables = self.tables.lock().await;
        let messages = tables
            .user_messages
            .get(&chat_id)
            .map(|set| {
                set.iter()
                    .map(|(message_id, inline_keyboard)| MessageInfo {
                        message_id: *message_id,
                        chat_id,
                        inline_keyboard: *inline_keyboard,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(messages)
    }

    async fn delete_user_messages(&self, chat_id: ChatId) -> Result<()> {
        self.tables.lock().await.user_messages.remove(&chat_id);
        Ok(())
    }

    async fn save_keyboard_info(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        keyboard: &KeyboardInfo,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables
            .keyboards
            .insert((chat_id, message_id), keyboard.clone());
        Ok(())
    }

    async fn get_keyboard_info(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<KeyboardInfo> {
        let tables = self.tables.lock().await;
        tables
            .keyboards
            .get(&(chat_id, message_id))
            .cloned()
            .ok_or_else(|| Error::not_found("keyboard"))
    }

    async fn delete_keyboard_info(&self, chat_id: ChatId, message_id: MessageId) -> Result<()> {
        self.tables
            .lock()
            .await
            .keyboards
            .remove(&(chat_id, message_id));
        Ok(())
    }
}

#[async_trait]
impl InviteStorage for InMemoryStorage {
    async fn save_invite(&self, secret: &str, from_user: UserId, ttl: Duration) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let now = Instant::now();
        tables.invites.retain(|_, (_, expires_at)| *expires_at > now);
        if !tables.invites.contains_key(secret) {
            tables
                .invites
                .insert(secret.to_string(), (from_user, now + ttl));
        }
        Ok(())
    }

    async fn get_invite(&self, secret: &str) -> Result<UserId> {
        let mut tables = self.tables.lock().await;
        match tables.invites.get(secret) {
            Some((user, expires_at)) if *expires_at > Instant::now() => Ok(*user),
            Some(_) => {
                tables.invites.remove(secret);
                Err(Error::Expired)
            }
            None => Err(Error::Expired),
        }
    }

    async fn delete_invite(&self, secret: &str) -> Result<()> {
        self.tables.lock().await.invites.remove(secret);
        Ok(())
    }
}
