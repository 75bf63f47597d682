use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::info;

use super::{
    ActionStorage, InviteStorage, KeyboardInfo, MessageInfo, MessageStorage, Rollback, NO_ACTION,
};
use crate::error::{Error, Result};
use crate::update::{ChatId, MessageId, UserId};

/// SQLite-backed storage for actions, message history and invites.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;

        info!("Storage initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS user_actions (
                user_id INTEGER PRIMARY KEY,
                action INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS callback_messages (
                callback_id TEXT PRIMARY KEY,
                chat_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_messages (
                chat_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                inline_keyboard INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (chat_id, message_id, inline_keyboard)
            );

            CREATE TABLE IF NOT EXISTS keyboards (
                chat_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (chat_id, message_id)
            );

            -- expires_at is unix time in milliseconds
            CREATE TABLE IF NOT EXISTS invites (
                secret TEXT PRIMARY KEY,
                from_user_id INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl ActionStorage for SqliteStorage {
    async fn get_action(&self, user_id: UserId) -> Result<i64> {
        let conn = self.conn.lock().await;
        let action: Option<i64> = conn
            .query_row(
                "SELECT action FROM user_actions WHERE user_id = ?1",
                rusqlite::params![user_id.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(action.unwrap_or(NO_ACTION))
    }

    async fn save_action(&self, user_id: UserId, action: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        if action == NO_ACTION {
            conn.execute(
                "DELETE FROM user_actions WHERE user_id = ?1",
                rusqlite::params![user_id.0],
            )?;
        } else {
            conn.execute(
                "INSERT INTO user_actions (user_id, action) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET action = excluded.action",
                rusqlite::params![user_id.0, action],
            )?;
        }
        Ok(())
    }

    async fn save_action_with_rollback(&self, user_id: UserId, action: i64) -> Result<Rollback> {
        let previous = self.get_action(user_id).await?;
        let store = self.clone();
        let rollback = Rollback::new(move || {
            Box::pin(async move { store.save_action(user_id, previous).await })
        });
        if let Err(e) = self.save_action(user_id, action).await {
            rollback.restore().await?;
            return Err(e);
        }
        Ok(rollback)
    }
}

#[async_trait]
impl MessageStorage for SqliteStorage {
    async fn save_callback_message(
        &self,
        callback_id: &str,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO callback_messages (callback_id, chat_id, message_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(callback_id) DO UPDATE SET
                chat_id = excluded.chat_id,
                message_id = excluded.message_id",
            rusqlite::params![callback_id, chat_id.0, message_id.0],
        )?;
        Ok(())
    }

    async fn get_callback_message(&self, callback_id: &str) -> Result<MessageInfo> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT chat_id, message_id FROM callback_messages WHERE callback_id = ?1",
            rusqlite::params![callback_id],
            |row| {
                Ok(MessageInfo {
                    chat_id: ChatId(row.get(0)?),
                    message_id: MessageId(row.get(1)?),
                    inline_keyboard: false,
                })
            },
        )
        .optional()?
        .ok_or_else(|| Error::not_found("callback message"))
    }

    async fn delete_callback_message(&self, callback_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM callback_messages WHERE callback_id = ?1",
            rusqlite::params![callback_id],
        )?;
        Ok(())
    }

    async fn save_user_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        with_keyboard: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO user_messages (chat_id, message_id, inline_keyboard)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![chat_id.0, message_id.0, with_keyboard],
        )?;
        Ok(())
    }

    async fn get_user_messages(&self, chat_id: ChatId) -> Result<Vec<MessageInfo>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT message_id, inline_keyboard FROM user_messages
             WHERE chat_id = ?1 ORDER BY message_id ASC",
        )?;
        let messages = stmt
            .query_map(rusqlite::params![chat_id.0], |row| {
                Ok(MessageInfo {
                    message_id: MessageId(row.get(0)?),
                    chat_id,
                    inline_keyboard: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    async fn delete_user_messages(&self, chat_id: ChatId) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM user_messages WHERE chat_id = ?1",
            rusqlite::params![chat_id.0],
        )?;
        Ok(())
    }

    async fn save_keyboard_info(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        keyboard: &KeyboardInfo,
    ) -> Result<()> {
        let payload = serde_json::to_string(keyboard)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO keyboards (chat_id, message_id, payload) VALUES (?1, ?2, ?3)
             ON CONFLICT(chat_id, message_id) DO UPDATE SET payload = excluded.payload",
            rusqlite::params![chat_id.0, message_id.0, payload],
        )?;
        Ok(())
    }

    async fn get_keyboard_info(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<KeyboardInfo> {
        let payload: Option<String> = {
            let conn = self.conn.lock().await;
            conn.query_row(
                "SELECT payload FROM keyboards WHERE chat_id = ?1 AND message_id = ?2",
                rusqlite::params![chat_id.0, message_id.0],
                |row| row.get(0),
            )
            .optional()?
        };
        let payload = payload.ok_or_else(|| Error::not_found("keyboard"))?;
        Ok(serde_json::from_str(&payload)?)
    }

    async fn delete_keyboard_info(&self, chat_id: ChatId, message_id: MessageId) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM keyboards WHERE chat_id = ?1 AND message_id = ?2",
            rusqlite::params![chat_id.0, message_id.0],
        )?;
        Ok(())
    }
}

#[async_trait]
impl InviteStorage for SqliteStorage {
    async fn save_invite(&self, secret: &str, from_user: UserId, ttl: Duration) -> Result<()> {
        let now = now_millis();
        let expires_at = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM invites WHERE expires_at <= ?1",
            rusqlite::params![now],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO invites (secret, from_user_id, expires_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![secret, from_user.0, expires_at],
        )?;
        Ok(())
    }

    async fn get_invite(&self, secret: &str) -> Result<UserId> {
        let conn = self.conn.lock().await;
        let user: Option<i64> = conn
            .query_row(
                "SELECT from_user_id FROM invites WHERE secret = ?1 AND expires_at > ?2",
                rusqlite::params![secret, now_millis()],
                |row| row.get(0),
            )
            .optional()?;
        user.map(UserId).ok_or(Error::Expired)
    }

    async fn delete_invite(&self, secret: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM invites WHERE secret = ?1",
            rusqlite::params![secret],
        )?;
        Ok(())
    }
}
