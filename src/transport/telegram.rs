use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use teloxide::payloads::setters::*;
use teloxide::requests::{Request, Requester};
use teloxide::types::{self as tg, AllowedUpdate, UpdateKind};
use teloxide::{ApiError, Bot, RequestError};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retry::{check_status, RetryPolicy};
use super::{
    ButtonAction, DownloadedFile, EditOptions, InlineKeyboard, ReplyMarkup, SendOptions,
    Transport, UploadedFile,
};
use crate::config::{Config, TransportConfig};
use crate::error::{Error, Result};
use crate::limiter::{RateLimiter, RateSettings};
use crate::update::{
    CallbackQuery, ChatId, IncomingMessage, MembershipChange, MessageId, Payload, Update, UserId,
};

/// Long-polling timeout requested from the Bot API, in seconds.
const POLL_TIMEOUT_SECS: u32 = 30;

/// Outbound calls through the Telegram Bot API.
///
/// Every call waits on a global and a per-chat token bucket before it is
/// sent, and goes through the retry policy.
pub struct TelegramTransport {
    bot: Bot,
    retry: RetryPolicy,
    limiter: RateLimiter<ChatId>,
    username: OnceCell<String>,
    http: reqwest::Client,
}

impl TelegramTransport {
    pub fn new(bot: Bot, config: &TransportConfig) -> Self {
        let limiter = RateLimiter::new(RateSettings::new(config.per_chat_per_second, 2))
            .with_global(RateSettings::new(
                config.global_per_second,
                u32::try_from(config.global_per_second.max(1)).unwrap_or(u32::MAX),
            ));
        Self {
            bot,
            retry: RetryPolicy::new(config.retries, Duration::from_millis(config.retry_wait_ms)),
            limiter,
            username: OnceCell::new(),
            http: reqwest::Client::new(),
        }
    }

    /// Builds the bot client and verifies the token.
    pub async fn connect(config: &Config) -> Result<Self> {
        // Client timeout must exceed the long-polling timeout.
        let client = teloxide::net::default_reqwest_settings()
            .timeout(Duration::from_secs(u64::from(POLL_TIMEOUT_SECS) + 15))
            .build()?;
        let bot = Bot::with_client(&config.telegram.bot_token, client);

        let me = bot.get_me().await?;
        bot.delete_webhook().send().await?;
        info!(username = me.username(), "telegram bot connected (webhook cleared)");

        let transport = Self::new(bot, &config.transport);
        let _ = transport.username.set(me.username().to_string());
        Ok(transport)
    }

    pub fn bot(&self) -> &Bot {
        &self.bot
    }

    pub fn limiter(&self) -> &RateLimiter<ChatId> {
        &self.limiter
    }

    async fn throttle(&self, chat_id: ChatId) {
        self.limiter.wait(&chat_id).await;
    }

    async fn username(&self) -> Result<&str> {
        let name = self
            .username
            .get_or_try_init(|| async {
                let me = self.retry.run("get_me", || self.bot.get_me().send()).await?;
                Ok::<_, Error>(me.username().to_string())
            })
            .await?;
        Ok(name.as_str())
    }

    /// Stream of updates fetched by long polling until `cancel` fires or
    /// another instance takes over the token.
    pub fn updates(
        &self,
        allowed: &[String],
        cancel: CancellationToken,
    ) -> BoxStream<'static, Update> {
        let poller = Poller {
            bot: self.bot.clone(),
            offset: 0,
            pending: VecDeque::new(),
            allowed: parse_allowed_updates(allowed),
            cancel,
        };
        stream::unfold(poller, |mut poller| async move {
            let update = poller.next().await?;
            Some((update, poller))
        })
        .boxed()
    }
}

struct Poller {
    bot: Bot,
    offset: i32,
    pending: VecDeque<Update>,
    allowed: Vec<AllowedUpdate>,
    cancel: CancellationToken,
}

impl Poller {
    async fn next(&mut self) -> Option<Update> {
        loop {
            if let Some(update) = self.pending.pop_front() {
                return Some(update);
            }
            if self.cancel.is_cancelled() {
                info!("telegram polling stopped");
                return None;
            }

            let mut request = self
                .bot
                .get_updates()
                .offset(self.offset)
                .timeout(POLL_TIMEOUT_SECS);
            if !self.allowed.is_empty() {
                request = request.allowed_updates(self.allowed.clone());
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = request.send() => result,
            };

            match result {
                Ok(updates) => {
                    debug!(count = updates.len(), "got telegram updates");
                    for update in updates {
                        self.offset = update.id.as_offset();
                        match convert_update(update) {
                            Some(update) => self.pending.push_back(update),
                            None => debug!("skipping unsupported update"),
                        }
                    }
                }
                Err(RequestError::Api(ApiError::TerminatedByOtherGetUpdates)) => {
                    error!("another instance is polling with this token, stopping");
                    return None;
                }
                Err(e) => {
                    warn!(error = %e, "failed to fetch telegram updates, retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
    }
}

fn parse_allowed_updates(names: &[String]) -> Vec<AllowedUpdate> {
    names
        .iter()
        .filter_map(|name| {
            match serde_json::from_value(serde_json::Value::String(name.trim().to_string())) {
                Ok(kind) => Some(kind),
                Err(_) => {
                    warn!(name = %name, "unknown update kind in allowed_updates, ignoring");
                    None
                }
            }
        })
        .collect()
}

fn user_id(user: &tg::User) -> UserId {
    UserId(user.id.0 as i64)
}

fn convert_message(msg: &tg::Message) -> IncomingMessage {
    let file_id = msg
        .document()
        .map(|d| d.file.id.to_string())
        .or_else(|| msg.photo().and_then(|p| p.last()).map(|p| p.file.id.to_string()));
    IncomingMessage {
        id: Some(MessageId(msg.id.0)),
        text: msg.text().or_else(|| msg.caption()).map(str::to_string),
        file_id,
        migrate_to_chat_id: msg.migrate_to_chat_id().map(|c| ChatId(c.0)),
    }
}

fn convert_membership(change: &tg::ChatMemberUpdated) -> MembershipChange {
    MembershipChange {
        member: user_id(&change.new_chat_member.user),
        old_status: format!("{:?}", change.old_chat_member.kind.status()).to_lowercase(),
        new_status: format!("{:?}", change.new_chat_member.kind.status()).to_lowercase(),
    }
}

/// Resolves a platform update to the chat it belongs to. Updates that
/// carry no chat (inline queries, polls) yield `None`, and so do edits of
/// earlier messages, which must not run handlers a second time.
pub fn convert_update(update: tg::Update) -> Option<Update> {
    let id = update.id.0;
    match update.kind {
        UpdateKind::Message(msg) => {
            let sender = msg.from.as_ref();
            Some(Update {
                id,
                chat_id: ChatId(msg.chat.id.0),
                user_id: sender.map(user_id),
                language_code: sender.and_then(|u| u.language_code.clone()),
                payload: Payload::Message(convert_message(&msg)),
            })
        }
        UpdateKind::CallbackQuery(query) => {
            let message = query.message.as_ref()?;
            Some(Update {
                id,
                chat_id: ChatId(message.chat().id.0),
                user_id: Some(user_id(&query.from)),
                language_code: query.from.language_code.clone(),
                payload: Payload::Callback(CallbackQuery {
                    id: query.id.to_string(),
                    data: query.data.clone(),
                    message_id: Some(MessageId(message.id().0)),
                }),
            })
        }
        UpdateKind::ChatMember(change) => Some(Update {
            id,
            chat_id: ChatId(change.chat.id.0),
            user_id: Some(user_id(&change.from)),
            language_code: change.from.language_code.clone(),
            payload: Payload::ChatMember(convert_membership(&change)),
        }),
        UpdateKind::MyChatMember(change) => Some(Update {
            id,
            chat_id: ChatId(change.chat.id.0),
            user_id: Some(user_id(&change.from)),
            language_code: change.from.language_code.clone(),
            payload: Payload::MyChatMember(convert_membership(&change)),
        }),
        _ => None,
    }
}

fn inline_markup(keyboard: &InlineKeyboard) -> Result<tg::InlineKeyboardMarkup> {
    let mut rows = Vec::with_capacity(keyboard.rows.len());
    for row in &keyboard.rows {
        let mut buttons = Vec::with_capacity(row.len());
        for button in row {
            buttons.push(match &button.action {
                ButtonAction::Callback(data) => {
                    tg::InlineKeyboardButton::callback(button.text.clone(), data.clone())
                }
                ButtonAction::Url(url) => {
                    let url = reqwest::Url::parse(url)
                        .map_err(|e| Error::fatal(format!("invalid button url {url}: {e}")))?;
                    tg::InlineKeyboardButton::url(button.text.clone(), url)
                }
            });
        }
        rows.push(buttons);
    }
    Ok(tg::InlineKeyboardMarkup::new(rows))
}

fn reply_markup(markup: &ReplyMarkup) -> Result<tg::ReplyMarkup> {
    Ok(match markup {
        ReplyMarkup::Inline(keyboard) => inline_markup(keyboard)?.into(),
        ReplyMarkup::Reply(rows) => tg::KeyboardMarkup::new(
            rows.iter()
                .map(|row| row.iter().map(|text| tg::KeyboardButton::new(text.clone())).collect::<Vec<_>>())
                .collect::<Vec<_>>(),
        )
        .into(),
        ReplyMarkup::RemoveReply => tg::KeyboardRemove::new().into(),
    })
}

fn tg_chat(chat_id: ChatId) -> tg::ChatId {
    tg::ChatId(chat_id.0)
}

fn tg_message(message_id: MessageId) -> tg::MessageId {
    tg::MessageId(message_id.0)
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        options: SendOptions,
    ) -> Result<MessageId> {
        let markup = options.markup.as_ref().map(reply_markup).transpose()?;
        self.throttle(chat_id).await;
        let sent = self
            .retry
            .run("send_message", || {
                let request = self.bot.send_message(tg_chat(chat_id), text.to_string());
                match markup.clone() {
                    Some(markup) => request.reply_markup(markup).send(),
                    None => request.send(),
                }
            })
            .await?;
        Ok(MessageId(sent.id.0))
    }

    async fn edit_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        options: EditOptions,
    ) -> Result<()> {
        let keyboard = options.keyboard.as_ref().map(inline_markup).transpose()?;
        self.throttle(chat_id).await;
        match (options.text, keyboard) {
            (Some(text), keyboard) => {
                self.retry
                    .run("edit_message_text", || {
                        let request = self.bot.edit_message_text(
                            tg_chat(chat_id),
                            tg_message(message_id),
                            text.clone(),
                        );
                        match keyboard.clone() {
                            Some(keyboard) => request.reply_markup(keyboard).send(),
                            None => request.send(),
                        }
                    })
                    .await?;
            }
            (None, Some(keyboard)) => {
                self.retry
                    .run("edit_message_reply_markup", || {
                        self.bot
                            .edit_message_reply_markup(tg_chat(chat_id), tg_message(message_id))
                            .reply_markup(keyboard.clone())
                            .send()
                    })
                    .await?;
            }
            (None, None) => debug!(%chat_id, "edit without changes, skipping"),
        }
        Ok(())
    }

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<()> {
        self.throttle(chat_id).await;
        self.retry
            .run("delete_message", || {
                self.bot
                    .delete_message(tg_chat(chat_id), tg_message(message_id))
                    .send()
            })
            .await?;
        Ok(())
    }

    async fn upload_file(
        &self,
        chat_id: ChatId,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<UploadedFile> {
        self.throttle(chat_id).await;
        let sent = self
            .retry
            .run("send_document", || {
                let file = tg::InputFile::memory(content.clone()).file_name(file_name.to_string());
                self.bot.send_document(tg_chat(chat_id), file).send()
            })
            .await?;
        let file_id = sent
            .document()
            .map(|d| d.file.id.to_string())
            .ok_or_else(|| Error::state("document in upload response"))?;
        Ok(UploadedFile {
            message_id: MessageId(sent.id.0),
            file_id,
        })
    }

    async fn send_file_by_id(&self, chat_id: ChatId, file_id: &str) -> Result<MessageId> {
        self.throttle(chat_id).await;
        let sent = self
            .retry
            .run("send_document", || {
                let file = tg::InputFile::file_id(tg::FileId(file_id.to_string()));
                self.bot.send_document(tg_chat(chat_id), file).send()
            })
            .await?;
        Ok(MessageId(sent.id.0))
    }

    async fn copy_message(
        &self,
        from_chat_id: ChatId,
        to_chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<MessageId> {
        self.throttle(to_chat_id).await;
        let copied = self
            .retry
            .run("copy_message", || {
                self.bot
                    .copy_message(tg_chat(to_chat_id), tg_chat(from_chat_id), tg_message(message_id))
                    .send()
            })
            .await?;
        Ok(MessageId(copied.0))
    }

    async fn download_file(&self, file_id: &str) -> Result<DownloadedFile> {
        let file = self
            .retry
            .run("get_file", || self.bot.get_file(tg::FileId(file_id.to_string())).send())
            .await?;

        let url = format!(
            "https://api.telegram.org/file/bot{}/{}",
            self.bot.token(),
            file.path
        );
        let http = &self.http;
        let url = url.as_str();
        let data = self
            .retry
            .run("download_file", || async move {
                let response = http.get(url).send().await?;
                let status = response.status();
                let body = response.bytes().await?;
                check_status(status, &body)?;
                Ok::<_, Error>(body.to_vec())
            })
            .await?;

        let path = Path::new(&file.path);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_id.to_string());
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        Ok(DownloadedFile {
            file_name,
            mime_type,
            data,
        })
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        self.retry
            .run("answer_callback_query", || {
                let request = self
                    .bot
                    .answer_callback_query(tg::CallbackQueryId(callback_id.to_string()));
                match text {
                    Some(text) => request.text(text.to_string()).send(),
                    None => request.send(),
                }
            })
            .await?;
        Ok(())
    }

    async fn kick_user(&self, chat_id: ChatId, user_id: UserId, ban: bool) -> Result<()> {
        let user = tg::UserId(user_id.0 as u64);
        self.throttle(chat_id).await;
        self.retry
            .run("ban_chat_member", || {
                self.bot.ban_chat_member(tg_chat(chat_id), user).send()
            })
            .await?;
        if !ban {
            self.retry
                .run("unban_chat_member", || {
                    self.bot
                        .unban_chat_member(tg_chat(chat_id), user)
                        .only_if_banned(true)
                        .send()
                })
                .await?;
        }
        Ok(())
    }

    async fn invite_link(&self, secret: &str) -> Result<String> {
        let username = self.username().await?;
        Ok(format!("https://telegram.me/{username}?start={secret}"))
    }
}
