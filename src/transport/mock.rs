use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{DownloadedFile, EditOptions, SendOptions, Transport, UploadedFile};
use crate::error::{Error, Result};
use crate::update::{ChatId, MessageId, UserId};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Send {
        chat_id: ChatId,
        text: String,
        options: SendOptions,
    },
    Edit {
        chat_id: ChatId,
        message_id: MessageId,
        options: EditOptions,
    },
    Delete {
        chat_id: ChatId,
        message_id: MessageId,
    },
    Answer {
        callback_id: String,
    },
}

/// Records outbound calls instead of performing them.
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<Call>>,
    next_id: AtomicI32,
    pub fail_sends: bool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI32::new(1000),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_sends: true,
            ..Self::new()
        }
    }

    fn record(&self) -> MutexGuard<'_, Vec<Call>> {
        self.calls.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.record().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.record()
            .iter()
            .filter_map(|c| match c {
                Call::Send { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        options: SendOptions,
    ) -> Result<MessageId> {
        if self.fail_sends {
            return Err(Error::transient("send refused"));
        }
        self.record().push(Call::Send {
            chat_id,
            text: text.to_string(),
            options,
        });
        Ok(MessageId(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn edit_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        options: EditOptions,
    ) -> Result<()> {
        self.record().push(Call::Edit {
            chat_id,
            message_id,
            options,
        });
        Ok(())
    }

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<()> {
        self.record().push(Call::Delete {
            chat_id,
            message_id,
        });
        Ok(())
    }

    async fn upload_file(
        &self,
        _chat_id: ChatId,
        file_name: &str,
        _content: Vec<u8>,
    ) -> Result<UploadedFile> {
        Ok(UploadedFile {
            message_id: MessageId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            file_id: format!("file-{file_name}"),
        })
    }

    async fn send_file_by_id(&self, _chat_id: ChatId, _file_id: &str) -> Result<MessageId> {
        Ok(MessageId(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn copy_message(
        &self,
        _from_chat_id: ChatId,
        _to_chat_id: ChatId,
        _message_id: MessageId,
    ) -> Result<MessageId> {
        Ok(MessageId(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn download_file(&self, file_id: &str) -> Result<DownloadedFile> {
        Err(Error::not_found(format!("file {file_id}")))
    }

    async fn answer_callback(&self, callback_id: &str, _text: Option<&str>) -> Result<()> {
        self.record().push(Call::Answer {
            callback_id: callback_id.to_string(),
        });
        Ok(())
    }

    async fn kick_user(&self, _chat_id: ChatId, _user_id: UserId, _ban: bool) -> Result<()> {
        Ok(())
    }

    async fn invite_link(&self, secret: &str) -> Result<String> {
        Ok(format!("https://telegram.me/test_bot?start={secret}"))
    }
}
