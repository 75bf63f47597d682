use serde::{Deserialize, Serialize};

/// Conversation identifier; the fairness and ordering unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChatId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub i32);

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One inbound event, already resolved to the chat it belongs to.
#[derive(Debug, Clone)]
pub struct Update {
    /// Monotonic sequence number assigned by the source.
    pub id: u32,
    pub chat_id: ChatId,
    pub user_id: Option<UserId>,
    /// IETF language tag of the sender, when the platform reports one.
    pub language_code: Option<String>,
    pub payload: Payload,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Message(IncomingMessage),
    Callback(CallbackQuery),
    /// Membership of some user in a chat the bot administers changed.
    ChatMember(MembershipChange),
    /// The bot's own membership in a chat changed.
    MyChatMember(MembershipChange),
}

#[derive(Debug, Clone, Default)]
pub struct IncomingMessage {
    pub id: Option<MessageId>,
    pub text: Option<String>,
    /// File id of an attached document or the largest photo size.
    pub file_id: Option<String>,
    /// Set when a group was upgraded to a supergroup.
    pub migrate_to_chat_id: Option<ChatId>,
}

#[derive(Debug, Clone)]
pub struct CallbackQuery {
    pub id: String,
    pub data: Option<String>,
    /// Message the pressed inline button was attached to.
    pub message_id: Option<MessageId>,
}

#[derive(Debug, Clone)]
pub struct MembershipChange {
    pub member: UserId,
    pub old_status: String,
    pub new_status: String,
}

impl Update {
    /// Membership events are exempt from per-user rate checks.
    pub fn is_rate_checked(&self) -> bool {
        !matches!(
            self.payload,
            Payload::ChatMember(_) | Payload::MyChatMember(_)
        )
    }

    pub fn message(&self) -> Option<&IncomingMessage> {
        match &self.payload {
            Payload::Message(message) => Some(message),
            _ => None,
        }
    }

    pub fn callback(&self) -> Option<&CallbackQuery> {
        match &self.payload {
            Payload::Callback(query) => Some(query),
            _ => None,
        }
    }

    /// Id of the message this update refers to: the incoming message
    /// itself, or the message carrying the pressed inline button.
    pub fn message_id(&self) -> Option<MessageId> {
        match &self.payload {
            Payload::Message(message) => message.id,
            Payload::Callback(query) => query.message_id,
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.message().and_then(|m| m.text.as_deref())
    }

    /// Bot command name without the leading slash, bot mention and arguments.
    pub fn command(&self) -> Option<&str> {
        parse_command(self.text()?)
    }

    pub fn callback_data(&self) -> Option<&str> {
        self.callback().and_then(|q| q.data.as_deref())
    }
}

fn parse_command(text: &str) -> Option<&str> {
    let rest = text.strip_prefix('/')?;
    let word = rest.split_whitespace().next().unwrap_or("");
    let name = word.split('@').next().unwrap_or("");
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn text(id: u32, chat: i64, user: i64, text: &str) -> Update {
        Update {
            id,
            chat_id: ChatId(chat),
            user_id: Some(UserId(user)),
            language_code: None,
            payload: Payload::Message(IncomingMessage {
                id: Some(MessageId(id as i32)),
                text: Some(text.to_string()),
                ..Default::default()
            }),
        }
    }

    pub fn callback(id: u32, chat: i64, user: i64, data: &str, message_id: i32) -> Update {
        Update {
            id,
            chat_id: ChatId(chat),
            user_id: Some(UserId(user)),
            language_code: None,
            payload: Payload::Callback(CallbackQuery {
                id: format!("cb-{id}"),
                data: Some(data.to_string()),
                message_id: Some(MessageId(message_id)),
            }),
        }
    }

    pub fn my_chat_member(id: u32, chat: i64) -> Update {
        Update {
            id,
            chat_id: ChatId(chat),
            user_id: None,
            language_code: None,
            payload: Payload::MyChatMember(MembershipChange {
                member: UserId(1),
                old_status: "left".to_string(),
                new_status: "member".to_string(),
            }),
        }
    }
}
