//! Built-in page back / page forward callbacks for keyboards produced by
//! [`super::keyboard`].

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use super::Context;
use crate::error::Error;
use crate::storage::{KeyboardInfo, MessageStorage};
use crate::transport::{EditOptions, SendOptions, Transport};
use crate::update::{ChatId, MessageId};

/// Callback prefixes; must not contain `_`.
pub const PAGE_BACK: &str = "page-back";
pub const PAGE_NEXT: &str = "page-next";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Back,
    Next,
}

impl Step {
    fn apply(self, position: usize, pages: usize) -> Option<usize> {
        match self {
            Step::Back => position.checked_sub(1),
            Step::Next => Some(position + 1).filter(|next| *next < pages),
        }
    }
}

/// Sends `text` with the first page of `keyboard` and records what the
/// page callbacks need to flip through it later.
pub async fn send_paged(
    transport: &dyn Transport,
    messages: &dyn MessageStorage,
    chat_id: ChatId,
    text: &str,
    keyboard: &KeyboardInfo,
) -> crate::error::Result<MessageId> {
    let first = keyboard
        .keyboards
        .get(keyboard.current_position)
        .cloned()
        .ok_or_else(|| Error::state("keyboard page"))?;
    let message_id = transport
        .send_message(chat_id, text, SendOptions::inline(first))
        .await?;
    messages.save_user_message(chat_id, message_id, true).await?;
    messages
        .save_keyboard_info(chat_id, message_id, keyboard)
        .await?;
    Ok(message_id)
}

#[derive(Clone)]
pub(crate) struct Pagination {
    transport: Arc<dyn Transport>,
    messages: Arc<dyn MessageStorage>,
}

impl Pagination {
    pub(crate) fn new(transport: Arc<dyn Transport>, messages: Arc<dyn MessageStorage>) -> Self {
        Self {
            transport,
            messages,
        }
    }

    pub(crate) async fn turn(&self, ctx: Context, step: Step) -> Result<()> {
        let chat_id = ctx.chat_id;
        let message_id = ctx
            .update
            .message_id()
            .ok_or_else(|| Error::state("callback message id"))?;

        let history = self.messages.get_user_messages(chat_id).await?;
        let Some(info) = history.iter().find(|m| m.message_id == message_id) else {
            warn!(%chat_id, message_id = message_id.0, "paged message not found in history");
            return Ok(());
        };
        if !info.inline_keyboard {
            warn!(%chat_id, message_id = message_id.0, "message has no inline keyboard");
            return Ok(());
        }

        let mut keyboard = self
            .messages
            .get_keyboard_info(chat_id, message_id)
            .await?;
        let Some(position) = step.apply(keyboard.current_position, keyboard.keyboards.len())
        else {
            warn!(
                %chat_id,
                ?step,
                position = keyboard.current_position,
                pages = keyboard.keyboards.len(),
                "keyboard page out of range"
            );
            return Ok(());
        };
        let Some(page) = keyboard.keyboards.get(position).cloned() else {
            return Ok(());
        };

        self.transport
            .edit_message(chat_id, message_id, EditOptions::keyboard(page))
            .await?;
        keyboard.current_position = position;
        self.messages
            .save_keyboard_info(chat_id, message_id, &keyboard)
            .await?;

        if let Some(query) = ctx.update.callback() {
            self.transport.answer_callback(&query.id, None).await?;
        }
        debug!(%chat_id, position, "keyboard page switched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::router::keyboard::build_inline_data_keyboard;
    use crate::storage::InMemoryStorage;
    use crate::transport::mock::{Call, RecordingTransport};
    use crate::update::fixtures;

    struct Fixture {
        transport: Arc<RecordingTransport>,
        storage: Arc<InMemoryStorage>,
        pagination: Pagination,
        keyboard: KeyboardInfo,
        message_id: MessageId,
    }

    async fn fixture() -> Fixture {
        let transport = Arc::new(RecordingTransport::new());
        let storage = Arc::new(InMemoryStorage::new());
        let keys: Vec<String> = (1..=5).map(|i| format!("k{i}")).collect();
        let data: HashMap<String, String> =
            keys.iter().map(|k| (k.clone(), format!("v_{k}"))).collect();
        let keyboard = build_inline_data_keyboard(&keys, &data, 2).unwrap();
        let message_id = send_paged(
            transport.as_ref(),
            storage.as_ref(),
            ChatId(10),
            "pick one",
            &keyboard,
        )
        .await
        .unwrap();

        Fixture {
            pagination: Pagination::new(transport.clone(), storage.clone()),
            transport,
            storage,
            keyboard,
            message_id,
        }
    }

    fn click(message_id: MessageId, prefix: &str) -> Context {
        let update = fixtures::callback(2, 10, 5, &format!("{prefix}_1"), message_id.0);
        Context::new(update, "en", CancellationToken::new())
    }

    async fn position(f: &Fixture) -> usize {
        f.storage
            .get_keyboard_info(ChatId(10), f.message_id)
            .await
            .unwrap()
            .current_position
    }

    fn edits(f: &Fixture) -> Vec<EditOptions> {
        f.transport
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Edit { options, .. } => Some(options),
                _ => None,
            })
            .collect()
    }

    #[rstest::rstest]
    #[case(Step::Back, 0, 3, None)]
    #[case(Step::Back, 2, 3, Some(1))]
    #[case(Step::Next, 0, 3, Some(1))]
    #[case(Step::Next, 2, 3, None)]
    fn test_step_bounds(
        #[case] step: Step,
        #[case] position: usize,
        #[case] pages: usize,
        #[case] expected: Option<usize>,
    ) {
        assert_eq!(step.apply(position, pages), expected);
    }

    #[tokio::test]
    async fn test_back_from_first_page_rejected() {
        let f = fixture().await;
        f.pagination
            .turn(click(f.message_id, PAGE_BACK), Step::Back)
            .await
            .unwrap();
        assert_eq!(position(&f).await, 0);
        assert!(edits(&f).is_empty());
    }

    #[tokio::test]
    async fn test_forward_then_last_page_rejected() {
        let f = fixture().await;
        for expected in [1, 2] {
            f.pagination
                .turn(click(f.message_id, PAGE_NEXT), Step::Next)
                .await
                .unwrap();
            assert_eq!(position(&f).await, expected);
        }
        f.pagination
            .turn(click(f.message_id, PAGE_NEXT), Step::Next)
            .await
            .unwrap();
        assert_eq!(position(&f).await, 2);

        let edits = edits(&f);
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[1].keyboard.as_ref(), Some(&f.keyboard.keyboards[2]));
    }

    #[tokio::test]
    async fn test_unknown_message_ignored() {
        let f = fixture().await;
        f.pagination
            .turn(click(MessageId(1), PAGE_NEXT), Step::Next)
            .await
            .unwrap();
        assert_eq!(position(&f).await, 0);
        assert!(edits(&f).is_empty());
    }
}
