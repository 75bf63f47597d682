use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::update::{ChatId, Update};

pub const DEFAULT_MAILBOX_CAPACITY: usize = 10;

struct Mailbox {
    tx: mpsc::Sender<Update>,
    rx: Mutex<mpsc::Receiver<Update>>,
}

/// Bounded FIFO buffer of pending updates per chat.
///
/// The admission loop is the only producer and the scheduling loop the
/// only consumer. Mailboxes are created on first use and live for the
/// rest of the process.
pub struct Mailboxes {
    capacity: usize,
    boxes: Mutex<HashMap<ChatId, Arc<Mailbox>>>,
}

impl Mailboxes {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            boxes: Mutex::new(HashMap::new()),
        }
    }

    fn get_or_create(&self, chat_id: ChatId) -> Arc<Mailbox> {
        let mut boxes = self.boxes.lock().unwrap_or_else(|e| e.into_inner());
        boxes
            .entry(chat_id)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.capacity);
                Arc::new(Mailbox {
                    tx,
                    rx: Mutex::new(rx),
                })
            })
            .clone()
    }

    /// Appends an update to its chat's mailbox, waiting while it is full.
    pub async fn deliver(&self, update: Update) -> Result<()> {
        let mailbox = self.get_or_create(update.chat_id);
        mailbox
            .tx
            .send(update)
            .await
            .map_err(|e| Error::state(format!("mailbox for chat {}", e.0.chat_id)))
    }

    /// Pops the oldest pending update of a chat without waiting.
    pub fn take(&self, chat_id: ChatId) -> Option<Update> {
        let mailbox = {
            let boxes = self.boxes.lock().unwrap_or_else(|e| e.into_inner());
            boxes.get(&chat_id)?.clone()
        };
        let mut rx = mailbox.rx.lock().unwrap_or_else(|e| e.into_inner());
        rx.try_recv().ok()
    }

    /// Number of updates waiting for a chat.
    pub fn pending(&self, chat_id: ChatId) -> usize {
        let boxes = self.boxes.lock().unwrap_or_else(|e| e.into_inner());
        boxes
            .get(&chat_id)
            .map_or(0, |m| m.tx.max_capacity() - m.tx.capacity())
    }

    pub fn chats(&self) -> usize {
        self.boxes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for Mailboxes {
    fn default() -> Self {
        Self::new(DEFAULT_MAILBOX_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::update::fixtures;

    #[tokio::test]
    async fn test_fifo_per_chat() {
        let mailboxes = Mailboxes::new(4);
        for id in 1..=3 {
            mailboxes.deliver(fixtures::text(id, 10, 1, "m")).await.unwrap();
        }
        mailboxes.deliver(fixtures::text(9, 20, 1, "m")).await.unwrap();

        assert_eq!(mailboxes.chats(), 2);
        assert_eq!(mailboxes.pending(ChatId(10)), 3);
        let order: Vec<u32> = std::iter::from_fn(|| mailboxes.take(ChatId(10)))
            .map(|u| u.id)
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(mailboxes.take(ChatId(20)).map(|u| u.id), Some(9));
    }

    #[tokio::test]
    async fn test_take_unknown_chat() {
        let mailboxes = Mailboxes::default();
        assert!(mailboxes.take(ChatId(1)).is_none());
        assert_eq!(mailboxes.pending(ChatId(1)), 0);
    }

    #[tokio::test]
    async fn test_full_mailbox_applies_backpressure() {
        let mailboxes = Arc::new(Mailboxes::new(1));
        mailboxes.deliver(fixtures::text(1, 10, 1, "a")).await.unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            mailboxes.deliver(fixtures::text(2, 10, 1, "b")),
        )
        .await;
        assert!(blocked.is_err());

        let producer = {
            let mailboxes = Arc::clone(&mailboxes);
            tokio::spawn(async move { mailboxes.deliver(fixtures::text(3, 10, 1, "c")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mailboxes.take(ChatId(10)).map(|u| u.id), Some(1));
        producer.await.unwrap().unwrap();
        assert_eq!(mailboxes.take(ChatId(10)).map(|u| u.id), Some(3));
    }
}
