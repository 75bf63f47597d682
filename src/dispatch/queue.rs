use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::update::ChatId;

/// Admission records in arrival order. A chat appears once per admitted
/// update that has not been dispatched yet.
#[derive(Debug, Default)]
pub struct FairnessQueue {
    records: VecDeque<ChatId>,
}

impl FairnessQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chat_id: ChatId) {
        self.records.push_back(chat_id);
    }

    /// Removes the first record for `chat_id`. Returns whether one existed.
    pub fn omit(&mut self, chat_id: ChatId) -> bool {
        match self.records.iter().position(|c| *c == chat_id) {
            Some(idx) => {
                self.records.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Takes the first record whose chat is not in `busy`.
    fn take_first_not_in(&mut self, busy: &HashSet<ChatId>) -> Option<ChatId> {
        let idx = self.records.iter().position(|c| !busy.contains(c))?;
        self.records.remove(idx)
    }

    pub fn head(&self) -> Option<ChatId> {
        self.records.front().copied()
    }

    pub fn tail(&self) -> Option<ChatId> {
        self.records.back().copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ChatId> + '_ {
        self.records.iter().copied()
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    queue: FairnessQueue,
    in_flight: HashSet<ChatId>,
}

/// Pairs the fairness queue with the set of chats a worker currently
/// holds. One lock covers both so that picking a chat and marking it
/// busy is a single step.
#[derive(Debug, Default)]
pub struct InFlightTracker {
    state: Mutex<TrackerState>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, chat_id: ChatId) {
        self.lock().queue.push(chat_id);
    }

    /// Scans records in arrival order and claims the first chat no worker
    /// holds. The claimed record leaves the queue.
    pub fn next_eligible(&self) -> Option<ChatId> {
        let mut state = self.lock();
        let TrackerState { queue, in_flight } = &mut *state;
        let chat_id = queue.take_first_not_in(in_flight)?;
        in_flight.insert(chat_id);
        Some(chat_id)
    }

    /// Clears the in-flight mark; queued records for the chat stay.
    pub fn release(&self, chat_id: ChatId) {
        self.lock().in_flight.remove(&chat_id);
    }

    pub fn omit(&self, chat_id: ChatId) -> bool {
        self.lock().queue.omit(chat_id)
    }

    pub fn is_in_flight(&self, chat_id: ChatId) -> bool {
        self.lock().in_flight.contains(&chat_id)
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn queue_of(chats: &[i64]) -> FairnessQueue {
        let mut queue = FairnessQueue::new();
        for chat in chats {
            queue.push(ChatId(*chat));
        }
        queue
    }

    fn ids(queue: &FairnessQueue) -> Vec<i64> {
        queue.iter().map(|c| c.0).collect()
    }

    #[test]
    fn test_push_keeps_arrival_order() {
        let queue = queue_of(&[1, 2]);
        assert_eq!(queue.head(), Some(ChatId(1)));
        assert_eq!(queue.tail(), Some(ChatId(2)));
        assert_eq!(ids(&queue), vec![1, 2]);
    }

    #[rstest]
    #[case::first_of_two(&[1, 2], 1, &[2])]
    #[case::last_of_two(&[1, 2], 2, &[1])]
    #[case::middle_of_three(&[1, 2, 3], 2, &[1, 3])]
    #[case::only_first_duplicate(&[1, 2, 1], 1, &[2, 1])]
    fn test_omit(#[case] pushed: &[i64], #[case] omitted: i64, #[case] expected: &[i64]) {
        let mut queue = queue_of(pushed);
        assert!(queue.omit(ChatId(omitted)));
        assert_eq!(ids(&queue), expected);
        assert_eq!(queue.head(), expected.first().map(|c| ChatId(*c)));
        assert_eq!(queue.tail(), expected.last().map(|c| ChatId(*c)));
    }

    #[test]
    fn test_omit_single_and_missing() {
        let mut queue = queue_of(&[5]);
        assert!(!queue.omit(ChatId(6)));
        assert!(queue.omit(ChatId(5)));
        assert!(queue.is_empty());
        assert_eq!(queue.head(), None);
        assert_eq!(queue.tail(), None);
        assert!(!queue.omit(ChatId(5)));
    }

    #[test]
    fn test_next_eligible_skips_busy_chats() {
        let tracker = InFlightTracker::new();
        for chat in [1, 2, 3, 1] {
            tracker.push(ChatId(chat));
        }

        assert_eq!(tracker.next_eligible(), Some(ChatId(1)));
        assert_eq!(tracker.next_eligible(), Some(ChatId(2)));
        assert_eq!(tracker.next_eligible(), Some(ChatId(3)));
        assert_eq!(tracker.next_eligible(), None);

        tracker.release(ChatId(1));
        assert_eq!(tracker.next_eligible(), Some(ChatId(1)));
        assert_eq!(tracker.queued(), 0);
    }

    #[test]
    fn test_release_does_not_drop_records() {
        let tracker = InFlightTracker::new();
        tracker.push(ChatId(9));
        tracker.push(ChatId(9));
        assert_eq!(tracker.next_eligible(), Some(ChatId(9)));
        tracker.release(ChatId(9));
        assert!(!tracker.is_in_flight(ChatId(9)));
        assert_eq!(tracker.queued(), 1);
    }

    #[test]
    fn test_never_returns_in_flight_chat() {
        let tracker = InFlightTracker::new();
        let pushes = [4, 4, 7, 4, 7, 8, 8, 4, 1, 7];
        for chat in pushes {
            tracker.push(ChatId(chat));
        }

        let mut held = HashSet::new();
        let mut served = 0;
        for round in 0..50 {
            while let Some(chat) = tracker.next_eligible() {
                assert!(held.insert(chat), "chat {chat} handed out twice");
                served += 1;
            }
            // release a different subset each round
            let release: Vec<_> = held.iter().copied().filter(|c| (c.0 + round) % 2 == 0).collect();
            for chat in release {
                held.remove(&chat);
                tracker.release(chat);
            }
            if round % 3 == 2 {
                for chat in held.drain() {
                    tracker.release(chat);
                }
            }
        }
        assert_eq!(served, pushes.len());
        assert_eq!(tracker.queued(), 0);
    }
}
