//! Chat ring buffer. Capacity-bounded, FIFO eviction, content length
//! enforced at insert.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use nanoid::nanoid;
use signaling_proto::common::ChatEntry;

use crate::errors::RoomError;

const MIN_CONTENT_BYTES: usize = 1;
const MAX_CONTENT_BYTES: usize = 1000;

pub struct ChatRing {
    capacity: usize,
    entries: VecDeque<ChatEntry>,
}

impl ChatRing {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: VecDeque::with_capacity(capacity) }
    }

    pub fn add(&mut self, sender_id: &str, sender_name: &str, content: String) -> Result<ChatEntry, RoomError> {
        let len = content.len();
        if len < MIN_CONTENT_BYTES || len > MAX_CONTENT_BYTES {
            return Err(RoomError::ChatContentInvalid(len));
        }

        let entry = ChatEntry {
            chat_id: nanoid!(),
            sender_id: sender_id.to_owned(),
            sender_name: sender_name.to_owned(),
            timestamp_millis: now_millis(),
            content,
        };

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry.clone());
        Ok(entry)
    }

    /// Deletion by the sender is always allowed; deletion by a host is
    /// always allowed; a second delete of an already-gone id is a no-op
    /// (idempotent by design).
    pub fn delete(&mut self, requester_id: &str, chat_id: &str, requester_is_host: bool) -> Result<(), RoomError> {
        let Some(position) = self.entries.iter().position(|entry| entry.chat_id == chat_id) else {
            return Ok(());
        };

        let entry = &self.entries[position];
        if entry.sender_id != requester_id && !requester_is_host {
            return Err(RoomError::InsufficientRole);
        }

        self.entries.remove(position);
        Ok(())
    }

    pub fn recent(&self, limit: u32) -> Vec<ChatEntry> {
        let limit = limit as usize;
        self.entries.iter().rev().take(limit.max(1)).rev().cloned().collect()
    }
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_recent_contains_the_entry() {
        let mut ring = ChatRing::new(10);
        let entry = ring.add("u1", "Ada", "hello".to_owned()).unwrap();
        let recent = ring.recent(5);
        assert!(recent.iter().any(|e| e.chat_id == entry.chat_id));
    }

    #[test]
    fn oversized_content_is_rejected() {
        let mut ring = ChatRing::new(10);
        let content = "a".repeat(MAX_CONTENT_BYTES + 1);
        assert!(ring.add("u1", "Ada", content).is_err());
    }

    #[test]
    fn empty_content_is_rejected() {
        let mut ring = ChatRing::new(10);
        assert!(ring.add("u1", "Ada", String::new()).is_err());
    }

    #[test]
    fn ring_evicts_oldest_entry_past_capacity() {
        let mut ring = ChatRing::new(2);
        let first = ring.add("u1", "Ada", "one".to_owned()).unwrap();
        ring.add("u1", "Ada", "two".to_owned()).unwrap();
        ring.add("u1", "Ada", "three".to_owned()).unwrap();

        let recent = ring.recent(10);
        assert_eq!(recent.len(), 2);
        assert!(!recent.iter().any(|e| e.chat_id == first.chat_id));
    }

    #[test]
    fn non_sender_non_host_delete_is_rejected() {
        let mut ring = ChatRing::new(10);
        let entry = ring.add("u1", "Ada", "hi".to_owned()).unwrap();
        assert!(ring.delete("u2", &entry.chat_id, false).is_err());
    }

    #[test]
    fn deleting_an_already_deleted_id_is_a_no_op() {
        let mut ring = ChatRing::new(10);
        let entry = ring.add("u1", "Ada", "hi".to_owned()).unwrap();
        ring.delete("u1", &entry.chat_id, false).unwrap();
        assert!(ring.delete("u1", &entry.chat_id, false).is_ok());
    }
}
