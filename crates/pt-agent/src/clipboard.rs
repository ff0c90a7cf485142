//! In-memory clipboard history shared by all connections

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use pt_core::time::current_time_millis;
use pt_core::ConnectionId;
use pt_protocol::ClipboardEntry;

/// Bounded history; the oldest entry is dropped when full
pub struct ClipboardHistory {
    entries: Mutex<VecDeque<ClipboardEntry>>,
    limit: usize,
    next_id: AtomicU64,
}

impl ClipboardHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(limit)),
            limit: limit.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Record content copied by `source`. Content is already size-checked.
    pub fn push(&self, content: String, source: &ConnectionId) -> ClipboardEntry {
        let entry = ClipboardEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            content,
            source_connection: source.to_string(),
            created_at: current_time_millis(),
        };

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= self.limit {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
        entry
    }

    /// Up to `limit` entries, newest first
    pub fn recent(&self, limit: Option<usize>) -> Vec<ClipboardEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let take = limit.unwrap_or(entries.len());
        entries.iter().rev().take(take).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded_and_newest_first() {
        let history = ClipboardHistory::new(2);
        let source = ConnectionId::from("c1");
        history.push("one".to_string(), &source);
        history.push("two".to_string(), &source);
        let third = history.push("three".to_string(), &source);

        assert_eq!(history.len(), 2);
        assert_eq!(third.id, 3);
        assert_eq!(third.source_connection, "c1");

        let recent = history.recent(None);
        assert_eq!(recent[0].content, "three");
        assert_eq!(recent[1].content, "two");
        assert_eq!(history.recent(Some(1)).len(), 1);
    }
}
