//! Bounded per-session message history.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default number of retained messages.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Whether a message was published by this session or delivered to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

/// One history entry, also the payload of the `message` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntry {
    #[serde(rename = "type")]
    pub direction: Direction,
    pub channel: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl MessageEntry {
    pub fn new(direction: Direction, channel: impl Into<String>, data: Value) -> Self {
        Self {
            direction,
            channel: channel.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// FIFO buffer keeping the most recent `limit` messages.
#[derive(Debug, Clone)]
pub struct MessageHistory {
    entries: VecDeque<MessageEntry>,
    limit: usize,
}

impl MessageHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit.min(DEFAULT_HISTORY_LIMIT)),
            limit,
        }
    }

    /// Append an entry, evicting the oldest ones beyond the limit.
    pub fn push(&mut self, entry: MessageEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    /// All retained entries, oldest first.
    pub fn snapshot(&self) -> Vec<MessageEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}
