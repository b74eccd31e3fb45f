//! Bounded frame log
//!
//! Ordered record of every frame sent or received on a connection. The log is a FIFO
//! ring: once `capacity` entries are held, appending evicts the oldest one. Reads are
//! newest-first. Durability is not handled here; the charge point forwards appended
//! entries to its persister.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ocpp::{Frame, FrameKind};

/// Default number of entries kept
pub const DEFAULT_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub frame: Frame,
}

impl LogEntry {
    pub fn new(direction: Direction, frame: Frame) -> Self {
        Self {
            timestamp: Utc::now(),
            direction,
            frame,
        }
    }

    /// One-line rendering used by the CLI traffic view
    pub fn summary(&self) -> String {
        format!(
            "{} {:<3} {:<10} {} {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.direction,
            self.frame.kind(),
            self.frame.action(),
            self.frame.id()
        )
    }
}

/// Selection over the log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub direction: Option<Direction>,
    pub kind: Option<FrameKind>,
    /// Case-insensitive substring of "{action} {id}"
    pub query: String,
}

impl LogFilter {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if self.direction.is_some_and(|d| d != entry.direction) {
            return false;
        }
        if self.kind.is_some_and(|k| k != entry.frame.kind()) {
            return false;
        }
        let query = self.query.trim();
        if query.is_empty() {
            return true;
        }
        let haystack = format!("{} {}", entry.frame.action(), entry.frame.id()).to_lowercase();
        haystack.contains(&query.to_lowercase())
    }
}

#[derive(Debug, Clone)]
pub struct FrameLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    paused: bool,
}

impl Default for FrameLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl FrameLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            paused: false,
        }
    }

    /// Record an entry. Returns false if the log is paused and the entry was dropped.
    pub fn append(&mut self, entry: LogEntry) -> bool {
        if self.paused {
            return false;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        true
    }

    /// Entries, most recent first
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.iter().rev().cloned().collect()
    }

    /// Matching entries, most recent first
    pub fn filtered(&self, filter: &LogFilter) -> Vec<LogEntry> {
        self.entries
            .iter()
            .rev()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Replace the contents with persisted entries given most recent first
    pub fn restore(&mut self, newest_first: Vec<LogEntry>) {
        self.entries = newest_first
            .into_iter()
            .take(self.capacity)
            .rev()
            .collect();
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Pretty JSON of entries for download/export
pub fn export(entries: &[LogEntry]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(entries)
}
