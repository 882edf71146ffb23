//! High-level transcript extracted from the raw byte stream.
//!
//! User entries are recorded when input is injected; assistant entries are
//! captured from the scrollback slice when the detector reports a
//! working-to-idle transition.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detector::strip_terminal_controls;

/// Who produced a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One transcript record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: String,
}

/// Bounded ring of transcript entries; oldest entries drop when full.
#[derive(Debug)]
pub struct Transcript {
    entries: VecDeque<TranscriptEntry>,
    max_entries: usize,
}

impl Transcript {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Records a user input entry. Trailing carriage returns are stripped;
    /// empty content is not recorded. Returns whether an entry was added.
    pub fn record_user(&mut self, data: &str) -> bool {
        let content = data.trim_end_matches('\r');
        if content.is_empty() {
            return false;
        }
        self.push(Role::User, content.to_string());
        true
    }

    /// Records an assistant entry from a raw scrollback slice.
    ///
    /// Terminal control bytes are stripped and surrounding whitespace is
    /// trimmed; empty results are dropped. Returns whether an entry was added.
    pub fn record_assistant(&mut self, raw: &[u8]) -> bool {
        let text = strip_terminal_controls(raw);
        let content = text.trim();
        if content.is_empty() {
            return false;
        }
        self.push(Role::Assistant, content.to_string());
        true
    }

    fn push(&mut self, role: Role, content: String) {
        while self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(TranscriptEntry {
            timestamp: Utc::now(),
            role,
            content,
        });
    }

    /// Defensive copy of all entries, oldest first.
    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
