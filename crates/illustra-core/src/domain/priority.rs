//! Task priority classes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Precedence class controlling dequeue order.
///
/// Lower ordinal is served first: `Critical < High < Medium < Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl Priority {
    /// Priority of a page task by its 1-based position in the story.
    ///
    /// Page 1 blocks the reading experience, so it is Critical; page 2 is
    /// High, pages 3-4 Medium, everything after Low.
    pub fn for_page(page_number: u32) -> Self {
        match page_number {
            0 | 1 => Priority::Critical,
            2 => Priority::High,
            3 | 4 => Priority::Medium,
            _ => Priority::Low,
        }
    }

    /// Priority of a user-requested retry: the first page jumps to Critical,
    /// any other page to High.
    pub fn for_manual_retry(page_number: u32) -> Self {
        if page_number <= 1 {
            Priority::Critical
        } else {
            Priority::High
        }
    }

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(Priority::Critical),
            1 => Some(Priority::High),
            2 => Some(Priority::Medium),
            3 => Some(Priority::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        f.write_str(name)
    }
}
