//! Task and page status state machines.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an illustration task.
///
/// State transitions:
/// - Pending -> Scheduled -> Generating -> Ready
/// - Generating -> Retrying(n) -> Generating (loop until the attempt cap)
/// - Generating -> Failed, Retrying(n) -> Failed
///
/// Restoring after a restart resets Scheduled/Generating/Retrying back to
/// Pending; that is a reset, not a regular transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created but not yet admitted into the scheduler.
    Pending,

    /// Admitted and waiting for a worker.
    Scheduled,

    /// A worker is calling the generation client.
    Generating,

    /// The last attempt failed transiently; waiting out the backoff.
    Retrying { attempt: u32 },

    /// Artifact stored and recorded.
    Ready,

    /// Attempts exhausted or a permanent error.
    Failed { reason: String },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Ready | TaskStatus::Failed { .. })
    }

    /// Statuses that only make sense while this process owns the task.
    /// They cannot have survived a restart honestly.
    pub fn is_in_flight_marker(&self) -> bool {
        matches!(
            self,
            TaskStatus::Scheduled | TaskStatus::Generating | TaskStatus::Retrying { .. }
        )
    }

    pub fn can_transition_to(&self, next: &TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Scheduled)
                | (Scheduled, Generating)
                | (Retrying { .. }, Generating)
                | (Retrying { .. }, Failed { .. })
                | (Generating, Ready)
                | (Generating, Retrying { .. })
                | (Generating, Failed { .. })
        )
    }

    /// Storage discriminant.
    pub fn kind_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Generating => "generating",
            TaskStatus::Retrying { .. } => "retrying",
            TaskStatus::Ready => "ready",
            TaskStatus::Failed { .. } => "failed",
        }
    }

    pub fn retry_attempt(&self) -> Option<u32> {
        match self {
            TaskStatus::Retrying { attempt } => Some(*attempt),
            _ => None,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            TaskStatus::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    /// Rebuild a status from its storage columns.
    pub fn from_parts(kind: &str, attempt: Option<u32>, reason: Option<String>) -> Option<Self> {
        let status = match kind {
            "pending" => TaskStatus::Pending,
            "scheduled" => TaskStatus::Scheduled,
            "generating" => TaskStatus::Generating,
            "retrying" => TaskStatus::Retrying { attempt: attempt? },
            "ready" => TaskStatus::Ready,
            "failed" => TaskStatus::Failed {
                reason: reason.unwrap_or_default(),
            },
            _ => return None,
        };
        Some(status)
    }

    /// What a page shows for this task. Retrying is still "generating" to the UI.
    pub fn page_status(&self) -> IllustrationStatus {
        match self {
            TaskStatus::Pending => IllustrationStatus::Pending,
            TaskStatus::Scheduled => IllustrationStatus::Scheduled,
            TaskStatus::Generating | TaskStatus::Retrying { .. } => IllustrationStatus::Generating,
            TaskStatus::Ready => IllustrationStatus::Ready,
            TaskStatus::Failed { .. } => IllustrationStatus::Failed,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Retrying { attempt } => write!(f, "retrying({attempt})"),
            TaskStatus::Failed { reason } => write!(f, "failed({reason})"),
            other => f.write_str(other.kind_str()),
        }
    }
}

/// Illustration status as stored on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IllustrationStatus {
    Pending,
    Scheduled,
    Generating,
    Ready,
    Failed,
}

impl IllustrationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IllustrationStatus::Pending => "pending",
            IllustrationStatus::Scheduled => "scheduled",
            IllustrationStatus::Generating => "generating",
            IllustrationStatus::Ready => "ready",
            IllustrationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for IllustrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
