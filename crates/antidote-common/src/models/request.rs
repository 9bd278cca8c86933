//! Lifecycle commands

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of lifecycle operation
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    /// Provision a new lab
    Create,
    /// Reconfigure an existing lab for a new stage
    Modify,
    /// Tear a lab down
    Delete,
    /// Keep-alive; refreshes last activity only
    Boop,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Modify => write!(f, "MODIFY"),
            Self::Delete => write!(f, "DELETE"),
            Self::Boop => write!(f, "BOOP"),
        }
    }
}

/// A lifecycle command, immutable once dispatched
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LessonScheduleRequest {
    /// What to do
    pub operation: OperationType,
    /// Lesson the lab instantiates
    pub lesson_slug: String,
    /// Target lab
    #[serde(rename = "liveLessonID")]
    pub live_lesson_id: String,
    /// Owning session
    #[serde(rename = "liveSessionID")]
    pub live_session_id: String,
    /// Content stage requested
    pub stage: u32,
    /// When the request was issued
    pub created: DateTime<Utc>,
}
