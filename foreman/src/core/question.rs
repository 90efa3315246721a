//! Clarification questions a job asks a human while it is suspended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a clarification question.
///
/// `Answered` and `Expired` are final: once reached, the status is immutable
/// and a late answer is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionStatus {
    Pending,
    Answered,
    Expired,
}

/// One paused clarification owned by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: u64,
    pub job_id: u64,
    pub prompt: String,
    pub status: QuestionStatus,
    pub answer: Option<String>,
    pub asked_at: DateTime<Utc>,
    /// Wall-clock deadline set at gate entry; re-checked on every resume.
    pub deadline: DateTime<Utc>,
}

impl Question {
    pub fn is_pending(&self) -> bool {
        self.status == QuestionStatus::Pending
    }

    /// True if the question is still pending but its deadline has elapsed.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && now > self.deadline
    }
}
