//! Job records: one attempt at driving a story to a merged branch.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::permission::Fingerprint;

/// Lifecycle state of a job.
///
/// Transitions only move along the edges defined in [`crate::core::transition`];
/// `Merged` and `Blocked` are terminal. Retrying a story requires a new job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created by the scheduler; no work started yet.
    Claimed,
    /// A pass is generating a change.
    Generating,
    /// A pass is running the test suite.
    TestingPass,
    /// Suspended on a pending clarification question.
    AwaitingAnswer,
    /// Suspended on a pending permission record.
    AwaitingPermission,
    /// All tests green; pull request opened (or about to be).
    ReadyForReview,
    /// A rebase-merge attempt is in flight.
    Merging,
    /// Rebase conflicted; a human re-approval is required to retry.
    NeedsReReview,
    /// Terminal success.
    Merged,
    /// Terminal failure; `block_cause` explains why.
    Blocked,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Merged | JobState::Blocked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Claimed => "claimed",
            JobState::Generating => "generating",
            JobState::TestingPass => "testing_pass",
            JobState::AwaitingAnswer => "awaiting_answer",
            JobState::AwaitingPermission => "awaiting_permission",
            JobState::ReadyForReview => "ready_for_review",
            JobState::Merging => "merging",
            JobState::NeedsReReview => "needs_re_review",
            JobState::Merged => "merged",
            JobState::Blocked => "blocked",
        }
    }
}

/// Why a job reached `Blocked`.
///
/// Every terminal failure carries one of these so the operator can see the
/// originating cause without digging through logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BlockCause {
    MaxPassesExceeded {
        passes: u32,
        last_failure: Option<String>,
    },
    QuestionExpired {
        question_id: u64,
    },
    PermissionDenied {
        fingerprint: Fingerprint,
    },
    MergeFailed {
        detail: String,
    },
    Cancelled,
    CollaboratorFailure {
        detail: String,
    },
}

impl fmt::Display for BlockCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockCause::MaxPassesExceeded { passes, last_failure } => {
                write!(f, "tests still failing after {passes} passes")?;
                if let Some(failure) = last_failure {
                    write!(f, "; last failure: {}", first_line(failure))?;
                }
                Ok(())
            }
            BlockCause::QuestionExpired { question_id } => {
                write!(f, "question {question_id} expired without an answer")
            }
            BlockCause::PermissionDenied { fingerprint } => {
                write!(f, "permission denied for artifact {fingerprint}")
            }
            BlockCause::MergeFailed { detail } => {
                write!(f, "merge failed: {}", first_line(detail))
            }
            BlockCause::Cancelled => write!(f, "cancelled by operator"),
            BlockCause::CollaboratorFailure { detail } => {
                write!(f, "collaborator failure: {}", first_line(detail))
            }
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

/// One attempt at a story. At most one non-terminal job exists per story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub story_id: u64,
    pub story_title: String,
    pub story_body: String,
    pub story_labels: Vec<String>,
    pub state: JobState,
    /// Passes consumed so far; incremented on pass/fail, never on gate waits.
    pub passes_used: u32,
    pub branch: String,
    pub base_branch: String,
    pub pr_number: Option<u64>,
    /// Failure summary from the previous pass, fed into the next pass context.
    pub last_failure: Option<String>,
    /// Fingerprint the job is suspended on while in `AwaitingPermission`.
    pub pending_fingerprint: Option<Fingerprint>,
    pub block_cause: Option<BlockCause>,
    /// Set by `cancel`; honored at the next suspension-point boundary.
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(JobState::Merged.is_terminal());
        assert!(JobState::Blocked.is_terminal());
        assert!(!JobState::Claimed.is_terminal());
        assert!(!JobState::NeedsReReview.is_terminal());
    }

    #[test]
    fn block_cause_display_keeps_first_line_of_detail() {
        let cause = BlockCause::MergeFailed {
            detail: "fatal: not a git repository\nsecond line".to_string(),
        };
        let rendered = cause.to_string();
        assert!(rendered.contains("not a git repository"));
        assert!(!rendered.contains("second line"));
    }

    #[test]
    fn max_passes_display_mentions_pass_count() {
        let cause = BlockCause::MaxPassesExceeded {
            passes: 5,
            last_failure: Some("assertion failed: totals".to_string()),
        };
        let rendered = cause.to_string();
        assert!(rendered.contains("5 passes"));
        assert!(rendered.contains("assertion failed"));
    }
}
