//! Shared signal types reported back to the job controller.

use serde::{Deserialize, Serialize};

/// Classification of one pass-loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassSignal {
    /// All tests passed.
    Passed,
    /// Some tests failed; the failure summary feeds the next pass.
    Failed,
    /// Generation cannot proceed without a human answer.
    BlockedQuestion,
    /// Generation produced an artifact that is not approved for execution.
    BlockedPermission,
}

/// Classification of one rebase-merge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeSignal {
    /// Rebase applied cleanly and the merge completed.
    Clean,
    /// Rebase hit conflicts; the attempt was aborted, a human must re-review.
    Conflict,
    /// The merge could not be completed for a reason other than conflicts.
    Failed,
}

/// Human decision on a permission record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Approved,
    Denied,
}

/// Verdict from one test-suite run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestVerdict {
    pub passed: bool,
    /// Tail of the test output when `passed` is false; empty otherwise.
    pub failure_summary: String,
}
